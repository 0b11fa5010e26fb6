//! Configuration Module
//!
//! Environment-driven configuration for the client and the bench tool.

mod settings;

pub use settings::{BenchSettings, ClientConfig, ConfigError};
