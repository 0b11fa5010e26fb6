//! Client Configuration Settings
//!
//! Configuration types for the trading API client, loaded from environment
//! variables.

use std::time::Duration;

use serde_json::Value;

use crate::infrastructure::codec::JsonRpcCodec;
use crate::infrastructure::rpc::{ConnectionOptions, DecodeErrorPolicy};

/// Default capacity of channels handed out by `Streamer::channel`.
const DEFAULT_SUBSCRIPTION_BUFFER: usize = 64;

impl DecodeErrorPolicy {
    /// Parse a policy name (`fatal` or `skip`).
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fatal" => Some(Self::Fatal),
            "skip" | "ignore" => Some(Self::Skip),
            _ => None,
        }
    }

    /// Get the policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Skip => "skip",
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the trading API.
    pub url: String,
    /// Connection tuning.
    pub connection: ConnectionOptions,
    /// Write `"jsonrpc": "2.0"` on every request.
    pub jsonrpc_tag: bool,
    /// Default capacity for subscription forwarding channels.
    pub subscription_buffer: usize,
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `TRADING_API_WS_URL` is missing or empty, or if
    /// `TRADING_API_DECODE_ERRORS` names an unknown policy.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup("TRADING_API_WS_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("TRADING_API_WS_URL".to_string()))?;
        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("TRADING_API_WS_URL".to_string()));
        }

        let defaults = ConnectionOptions::default();

        let decode_errors = match lookup("TRADING_API_DECODE_ERRORS") {
            Some(raw) => DecodeErrorPolicy::from_str_case_insensitive(&raw).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "TRADING_API_DECODE_ERRORS".to_string(),
                    value: raw,
                }
            })?,
            None => defaults.decode_errors,
        };

        let request_timeout = parse_u64(&lookup, "TRADING_API_REQUEST_TIMEOUT_MS")
            .map_or(defaults.request_timeout, |ms| {
                (ms > 0).then(|| Duration::from_millis(ms))
            });

        let connection = ConnectionOptions {
            request_timeout,
            outbound_queue: parse_usize(&lookup, "TRADING_API_OUTBOUND_QUEUE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.outbound_queue),
            decode_errors,
        };

        Ok(Self {
            url: url.trim().to_string(),
            connection,
            jsonrpc_tag: parse_bool(&lookup, "TRADING_API_JSONRPC_TAG").unwrap_or(false),
            subscription_buffer: parse_usize(&lookup, "TRADING_API_SUBSCRIPTION_BUFFER")
                .unwrap_or(DEFAULT_SUBSCRIPTION_BUFFER),
        })
    }

    /// Codec matching this configuration.
    #[must_use]
    pub const fn codec(&self) -> JsonRpcCodec {
        JsonRpcCodec::new().with_version_tag(self.jsonrpc_tag)
    }
}

/// Settings for the `rpc-bench` tool.
#[derive(Debug, Clone)]
pub struct BenchSettings {
    /// Method used for the unary latency run.
    pub ping_method: String,
    /// Params sent with every unary call.
    pub ping_params: Value,
    /// Number of sequential unary calls.
    pub ping_count: u32,
    /// Subscribe method for the streaming run; skipped when unset.
    pub subscribe_method: Option<String>,
    /// Params sent with the subscribe request.
    pub subscribe_params: Value,
    /// Method used to cancel the subscription afterwards.
    pub unsubscribe_method: Option<String>,
    /// Number of pushed items to consume.
    pub stream_items: usize,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            ping_method: "Ping".to_string(),
            ping_params: Value::Object(serde_json::Map::new()),
            ping_count: 100,
            subscribe_method: None,
            subscribe_params: Value::Object(serde_json::Map::new()),
            unsubscribe_method: None,
            stream_items: 1_000,
        }
    }
}

impl BenchSettings {
    /// Create settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a params variable is not valid JSON.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create settings from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            ping_method: non_empty(&lookup, "RPC_BENCH_PING_METHOD")
                .unwrap_or(defaults.ping_method),
            ping_params: parse_json(&lookup, "RPC_BENCH_PING_PARAMS")?
                .unwrap_or(defaults.ping_params),
            ping_count: parse_u64(&lookup, "RPC_BENCH_PING_COUNT")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.ping_count),
            subscribe_method: non_empty(&lookup, "RPC_BENCH_SUBSCRIBE_METHOD"),
            subscribe_params: parse_json(&lookup, "RPC_BENCH_SUBSCRIBE_PARAMS")?
                .unwrap_or(defaults.subscribe_params),
            unsubscribe_method: non_empty(&lookup, "RPC_BENCH_UNSUBSCRIBE_METHOD"),
            stream_items: parse_usize(&lookup, "RPC_BENCH_STREAM_ITEMS")
                .unwrap_or(defaults.stream_items),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be interpreted.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    lookup(key).and_then(|v| match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

fn parse_json(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Value>, ConfigError> {
    match non_empty(lookup, key) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}
