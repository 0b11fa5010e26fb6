//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the connection core and the concrete implementations
//! of the port interfaces defined in the application layer.

/// Multiplexed request/subscription core.
pub mod rpc;

/// JSON-RPC frame codec.
pub mod codec;

/// WebSocket transport adapter.
pub mod websocket;

/// Channel-backed transport pair for tests.
#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// gRPC server-streaming receivers.
pub mod grpc;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
