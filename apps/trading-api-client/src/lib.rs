#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::option_if_let_else,
        clippy::items_after_statements,
        clippy::panic
    )
)]

//! Trading API Client - Multiplexed RPC Transport
//!
//! Runs unary requests and server-push subscriptions over a single duplex
//! WebSocket connection, and exposes one pull/push abstraction ([`Streamer`])
//! for both those subscriptions and server-streaming gRPC calls.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Correlation ids, decoded frames, errors, subscription state
//!   - `ids`: request ids and subscription tokens
//!   - `frame`: transport-independent view of an inbound message
//!   - `subscription`: `Pending → Active → Closed` state cell
//!
//! - **Application**: Port definitions and the streaming abstraction
//!   - `ports`: frame source/sink, codec, server-streaming receive
//!   - `streamer`: `Streamer` with `into_sink` and `channel`
//!
//! - **Infrastructure**: Connection core and adapters
//!   - `rpc`: registries, reader and writer tasks, `Connection` facade
//!   - `codec`: JSON-RPC frame codec
//!   - `websocket`: transport (`memory` with the `testing` feature)
//!   - `grpc`: `Streamer` over tonic server-streaming responses
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!  request() ──┐                             ┌──► WebSocket write half
//!  subscribe() ├──► outbound queue ──► writer┘
//!              │
//!   pending ◄──┤                             ┌──◄ WebSocket read half
//!   staging ◄──┼──────────────── reader task ┘
//!   committed ◄┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no transport dependencies.
pub mod domain;

/// Application layer - Ports and the streaming abstraction.
pub mod application;

/// Infrastructure layer - Connection core, adapters and integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::error::{CloseReason, RpcError, ServerError};
pub use domain::frame::{Frame, SUBSCRIPTION_ID_FIELD};
pub use domain::ids::{RequestId, RequestIdAllocator, SubscriptionToken};
pub use domain::subscription::SubscriptionState;

// Ports and streaming
pub use application::ports::{
    CodecError, FrameDecoder, FrameEncoder, FrameSink, FrameSource, StreamRecv, TransportError,
};
pub use application::streamer::Streamer;

// Connection core
pub use infrastructure::rpc::{
    Connection, ConnectionOptions, ConnectionState, DecodeErrorPolicy, Subscription,
};

// Adapters
pub use infrastructure::codec::JsonRpcCodec;
pub use infrastructure::grpc::{RecvStreamer, StreamAdapter};

// Configuration
pub use infrastructure::config::{BenchSettings, ClientConfig, ConfigError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
