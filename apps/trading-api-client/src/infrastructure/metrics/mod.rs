//! Prometheus Metrics Module
//!
//! Connection-level counters, gauges and histograms recorded through the
//! `metrics` facade. Without an installed recorder every call is a no-op, so
//! library users only pay for what they export.
//!
//! # Metrics Categories
//!
//! - **Frames**: inbound frames received and dropped by reason
//! - **Requests**: unary calls by method and outcome, with latency
//! - **Subscriptions**: currently active push subscriptions
//!
//! # Integration
//!
//! The `rpc-bench` binary installs the Prometheus recorder and prints the
//! rendered snapshot on exit.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe every metric.
///
/// Later calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "trading_api_frames_received_total",
        "Total inbound frames read from the connection"
    );
    describe_counter!(
        "trading_api_frames_dropped_total",
        "Total inbound frames dropped by reason"
    );

    describe_counter!(
        "trading_api_requests_total",
        "Total unary requests by method and outcome"
    );
    describe_histogram!(
        "trading_api_request_duration_seconds",
        "Time from request write to response delivery"
    );
    describe_gauge!(
        "trading_api_pending_requests",
        "Requests awaiting a response"
    );

    describe_gauge!(
        "trading_api_active_subscriptions",
        "Subscriptions confirmed by the server and not yet closed"
    );

    describe_counter!(
        "trading_api_connections_closed_total",
        "Connection teardowns by reason"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why an inbound frame was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The frame referenced no live request or subscription.
    Unroutable,
    /// The frame could not be decoded and the policy is to skip it.
    Undecodable,
    /// The target subscription's consumer is gone.
    ConsumerGone,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Unroutable => "unroutable",
            Self::Undecodable => "undecodable",
            Self::ConsumerGone => "consumer_gone",
        }
    }
}

/// Outcome label for a unary request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Result delivered.
    Ok,
    /// The server answered with an error.
    ServerError,
    /// The caller's deadline elapsed.
    Timeout,
    /// The connection closed first.
    ConnectionClosed,
    /// Local encode/decode failure.
    Codec,
}

impl RequestOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::Codec => "codec",
        }
    }
}

/// Record an inbound frame.
pub fn record_frame_received() {
    counter!("trading_api_frames_received_total").increment(1);
}

/// Record a discarded inbound frame.
pub fn record_frame_dropped(reason: DropReason) {
    counter!(
        "trading_api_frames_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a finished unary request.
pub fn record_request(method: &str, outcome: RequestOutcome, elapsed: Duration) {
    counter!(
        "trading_api_requests_total",
        "method" => method.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!(
        "trading_api_request_duration_seconds",
        "method" => method.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Update the pending request count.
#[allow(clippy::cast_precision_loss)]
pub fn set_pending_requests(count: usize) {
    gauge!("trading_api_pending_requests").set(count as f64);
}

/// Update the active subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("trading_api_active_subscriptions").set(count as f64);
}

/// Record a connection teardown.
pub fn record_connection_closed(reason: &str) {
    counter!(
        "trading_api_connections_closed_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
