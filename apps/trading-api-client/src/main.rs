//! Trading API RPC Bench
//!
//! Measures unary round-trip latency and subscription throughput against a
//! trading API WebSocket endpoint.
//!
//! # Usage
//!
//! ```bash
//! TRADING_API_WS_URL=wss://api.example.com/ws cargo run --bin rpc-bench
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `TRADING_API_WS_URL`: WebSocket endpoint
//!
//! ## Optional
//! - `TRADING_API_REQUEST_TIMEOUT_MS`: per-request deadline, 0 disables (default: 30000)
//! - `TRADING_API_OUTBOUND_QUEUE`: outbound frame queue capacity (default: 256)
//! - `TRADING_API_SUBSCRIPTION_BUFFER`: forwarding channel capacity (default: 64)
//! - `TRADING_API_DECODE_ERRORS`: fatal | skip (default: fatal)
//! - `TRADING_API_JSONRPC_TAG`: write `"jsonrpc": "2.0"` (default: false)
//! - `RPC_BENCH_PING_METHOD` / `RPC_BENCH_PING_PARAMS` / `RPC_BENCH_PING_COUNT`
//! - `RPC_BENCH_SUBSCRIBE_METHOD` / `RPC_BENCH_SUBSCRIBE_PARAMS`
//! - `RPC_BENCH_UNSUBSCRIBE_METHOD` / `RPC_BENCH_STREAM_ITEMS`
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)

use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::{Map, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use trading_api_client::infrastructure::telemetry;
use trading_api_client::{
    BenchSettings, ClientConfig, Connection, SUBSCRIPTION_ID_FIELD, Streamer, init_metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init()?;
    let metrics = init_metrics()?;

    let config = ClientConfig::from_env()?;
    let bench = BenchSettings::from_env()?;
    log_config(&config, &bench);

    let conn = Connection::connect_with_config(&config)
        .await
        .with_context(|| format!("connecting to {}", config.url))?;

    let shutdown_token = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown_token.clone()));

    tokio::select! {
        result = run(&conn, &config, &bench) => result?,
        () = shutdown_token.cancelled() => tracing::info!("Interrupted, shutting down"),
        reason = conn.closed() => anyhow::bail!("connection closed during bench: {reason}"),
    }

    let reason = conn.close().await;
    tracing::info!(%reason, "Connection closed");

    println!("{}", metrics.render());
    Ok(())
}

async fn run(conn: &Connection, config: &ClientConfig, bench: &BenchSettings) -> anyhow::Result<()> {
    let samples = ping_run(conn, bench).await?;
    if let Some(summary) = LatencySummary::from_samples(&samples) {
        tracing::info!(
            method = %bench.ping_method,
            calls = summary.count,
            min_us = summary.min.as_micros(),
            mean_us = summary.mean.as_micros(),
            max_us = summary.max.as_micros(),
            "Unary latency"
        );
    }

    if let Some(method) = &bench.subscribe_method {
        stream_run(conn, config, bench, method).await?;
    }
    Ok(())
}

async fn ping_run(conn: &Connection, bench: &BenchSettings) -> anyhow::Result<Vec<Duration>> {
    let mut samples = Vec::with_capacity(bench.ping_count as usize);
    for _ in 0..bench.ping_count {
        let started = Instant::now();
        conn.request_raw(&bench.ping_method, bench.ping_params.clone())
            .await
            .with_context(|| format!("{} failed", bench.ping_method))?;
        samples.push(started.elapsed());
    }
    Ok(samples)
}

#[allow(clippy::cast_precision_loss)]
async fn stream_run(
    conn: &Connection,
    config: &ClientConfig,
    bench: &BenchSettings,
    method: &str,
) -> anyhow::Result<()> {
    let subscription = conn
        .subscribe::<Value, _>(method, &bench.subscribe_params)
        .await?;
    let token = subscription
        .active()
        .await
        .with_context(|| format!("{method} was not confirmed"))?;
    tracing::info!(%token, "Subscription active");

    let started = Instant::now();
    let mut items = subscription.channel(config.subscription_buffer);
    let mut received: usize = 0;
    while received < bench.stream_items {
        if items.recv().await.is_none() {
            tracing::warn!(received, "Subscription ended early");
            break;
        }
        received += 1;
    }
    let elapsed = started.elapsed();
    drop(items);

    tracing::info!(
        received,
        elapsed_ms = elapsed.as_millis(),
        items_per_sec = received as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        "Subscription throughput"
    );

    if let Some(unsubscribe) = &bench.unsubscribe_method {
        let mut params = Map::new();
        params.insert(
            SUBSCRIPTION_ID_FIELD.to_string(),
            Value::String(token.as_str().to_owned()),
        );
        conn.request_raw(unsubscribe, Value::Object(params)).await?;
    }
    Ok(())
}

/// Min/mean/max over a latency run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LatencySummary {
    count: usize,
    min: Duration,
    mean: Duration,
    max: Duration,
}

impl LatencySummary {
    fn from_samples(samples: &[Duration]) -> Option<Self> {
        let min = samples.iter().min().copied()?;
        let max = samples.iter().max().copied()?;
        let total: Duration = samples.iter().sum();
        let mean = total / u32::try_from(samples.len()).ok()?;
        Some(Self {
            count: samples.len(),
            min,
            mean,
            max,
        })
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig, bench: &BenchSettings) {
    tracing::info!(
        url = %config.url,
        request_timeout = ?config.connection.request_timeout,
        decode_errors = config.connection.decode_errors.as_str(),
        jsonrpc_tag = config.jsonrpc_tag,
        "Configuration loaded"
    );
    tracing::debug!(
        ping_method = %bench.ping_method,
        ping_count = bench.ping_count,
        subscribe_method = ?bench.subscribe_method,
        stream_items = bench.stream_items,
        "Bench plan"
    );
}

/// Wait for SIGINT or SIGTERM.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    shutdown_token.cancel();
}
