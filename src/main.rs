//! Feedmux Binary
//!
//! Starts the market data aggregator.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin feedmux
//! ```
//!
//! # Environment Variables
//!
//! All optional, prefixed `FEEDMUX_`:
//!
//! - `FEEDMUX_BOOTSTRAP_SYMBOLS`: comma-separated symbols subscribed at startup
//! - `FEEDMUX_MAX_SYMBOLS`: subscription cap (default: 30)
//! - `FEEDMUX_QUEUE_CAPACITY` / `FEEDMUX_WORKER_COUNT`: backpressure queue sizing
//! - `FEEDMUX_BROADCAST_INTERVAL_MS`: fan-out cadence (default: 50)
//! - `FEEDMUX_HEALTH_PORT`: health/metrics HTTP port (default: 9201)
//! - `RUST_LOG`: log level (default: info)
//!
//! See `infrastructure::config` for the full list.

use feedmux::infrastructure::telemetry;
use feedmux::{Aggregator, AggregatorConfig, init_metrics};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    telemetry::init();

    tracing::info!("Starting feedmux");

    let _metrics_handle = init_metrics();

    let config = AggregatorConfig::from_env()?;
    log_config(&config);

    let aggregator = Aggregator::start(config);

    tracing::info!("Aggregator ready");

    await_shutdown().await;

    aggregator.shutdown().await;

    tracing::info!("Feedmux stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &AggregatorConfig) {
    tracing::info!(
        max_symbols = config.subscription.max_symbols,
        bootstrap = config.subscription.bootstrap_symbols.len(),
        queue_capacity = config.queue.capacity,
        workers = config.queue.workers,
        broadcast_interval_ms = u64::try_from(config.broadcast.interval.as_millis()).unwrap_or(u64::MAX),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        bybit_ws = %config.endpoints.bybit_ws_url,
        binance_ws = %config.endpoints.binance_ws_url,
        okx_ws = %config.endpoints.okx_ws_url,
        "Venue endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
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

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
