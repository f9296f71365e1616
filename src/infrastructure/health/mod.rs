//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, feed status reporting, and Prometheus
//! metrics. Used by container orchestrators, load balancers, and monitoring
//! systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (primary feed streaming)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::SubscriptionManager;
use crate::infrastructure::broadcast::SharedTickHub;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::queue::EventQueue;
use crate::infrastructure::ws::FeedState;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Aggregator version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Per-feed connection status.
    pub feeds: FeedsStatus,
    /// Backpressure queue status.
    pub queue: QueueStatus,
    /// Subscription statistics.
    pub subscriptions: SubscriptionStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Primary streaming and both auxiliaries up.
    Healthy,
    /// Primary streaming but an auxiliary is down.
    Degraded,
    /// Primary feed not streaming.
    Unhealthy,
}

/// Feed connection status, one entry per venue connection.
#[derive(Debug, Clone, Serialize)]
pub struct FeedsStatus {
    /// Primary derivatives venue.
    pub bybit: crate::infrastructure::ws::FeedStateSnapshot,
    /// Auxiliary spot venue A.
    pub binance: crate::infrastructure::ws::FeedStateSnapshot,
    /// Auxiliary spot venue B.
    pub okx: crate::infrastructure::ws::FeedStateSnapshot,
}

/// Backpressure queue counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    /// Items currently buffered.
    pub depth: usize,
    /// Items dropped since startup.
    pub dropped_total: u64,
}

/// Subscription statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubscriptionStatus {
    /// Symbols in the active set.
    pub active_symbols: usize,
    /// Fan-out receivers across all symbols.
    pub tick_receivers: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    primary: Arc<FeedState>,
    binance: Arc<FeedState>,
    okx: Arc<FeedState>,
    queue: Arc<EventQueue>,
    manager: Arc<SubscriptionManager>,
    hub: SharedTickHub,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        primary: Arc<FeedState>,
        binance: Arc<FeedState>,
        okx: Arc<FeedState>,
        queue: Arc<EventQueue>,
        manager: Arc<SubscriptionManager>,
        hub: SharedTickHub,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            primary,
            binance,
            okx,
            queue,
            manager,
            hub,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    // Ready iff the primary feed is streaming; auxiliaries are supplementary.
    if state.primary.is_streaming() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let status = determine_health_status(
        state.primary.is_streaming(),
        state.binance.is_streaming(),
        state.okx.is_streaming(),
    );

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feeds: FeedsStatus {
            bybit: state.primary.snapshot(),
            binance: state.binance.snapshot(),
            okx: state.okx.snapshot(),
        },
        queue: QueueStatus {
            depth: state.queue.depth(),
            dropped_total: state.queue.dropped_total(),
        },
        subscriptions: SubscriptionStatus {
            active_symbols: state.manager.active_count(),
            tick_receivers: state.hub.receiver_count(),
        },
    }
}

const fn determine_health_status(primary: bool, binance: bool, okx: bool) -> HealthStatus {
    if !primary {
        return HealthStatus::Unhealthy;
    }
    if binance && okx {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
