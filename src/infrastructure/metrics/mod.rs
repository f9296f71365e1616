//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: inbound frame counts by venue and kind
//! - **Queue**: ingestion queue depth and overflow drops
//! - **Connections**: reconnect attempts by venue
//! - **Broadcast**: cycle duration
//! - **Query**: coalesced vs. upstream calls, cooldown rejections
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
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
        "feedmux_messages_received_total",
        "Total inbound frames by venue and kind"
    );
    describe_counter!(
        "feedmux_queue_dropped_total",
        "Total events dropped at the full ingestion queue"
    );
    describe_gauge!(
        "feedmux_queue_depth",
        "Current depth of the ingestion queue"
    );
    describe_gauge!(
        "feedmux_subscriptions_active",
        "Number of actively tracked symbols"
    );
    describe_counter!(
        "feedmux_reconnects_total",
        "Total reconnection attempts by venue"
    );
    describe_counter!(
        "feedmux_snapshot_failures_total",
        "Total failed order-book snapshot hydrations"
    );
    describe_histogram!(
        "feedmux_broadcast_cycle_seconds",
        "Wall time of one broadcast fan-out cycle"
    );
    describe_counter!(
        "feedmux_query_calls_total",
        "Query-surface calls by class and outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for venues.
#[derive(Debug, Clone, Copy)]
pub enum Venue {
    /// Primary derivatives venue.
    Bybit,
    /// Auxiliary spot venue A.
    Binance,
    /// Auxiliary spot venue B.
    Okx,
}

impl Venue {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Bybit => "bybit",
            Self::Binance => "binance",
            Self::Okx => "okx",
        }
    }
}

/// Outcome labels for query-surface calls.
#[derive(Debug, Clone, Copy)]
pub enum QueryOutcome {
    /// A fresh upstream call was issued.
    Upstream,
    /// The caller shared an in-flight call.
    Coalesced,
    /// Served from cache because of an active cooldown.
    Cooldown,
    /// Served stale cache after an upstream failure.
    StaleFallback,
}

impl QueryOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Coalesced => "coalesced",
            Self::Cooldown => "cooldown",
            Self::StaleFallback => "stale_fallback",
        }
    }
}

/// Record an inbound frame from a venue.
pub fn record_message_received(venue: Venue, kind: &'static str) {
    counter!(
        "feedmux_messages_received_total",
        "venue" => venue.as_str(),
        "kind" => kind
    )
    .increment(1);
}

/// Record events dropped at the full ingestion queue.
pub fn record_queue_dropped(kind: &'static str, count: u64) {
    counter!(
        "feedmux_queue_dropped_total",
        "kind" => kind
    )
    .increment(count);
}

/// Update the ingestion queue depth gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_queue_depth(depth: usize) {
    gauge!("feedmux_queue_depth").set(depth as f64);
}

/// Update the active subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("feedmux_subscriptions_active").set(count as f64);
}

/// Record a reconnection attempt.
pub fn record_reconnect(venue: Venue) {
    counter!(
        "feedmux_reconnects_total",
        "venue" => venue.as_str()
    )
    .increment(1);
}

/// Record a failed depth-snapshot hydration.
pub fn record_snapshot_failure(venue: Venue) {
    counter!(
        "feedmux_snapshot_failures_total",
        "venue" => venue.as_str()
    )
    .increment(1);
}

/// Record the duration of one broadcast cycle.
pub fn record_broadcast_cycle(duration: Duration) {
    histogram!("feedmux_broadcast_cycle_seconds").record(duration.as_secs_f64());
}

/// Record a query-surface call with its outcome.
pub fn record_query_call(class: &'static str, outcome: QueryOutcome) {
    counter!(
        "feedmux_query_calls_total",
        "class" => class,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
