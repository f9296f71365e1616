//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`MarketEventSink`]: non-blocking ingestion of normalized venue events
//! - [`DepthSnapshotSource`]: REST order-book hydration for the primary venue
//! - [`SignalSink`]: hand-off point for the downstream signal pipeline

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::market::{LiquidationEvent, OiComposite, TradeTick};
use crate::domain::symbol::Symbol;

/// A normalized venue event, ready to be applied to per-symbol state.
///
/// Connectors translate wire messages into this shape at the edge; everything
/// downstream of the ingestion queue is venue-agnostic.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    /// Standalone price observation (ticker mid or last trade).
    Price {
        /// Subject symbol.
        symbol: Symbol,
        /// Observed price.
        price: Decimal,
        /// Venue timestamp.
        ts: DateTime<Utc>,
    },
    /// Full order-book replacement.
    BookSnapshot {
        /// Subject symbol.
        symbol: Symbol,
        /// Bid levels as (price, size).
        bids: Vec<(Decimal, Decimal)>,
        /// Ask levels as (price, size).
        asks: Vec<(Decimal, Decimal)>,
        /// Venue timestamp.
        ts: DateTime<Utc>,
    },
    /// Incremental order-book update.
    BookDelta {
        /// Subject symbol.
        symbol: Symbol,
        /// Bid changes as (price, size); zero size removes.
        bids: Vec<(Decimal, Decimal)>,
        /// Ask changes as (price, size); zero size removes.
        asks: Vec<(Decimal, Decimal)>,
        /// Venue timestamp.
        ts: DateTime<Utc>,
    },
    /// Trade print.
    Trade {
        /// Subject symbol.
        symbol: Symbol,
        /// The print.
        trade: TradeTick,
    },
    /// Forced-close event.
    Liquidation {
        /// Subject symbol.
        symbol: Symbol,
        /// The event.
        event: LiquidationEvent,
    },
    /// Derivatives context: open interest and/or funding rate.
    Context {
        /// Subject symbol.
        symbol: Symbol,
        /// Open interest, if reported.
        open_interest: Option<Decimal>,
        /// Funding rate, if reported.
        funding_rate: Option<Decimal>,
        /// Venue timestamp.
        ts: DateTime<Utc>,
    },
    /// Cross-venue composite projections from the external feed composer.
    Composites {
        /// Subject symbol.
        symbol: Symbol,
        /// Composite CVD, trailing 1 minute.
        cvd_1m: Option<Decimal>,
        /// Composite CVD, trailing 5 minutes.
        cvd_5m: Option<Decimal>,
        /// Composite open interest.
        oi: Option<OiComposite>,
        /// Computation time.
        ts: DateTime<Utc>,
    },
}

impl MarketEvent {
    /// The symbol this event applies to.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        match self {
            Self::Price { symbol, .. }
            | Self::BookSnapshot { symbol, .. }
            | Self::BookDelta { symbol, .. }
            | Self::Trade { symbol, .. }
            | Self::Liquidation { symbol, .. }
            | Self::Context { symbol, .. }
            | Self::Composites { symbol, .. } => symbol,
        }
    }

    /// Short label for logs and drop metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Price { .. } => "price",
            Self::BookSnapshot { .. } => "book_snapshot",
            Self::BookDelta { .. } => "book_delta",
            Self::Trade { .. } => "trade",
            Self::Liquidation { .. } => "liquidation",
            Self::Context { .. } => "context",
            Self::Composites { .. } => "composites",
        }
    }
}

/// Non-blocking ingestion sink for normalized venue events.
///
/// Implementations must never block the caller: a full sink drops the event
/// and returns `false`. Producers on the socket read path rely on this to
/// keep draining the connection under load.
pub trait MarketEventSink: Send + Sync {
    /// Offer an event. Returns `false` if the sink was full and the event
    /// was dropped.
    fn submit(&self, event: MarketEvent) -> bool;
}

/// Errors surfaced by [`DepthSnapshotSource`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Transport-level failure reaching the venue.
    #[error("snapshot transport error: {0}")]
    Transport(String),
    /// The venue answered but the payload could not be used.
    #[error("snapshot rejected for {symbol}: {reason}")]
    Rejected {
        /// Symbol the request was for.
        symbol: Symbol,
        /// Venue-reported reason.
        reason: String,
    },
}

/// A REST source for full order-book snapshots, used to hydrate book state
/// after (re)subscribing to a symbol.
#[async_trait]
pub trait DepthSnapshotSource: Send + Sync {
    /// Fetch a full depth snapshot for `symbol`.
    async fn fetch_depth(
        &self,
        symbol: &Symbol,
    ) -> Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>), SnapshotError>;
}

/// One processing fact handed to the downstream signal pipeline.
///
/// The pipeline's contract is best-effort and at-least-once-ish: it must
/// tolerate gaps (facts dropped at a full queue) and never treat one update
/// as complete state.
#[derive(Debug, Clone)]
pub enum PartialUpdate {
    /// A trade print happened.
    Trade(TradeTick),
    /// A forced close happened.
    Liquidation(LiquidationEvent),
}

impl PartialUpdate {
    /// Short label for logs and drop metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Trade(_) => "trade",
            Self::Liquidation(_) => "liquidation",
        }
    }
}

/// Hand-off point for the downstream signal-generation pipeline.
///
/// The worker pool pushes queued facts through this port. The pipeline
/// itself is out of scope here; the default implementation just logs at
/// debug level.
#[async_trait]
pub trait SignalSink: Send + Sync {
    /// Deliver one fact to the pipeline.
    async fn deliver(&self, symbol: &Symbol, update: &PartialUpdate);
}

/// Default [`SignalSink`] that traces deliveries and discards them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSignalSink;

#[async_trait]
impl SignalSink for LoggingSignalSink {
    async fn deliver(&self, symbol: &Symbol, update: &PartialUpdate) {
        debug!(symbol = %symbol, kind = update.kind(), "signal sink delivery");
    }
}
