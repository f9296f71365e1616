#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Feedmux - Real-Time Market Data Aggregator
//!
//! Maintains single connections to a primary derivatives venue (Bybit) and
//! two auxiliary spot venues (Binance, OKX), normalizes and composites
//! market data per traded symbol, and fans it out to downstream consumers
//! at a fixed cadence.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core market-data types with no I/O
//!   - `symbol`: Symbol normalization and venue product ids
//!   - `subscription`: System-set and refcounted subscription tracking
//!   - `market`: Books, trades, walls, per-symbol state and snapshots
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Event sink, depth snapshot source, and signal sink traits
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `bybit`: Primary venue WebSocket connector and REST client
//!   - `external`: Auxiliary venue feeds and the composite calculator
//!   - `queue`: Bounded fact queue, ingest router, worker pool
//!   - `cache` / `broadcast`: Per-symbol state and the tick fan-out loop
//!   - `coalesce` / `query`: Request coalescing, cooldown, query surface
//!   - `config` / `health` / `metrics` / `telemetry`: Ambient plumbing
//!
//! # Data Flow
//!
//! ```text
//! Bybit WS ──────┐
//!                ├──► IngestRouter ──► MarketCache ──► Broadcast ──► Consumers
//! Binance WS ──┐ │         │
//!              ├─┼──► Composer      (facts)
//! OKX WS ──────┘ │         │            ▼
//!                └─────────┴──► Bounded Queue ──► Workers ──► Signal Sink
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market-data types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Aggregator assembly and lifecycle.
pub mod app;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    BookLevel, LiquidationEvent, OiComposite, OiSource, OrderBook, Side, SymbolSnapshot,
    SymbolState, TradeTick, Wall,
};
pub use domain::subscription::{SubscriptionManager, SubscriptionOrigin, UnsubscribeOutcome};
pub use domain::symbol::{Symbol, SymbolError};

// Application ports
pub use application::ports::{
    DepthSnapshotSource, MarketEvent, MarketEventSink, PartialUpdate, SignalSink,
};

// Assembly
pub use app::Aggregator;

// Infrastructure config
pub use infrastructure::config::{AggregatorConfig, ConfigError};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Fan-out hub (for integration tests)
pub use infrastructure::broadcast::{SharedTickHub, TickEnvelope, TickHub};

// Query surface
pub use infrastructure::query::{QueryError, QueryService};

// Metrics
pub use infrastructure::metrics::init_metrics;
