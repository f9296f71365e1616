//! Market State Cache
//!
//! The single writer-side store of per-symbol state. Worker tasks apply
//! normalized events here; the broadcast loop and query surface read
//! snapshots out. All operations are synchronous and never held across an
//! await point.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::application::ports::MarketEvent;
use crate::domain::market::{SymbolSnapshot, SymbolState};
use crate::domain::symbol::Symbol;

/// Thread-safe map of symbol to latest-known state.
#[derive(Debug)]
pub struct MarketCache {
    states: RwLock<HashMap<Symbol, SymbolState>>,
    wall_multiplier: Decimal,
    staleness_ttl: Duration,
}

impl MarketCache {
    /// New empty cache using `wall_multiplier` for wall detection and
    /// `staleness_ttl` for marking served snapshots stale.
    #[must_use]
    pub fn new(wall_multiplier: Decimal, staleness_ttl: Duration) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            wall_multiplier,
            staleness_ttl,
        }
    }

    /// Apply a normalized event, creating the symbol's entry if absent.
    pub fn apply(&self, event: MarketEvent) {
        let now = Utc::now();
        let mut states = self.states.write();
        let state = states
            .entry(event.symbol().clone())
            .or_insert_with(|| SymbolState::new(now));

        match event {
            MarketEvent::Price { price, ts, .. } => state.record_price(price, ts),
            MarketEvent::BookSnapshot { bids, asks, ts, .. } => {
                state.apply_book_snapshot(bids, asks, self.wall_multiplier, ts);
            }
            MarketEvent::BookDelta { bids, asks, ts, .. } => {
                state.apply_book_delta(bids, asks, self.wall_multiplier, ts);
            }
            MarketEvent::Trade { trade, .. } => state.record_trade(trade, now),
            MarketEvent::Liquidation { event, .. } => state.record_liquidation(event, now),
            MarketEvent::Context {
                open_interest,
                funding_rate,
                ts,
                ..
            } => state.record_context(open_interest, funding_rate, ts),
            MarketEvent::Composites {
                cvd_1m,
                cvd_5m,
                oi,
                ts,
                ..
            } => state.record_composites(cvd_1m, cvd_5m, oi, ts),
        }
    }

    /// Snapshot one symbol's state, if tracked.
    ///
    /// The snapshot's `stale` marker is set when the state has not mutated
    /// within the staleness TTL, so consumers see an explicit freshness
    /// verdict rather than raw timestamps alone.
    #[must_use]
    pub fn snapshot(&self, symbol: &Symbol) -> Option<SymbolSnapshot> {
        let now = Utc::now();
        self.states.read().get(symbol).map(|state| {
            let mut snap = state.snapshot();
            snap.stale = state.is_stale(self.staleness_ttl, now);
            snap
        })
    }

    /// Most recent trades for a symbol, newest first, up to `limit`.
    #[must_use]
    pub fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Vec<crate::domain::market::TradeTick> {
        self.states.read().get(symbol).map_or_else(Vec::new, |state| {
            state.trades.iter().rev().take(limit).cloned().collect()
        })
    }

    /// Primary-venue open interest and its write time, when known.
    ///
    /// The external feed composer uses this for freshness-gated blending.
    #[must_use]
    pub fn primary_open_interest(
        &self,
        symbol: &Symbol,
    ) -> Option<(Decimal, chrono::DateTime<Utc>)> {
        let states = self.states.read();
        let state = states.get(symbol)?;
        Some((state.open_interest?, state.open_interest_ts?))
    }

    /// Snapshot every tracked symbol, with the same staleness marking as
    /// [`snapshot`](Self::snapshot).
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<(Symbol, SymbolSnapshot)> {
        let now = Utc::now();
        self.states
            .read()
            .iter()
            .map(|(symbol, state)| {
                let mut snap = state.snapshot();
                snap.stale = state.is_stale(self.staleness_ttl, now);
                (symbol.clone(), snap)
            })
            .collect()
    }

    /// Whether the symbol has any cached book levels.
    ///
    /// The primary connector consults this before REST hydration so a book
    /// already advanced by stream deltas is not overwritten by a late
    /// snapshot fetch.
    #[must_use]
    pub fn has_book(&self, symbol: &Symbol) -> bool {
        self.states
            .read()
            .get(symbol)
            .is_some_and(|state| !state.book.bids.is_empty() || !state.book.asks.is_empty())
    }

    /// Drop a symbol's entry when it leaves the active set.
    pub fn evict(&self, symbol: &Symbol) {
        self.states.write().remove(symbol);
    }

    /// Number of tracked symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Remove every entry. Used during shutdown teardown.
    pub fn clear(&self) {
        self.states.write().clear();
    }
}
