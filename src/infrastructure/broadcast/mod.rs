//! Broadcast Channel Adapters
//!
//! Fan-out of aggregated market state using a tokio broadcast channel.
//!
//! # Architecture
//!
//! The [`TickHub`] carries a single channel. The [`broadcast_loop`] wakes on
//! a fixed cadence, snapshots every symbol in the active set, and publishes
//! one [`TickEnvelope`] holding the full per-symbol payload map, so every
//! receiver observes a coherent per-cycle view. Consumers interested in a
//! subset filter the map themselves ([`TickEnvelope::symbol`]). Lagging
//! receivers lose old envelopes rather than stalling the loop (at-most-once
//! fan-out).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::market::SymbolSnapshot;
use crate::domain::subscription::SubscriptionManager;
use crate::domain::symbol::Symbol;
use crate::infrastructure::cache::MarketCache;
use crate::infrastructure::config::BroadcastSettings;
use crate::infrastructure::metrics;

// =============================================================================
// Envelope
// =============================================================================

/// One broadcast delivery: the full per-symbol state map for one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TickEnvelope {
    /// Monotone sequence number, one per published cycle.
    pub seq: u64,
    /// Publish time, Unix milliseconds.
    pub ts_ms: i64,
    /// Snapshot of every active symbol at this cycle.
    pub payload: HashMap<Symbol, SymbolSnapshot>,
}

impl TickEnvelope {
    /// This cycle's snapshot for one symbol, if it was active.
    #[must_use]
    pub fn symbol(&self, symbol: &Symbol) -> Option<&SymbolSnapshot> {
        self.payload.get(symbol)
    }
}

// =============================================================================
// Tick Hub
// =============================================================================

/// The single fan-out channel all tick consumers subscribe to.
///
/// Publishing with nobody listening is a no-op.
#[derive(Debug)]
pub struct TickHub {
    sender: broadcast::Sender<TickEnvelope>,
    seq: AtomicU64,
}

/// Shared reference to the tick hub.
pub type SharedTickHub = Arc<TickHub>;

impl TickHub {
    /// Create a hub whose channel holds `capacity` envelopes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity.max(1)).0,
            seq: AtomicU64::new(0),
        }
    }

    /// Get a receiver of cycle envelopes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TickEnvelope> {
        self.sender.subscribe()
    }

    /// Publish one cycle's payload map to all subscribers.
    ///
    /// Returns the number of receivers that got the envelope; zero when the
    /// payload is empty or nobody listens.
    pub fn publish(&self, payload: HashMap<Symbol, SymbolSnapshot>) -> usize {
        if payload.is_empty() || self.sender.receiver_count() == 0 {
            return 0;
        }
        let envelope = TickEnvelope {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            ts_ms: Utc::now().timestamp_millis(),
            payload,
        };
        self.sender.send(envelope).map_or(0, |n| n)
    }

    /// Active receivers on the channel.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

// =============================================================================
// Broadcast Loop
// =============================================================================

/// Periodic fan-out loop.
///
/// Each cycle snapshots the symbols currently in the active set, publishing
/// them as one envelope. Symbols that linger in the cache without an active
/// subscription never reach consumers. The sleep at the end of a cycle is
/// the configured interval minus the cycle's own duration, so a slow cycle
/// does not push subsequent ticks later than it has to.
pub async fn broadcast_loop(
    settings: BroadcastSettings,
    manager: Arc<SubscriptionManager>,
    cache: Arc<MarketCache>,
    hub: SharedTickHub,
    cancel: CancellationToken,
) {
    info!(interval_ms = settings.interval.as_millis() as u64, "broadcast loop started");

    loop {
        let cycle_start = Instant::now();

        let payload: HashMap<Symbol, SymbolSnapshot> = manager
            .active_symbols()
            .into_iter()
            .filter_map(|symbol| cache.snapshot(&symbol).map(|snap| (symbol, snap)))
            .collect();
        let symbols = payload.len();
        let delivered = hub.publish(payload);
        if delivered > 0 {
            debug!(symbols, receivers = delivered, "tick published");
        }

        let elapsed = cycle_start.elapsed();
        metrics::record_broadcast_cycle(elapsed);

        let residual = settings.interval.saturating_sub(elapsed);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(residual) => {}
        }
    }

    info!("broadcast loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rust_decimal::Decimal;

    use crate::application::ports::MarketEvent;
    use crate::domain::subscription::SubscriptionOrigin;

    const STALE_TTL: Duration = Duration::from_secs(60);

    fn sym(s: &str) -> Symbol {
        Symbol::normalize(s).unwrap()
    }

    fn payload_for(cache: &MarketCache, symbols: &[&str]) -> HashMap<Symbol, SymbolSnapshot> {
        symbols
            .iter()
            .map(|s| {
                cache.apply(MarketEvent::Price {
                    symbol: sym(s),
                    price: Decimal::from(100),
                    ts: Utc::now(),
                });
                (sym(s), cache.snapshot(&sym(s)).unwrap())
            })
            .collect()
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = TickHub::new(16);
        let cache = MarketCache::new(Decimal::from(3), STALE_TTL);
        let payload = payload_for(&cache, &["BTC"]);

        assert_eq!(hub.publish(payload), 0);
        assert_eq!(hub.receiver_count(), 0);
    }

    #[tokio::test]
    async fn empty_payload_is_not_published() {
        let hub = TickHub::new(16);
        let mut rx = hub.subscribe();

        assert_eq!(hub.publish(HashMap::new()), 0);
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn one_envelope_carries_every_symbol() {
        let hub = TickHub::new(16);
        let cache = MarketCache::new(Decimal::from(3), STALE_TTL);
        let mut rx = hub.subscribe();

        assert_eq!(hub.publish(payload_for(&cache, &["BTC", "ETH"])), 1);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.payload.len(), 2);
        assert!(envelope.symbol(&sym("BTC")).is_some());
        assert!(envelope.symbol(&sym("ETH")).is_some());
        assert!(envelope.symbol(&sym("SOL")).is_none());
    }

    #[tokio::test]
    async fn cycles_are_sequenced() {
        let hub = TickHub::new(16);
        let cache = MarketCache::new(Decimal::from(3), STALE_TTL);
        let mut rx = hub.subscribe();

        assert_eq!(hub.publish(payload_for(&cache, &["BTC"])), 1);
        assert_eq!(hub.publish(payload_for(&cache, &["BTC"])), 1);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn loop_publishes_only_active_symbols() {
        let manager = Arc::new(SubscriptionManager::new(10));
        let cache = Arc::new(MarketCache::new(Decimal::from(3), STALE_TTL));
        let hub = Arc::new(TickHub::new(16));
        let cancel = CancellationToken::new();

        // BTC is active; ETH merely lingers in the cache.
        assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::System));
        let _ = payload_for(&cache, &["BTC", "ETH"]);
        let mut rx = hub.subscribe();

        let task = tokio::spawn(broadcast_loop(
            BroadcastSettings {
                interval: Duration::from_millis(10),
                channel_capacity: 16,
            },
            Arc::clone(&manager),
            Arc::clone(&cache),
            Arc::clone(&hub),
            cancel.clone(),
        ));

        let envelope =
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(envelope.symbol(&sym("BTC")).is_some());
        assert!(envelope.symbol(&sym("ETH")).is_none());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
