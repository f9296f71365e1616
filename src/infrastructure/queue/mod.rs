//! Ingestion Routing, Backpressure Queue, and Worker Pool
//!
//! [`IngestRouter`] is where normalized venue events land: events for
//! symbols in the active set are applied to the cache synchronously, and the
//! facts the downstream signal pipeline cares about (trades, liquidations)
//! are additionally offered to a bounded queue with a non-blocking
//! `try_send`. A full queue drops the fact, bumps a counter, and logs at
//! most once per window; the cache write has already happened, so market
//! state never stalls behind the pipeline. Events for symbols no longer
//! active are discarded outright, so a frame racing an eviction cannot
//! resurrect the evicted cache entry.
//!
//! A fixed pool of workers drains the queue and forwards facts through the
//! [`SignalSink`] port.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{MarketEvent, MarketEventSink, PartialUpdate, SignalSink};
use crate::domain::subscription::SubscriptionManager;
use crate::domain::symbol::Symbol;
use crate::infrastructure::cache::MarketCache;
use crate::infrastructure::metrics;

/// Minimum interval between overflow warnings.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// One queued fact for the signal pipeline.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Subject symbol.
    pub symbol: Symbol,
    /// The fact.
    pub update: PartialUpdate,
}

// =============================================================================
// Event Queue
// =============================================================================

/// Producer-side handle to the bounded fact queue.
///
/// Cheap to clone; all clones share the drop counter and the log limiter.
#[derive(Debug, Clone)]
pub struct EventQueue {
    sender: mpsc::Sender<QueueItem>,
    dropped: Arc<AtomicU64>,
    last_drop_log: Arc<parking_lot::Mutex<Option<Instant>>>,
}

impl EventQueue {
    /// Create a queue with the given capacity, returning the producer handle
    /// and the receiver the worker pool drains.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<QueueItem>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queue = Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
            last_drop_log: Arc::new(parking_lot::Mutex::new(None)),
        };
        (queue, receiver)
    }

    /// Offer a fact. Returns `false` if the queue was full or closed and the
    /// fact was dropped.
    pub fn enqueue(&self, item: QueueItem) -> bool {
        let kind = item.update.kind();
        match self.sender.try_send(item) {
            Ok(()) => {
                metrics::set_queue_depth(self.depth());
                true
            }
            Err(mpsc::error::TrySendError::Full(_) | mpsc::error::TrySendError::Closed(_)) => {
                self.record_drop(kind);
                false
            }
        }
    }

    /// Total facts dropped at the full queue since startup.
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current number of queued facts.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    fn record_drop(&self, kind: &'static str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_queue_dropped(kind, 1);

        // At most one warning per window; the counter carries the truth.
        let mut last = self.last_drop_log.lock();
        let now = Instant::now();
        let should_log = last.is_none_or(|at| now.duration_since(at) >= DROP_LOG_INTERVAL);
        if should_log {
            *last = Some(now);
            warn!(kind, total_dropped = total, "fact queue full, dropping");
        }
    }
}

// =============================================================================
// Ingest Router
// =============================================================================

/// The [`MarketEventSink`] the connectors write into.
///
/// Applies accepted events to the cache, then offers trade and liquidation
/// facts to the queue. Events for symbols outside the active set are
/// discarded: connectors unsubscribe lazily on their next sync pass, and a
/// frame arriving in that window must not recreate evicted state. The
/// returned flag reports the queue outcome for accepted events: a cache
/// write cannot fail, and events without a pipeline fact return `true`.
#[derive(Debug, Clone)]
pub struct IngestRouter {
    manager: Arc<SubscriptionManager>,
    cache: Arc<MarketCache>,
    queue: EventQueue,
}

impl IngestRouter {
    /// Route active-set events into `cache` and pipeline facts into `queue`.
    #[must_use]
    pub const fn new(
        manager: Arc<SubscriptionManager>,
        cache: Arc<MarketCache>,
        queue: EventQueue,
    ) -> Self {
        Self { manager, cache, queue }
    }
}

impl MarketEventSink for IngestRouter {
    fn submit(&self, event: MarketEvent) -> bool {
        if !self.manager.is_active(event.symbol()) {
            debug!(symbol = %event.symbol(), kind = event.kind(), "discarding event for inactive symbol");
            return false;
        }

        let fact = match &event {
            MarketEvent::Trade { symbol, trade } => Some(QueueItem {
                symbol: symbol.clone(),
                update: PartialUpdate::Trade(trade.clone()),
            }),
            MarketEvent::Liquidation { symbol, event } => Some(QueueItem {
                symbol: symbol.clone(),
                update: PartialUpdate::Liquidation(event.clone()),
            }),
            _ => None,
        };

        self.cache.apply(event);
        fact.is_none_or(|item| self.queue.enqueue(item))
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Pool of worker tasks draining the fact queue into the signal sink.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn `workers` tasks sharing one receiver.
    #[must_use]
    pub fn spawn(
        workers: usize,
        receiver: mpsc::Receiver<QueueItem>,
        sink: Arc<dyn SignalSink>,
        cancel: CancellationToken,
    ) -> Self {
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let sink = Arc::clone(&sink);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, receiver, sink, cancel).await;
                })
            })
            .collect();
        Self { handles, cancel }
    }

    /// Stop all workers. Facts still queued are discarded unprocessed.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem>>>,
    sink: Arc<dyn SignalSink>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "worker started");
    loop {
        // Lock only around the recv so siblings can interleave.
        let item = {
            let mut receiver = receiver.lock().await;
            let item = tokio::select! {
                () = cancel.cancelled() => break,
                item = receiver.recv() => item,
            };
            // Keep the depth gauge honest while the queue drains.
            metrics::set_queue_depth(receiver.len());
            item
        };

        match item {
            Some(item) => sink.deliver(&item.symbol, &item.update).await,
            None => break,
        }
    }
    debug!(worker_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use crate::domain::market::{Side, TradeTick};
    use crate::domain::subscription::SubscriptionOrigin;

    fn sym(s: &str) -> Symbol {
        Symbol::normalize(s).unwrap()
    }

    fn active_manager(symbols: &[&str]) -> Arc<SubscriptionManager> {
        let manager = Arc::new(SubscriptionManager::new(10));
        for s in symbols {
            assert!(manager.subscribe(sym(s), SubscriptionOrigin::System));
        }
        manager
    }

    fn test_cache() -> Arc<MarketCache> {
        Arc::new(MarketCache::new(Decimal::from(3), Duration::from_secs(60)))
    }

    fn trade_fact(s: &str) -> QueueItem {
        QueueItem {
            symbol: sym(s),
            update: PartialUpdate::Trade(TradeTick {
                price: Decimal::from(100),
                size: Decimal::ONE,
                side: Side::Buy,
                ts: Utc::now(),
            }),
        }
    }

    fn trade_event(s: &str) -> MarketEvent {
        MarketEvent::Trade {
            symbol: sym(s),
            trade: TradeTick {
                price: Decimal::from(100),
                size: Decimal::ONE,
                side: Side::Buy,
                ts: Utc::now(),
            },
        }
    }

    #[derive(Default)]
    struct CountingSink {
        delivered: AtomicU64,
    }

    #[async_trait]
    impl SignalSink for CountingSink {
        async fn deliver(&self, _symbol: &Symbol, _update: &PartialUpdate) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn overflow_drops_and_counts_exactly() {
        let (queue, _receiver) = EventQueue::bounded(10);

        let mut accepted = 0;
        for _ in 0..15 {
            if queue.enqueue(trade_fact("BTC")) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 10);
        assert_eq!(queue.dropped_total(), 5);
        assert_eq!(queue.depth(), 10);
    }

    #[tokio::test]
    async fn router_applies_cache_even_when_queue_is_full() {
        let cache = test_cache();
        let (queue, _receiver) = EventQueue::bounded(1);
        let router = IngestRouter::new(active_manager(&["BTC"]), Arc::clone(&cache), queue.clone());

        assert!(router.submit(trade_event("BTC")));
        assert!(!router.submit(trade_event("BTC")));

        // Both trades landed in the cache regardless of the dropped fact.
        let snap = cache.snapshot(&sym("BTC")).unwrap();
        assert_eq!(snap.trade_count, 2);
        assert_eq!(queue.dropped_total(), 1);
    }

    #[tokio::test]
    async fn router_skips_queue_for_non_fact_events() {
        let cache = test_cache();
        let (queue, _receiver) = EventQueue::bounded(1);
        let router = IngestRouter::new(active_manager(&["ETH"]), Arc::clone(&cache), queue.clone());

        assert!(router.submit(MarketEvent::Price {
            symbol: sym("ETH"),
            price: Decimal::from(2000),
            ts: Utc::now(),
        }));
        assert_eq!(queue.depth(), 0);
        assert!(cache.snapshot(&sym("ETH")).is_some());
    }

    #[tokio::test]
    async fn inactive_symbol_events_are_discarded() {
        let cache = test_cache();
        let (queue, _receiver) = EventQueue::bounded(4);
        let router = IngestRouter::new(active_manager(&[]), Arc::clone(&cache), queue.clone());

        assert!(!router.submit(trade_event("BTC")));
        assert!(cache.snapshot(&sym("BTC")).is_none());
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.dropped_total(), 0);
    }

    #[tokio::test]
    async fn late_frame_cannot_resurrect_an_evicted_symbol() {
        let cache = test_cache();
        let (queue, _receiver) = EventQueue::bounded(4);
        let manager = active_manager(&["BTC"]);
        let router = IngestRouter::new(Arc::clone(&manager), Arc::clone(&cache), queue.clone());

        assert!(router.submit(trade_event("BTC")));
        assert!(cache.snapshot(&sym("BTC")).is_some());

        // Symbol leaves the active set and its entry is evicted; a frame
        // that was already in flight arrives afterwards.
        assert_eq!(
            manager.unsubscribe(&sym("BTC"), SubscriptionOrigin::System),
            crate::domain::subscription::UnsubscribeOutcome::BecameInactive
        );
        cache.evict(&sym("BTC"));
        assert!(!router.submit(trade_event("BTC")));

        assert!(cache.snapshot(&sym("BTC")).is_none());
    }

    #[tokio::test]
    async fn workers_deliver_to_sink() {
        let (queue, receiver) = EventQueue::bounded(64);
        let sink = Arc::new(CountingSink::default());
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(2, receiver, Arc::clone(&sink) as Arc<dyn SignalSink>, cancel);

        for s in ["BTC", "ETH", "SOL"] {
            assert!(queue.enqueue(trade_fact(s)));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 3);
        // Fully drained: the depth reading reflects the dequeues.
        assert_eq!(queue.depth(), 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_discards_queued_facts() {
        let (queue, receiver) = EventQueue::bounded(64);
        let sink = Arc::new(CountingSink::default());
        let cancel = CancellationToken::new();

        // Cancel before spawning so workers exit on their first select.
        cancel.cancel();
        let pool = WorkerPool::spawn(2, receiver, Arc::clone(&sink) as Arc<dyn SignalSink>, cancel);

        for _ in 0..5 {
            let _ = queue.enqueue(trade_fact("BTC"));
        }

        pool.shutdown().await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enqueue_after_close_reports_drop() {
        let (queue, receiver) = EventQueue::bounded(4);
        drop(receiver);

        assert!(!queue.enqueue(trade_fact("BTC")));
        assert_eq!(queue.dropped_total(), 1);
    }
}
