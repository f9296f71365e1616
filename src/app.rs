//! Aggregator Assembly
//!
//! Wires every component together and owns their task lifecycles. Shutdown
//! is ordered: the primary socket closes first so no new facts arrive, then
//! the worker pool drains out (discarding whatever is still queued), then
//! the broadcast loop and external feeds stop, and finally per-symbol
//! bookkeeping is cleared.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::ports::{LoggingSignalSink, MarketEventSink, SignalSink};
use crate::domain::subscription::{SubscriptionManager, SubscriptionOrigin, UnsubscribeOutcome};
use crate::domain::symbol::Symbol;
use crate::infrastructure::broadcast::{self, SharedTickHub, TickHub};
use crate::infrastructure::bybit::{BybitClient, BybitRest};
use crate::infrastructure::cache::MarketCache;
use crate::infrastructure::config::AggregatorConfig;
use crate::infrastructure::external::oi::OiPoller;
use crate::infrastructure::external::{
    BinanceAdapter, ExternalComposer, OkxAdapter, VenueFeed, compose_loop,
};
use crate::infrastructure::health::{HealthServer, HealthServerState};
use crate::infrastructure::metrics;
use crate::infrastructure::query::QueryService;
use crate::infrastructure::queue::{EventQueue, IngestRouter, WorkerPool};
use crate::infrastructure::ws::FeedState;

/// The assembled aggregator and its running tasks.
pub struct Aggregator {
    manager: Arc<SubscriptionManager>,
    cache: Arc<MarketCache>,
    composer: Arc<ExternalComposer>,
    queue: EventQueue,
    hub: SharedTickHub,
    query: Arc<QueryService>,
    primary_state: Arc<FeedState>,

    primary_cancel: CancellationToken,
    aux_cancel: CancellationToken,

    primary_handle: JoinHandle<()>,
    worker_pool: WorkerPool,
    aux_handles: Vec<JoinHandle<()>>,
}

impl Aggregator {
    /// Assemble and start every component, logging facts through the default
    /// downstream sink.
    #[must_use]
    pub fn start(config: AggregatorConfig) -> Self {
        Self::start_with_sink(config, Arc::new(LoggingSignalSink))
    }

    /// Assemble and start every component, delivering pipeline facts to
    /// `signal_sink`.
    #[must_use]
    pub fn start_with_sink(config: AggregatorConfig, signal_sink: Arc<dyn SignalSink>) -> Self {
        let manager = Arc::new(SubscriptionManager::new(config.subscription.max_symbols));
        let cache = Arc::new(MarketCache::new(config.wall_multiplier, config.staleness_ttl));
        let composer = Arc::new(ExternalComposer::new(config.external.clone()));
        let hub: SharedTickHub = Arc::new(TickHub::new(config.broadcast.channel_capacity));

        let (queue, receiver) = EventQueue::bounded(config.queue.capacity);
        let sink: Arc<dyn MarketEventSink> = Arc::new(IngestRouter::new(
            Arc::clone(&manager),
            Arc::clone(&cache),
            queue.clone(),
        ));

        let rest = Arc::new(BybitRest::new(
            reqwest::Client::new(),
            config.endpoints.bybit_rest_url.clone(),
            config.primary.book_depth,
        ));
        let query = Arc::new(QueryService::new(
            &config.query,
            Arc::clone(&rest),
            Arc::clone(&cache),
        ));

        let primary_state = Arc::new(FeedState::new("bybit"));
        let binance_state = Arc::new(FeedState::new("binance"));
        let okx_state = Arc::new(FeedState::new("okx"));

        let primary_cancel = CancellationToken::new();
        let workers_cancel = CancellationToken::new();
        let aux_cancel = CancellationToken::new();

        for symbol in &config.subscription.bootstrap_symbols {
            if !manager.subscribe(symbol.clone(), SubscriptionOrigin::System) {
                warn!(%symbol, "bootstrap symbol rejected by subscription cap");
            }
        }
        metrics::set_active_subscriptions(manager.active_count());

        let worker_pool = WorkerPool::spawn(
            config.queue.workers,
            receiver,
            signal_sink,
            workers_cancel,
        );

        let primary = BybitClient::new(
            config.primary.clone(),
            config.endpoints.bybit_ws_url.clone(),
            Arc::clone(&manager),
            Arc::clone(&sink),
            rest,
            Arc::clone(&cache),
            Arc::clone(&primary_state),
            primary_cancel.clone(),
        );
        let primary_handle = tokio::spawn(primary.run());

        let mut aux_handles = Vec::new();

        let binance = VenueFeed::new(
            Box::new(BinanceAdapter::default()),
            config.endpoints.binance_ws_url.clone(),
            config.external.clone(),
            Arc::clone(&manager),
            Arc::clone(&composer),
            binance_state.clone(),
            aux_cancel.clone(),
        );
        aux_handles.push(tokio::spawn(binance.run()));

        let okx = VenueFeed::new(
            Box::new(OkxAdapter),
            config.endpoints.okx_ws_url.clone(),
            config.external.clone(),
            Arc::clone(&manager),
            Arc::clone(&composer),
            okx_state.clone(),
            aux_cancel.clone(),
        );
        aux_handles.push(tokio::spawn(okx.run()));

        let oi_poller = OiPoller::new(
            config.endpoints.binance_oi_url.clone(),
            config.external.oi_poll_interval,
            config.external.max_symbols,
            Arc::clone(&manager),
            Arc::clone(&composer),
            aux_cancel.clone(),
        );
        aux_handles.push(tokio::spawn(oi_poller.run()));

        aux_handles.push(tokio::spawn(compose_loop(
            Arc::clone(&composer),
            Arc::clone(&manager),
            Arc::clone(&cache),
            Arc::clone(&sink),
            aux_cancel.clone(),
        )));

        aux_handles.push(tokio::spawn(broadcast::broadcast_loop(
            config.broadcast.clone(),
            Arc::clone(&manager),
            Arc::clone(&cache),
            Arc::clone(&hub),
            aux_cancel.clone(),
        )));

        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&primary_state),
            binance_state,
            okx_state,
            Arc::new(queue.clone()),
            Arc::clone(&manager),
            Arc::clone(&hub),
        ));
        let health_server =
            HealthServer::new(config.server.health_port, health_state, aux_cancel.clone());
        aux_handles.push(tokio::spawn(async move {
            if let Err(err) = health_server.run().await {
                error!(error = %err, "health server error");
            }
        }));

        info!(
            bootstrap = config.subscription.bootstrap_symbols.len(),
            workers = config.queue.workers,
            "aggregator started"
        );

        Self {
            manager,
            cache,
            composer,
            queue,
            hub,
            query,
            primary_state,
            primary_cancel,
            aux_cancel,
            primary_handle,
            worker_pool,
            aux_handles,
        }
    }

    /// Subscribe a symbol under an origin.
    ///
    /// Returns `false` if the active-set cap is reached; callers must treat
    /// the symbol as not subscribed. The connectors pick the new symbol up
    /// on their next subscription sync.
    pub fn subscribe(&self, symbol: Symbol, origin: SubscriptionOrigin) -> bool {
        let accepted = self.manager.subscribe(symbol, origin);
        metrics::set_active_subscriptions(self.manager.active_count());
        accepted
    }

    /// Unsubscribe a symbol under an origin. When the symbol becomes
    /// inactive, its cached state and external series are evicted and it
    /// drops out of subsequent broadcast payloads; the venue-side
    /// unsubscribe happens on the connectors' next sync, best-effort.
    pub fn unsubscribe(&self, symbol: &Symbol, origin: SubscriptionOrigin) -> UnsubscribeOutcome {
        let outcome = self.manager.unsubscribe(symbol, origin);
        if outcome == UnsubscribeOutcome::BecameInactive {
            self.cache.evict(symbol);
            self.composer.evict(symbol);
        }
        metrics::set_active_subscriptions(self.manager.active_count());
        outcome
    }

    /// The subscription multiplexer.
    #[must_use]
    pub fn manager(&self) -> &Arc<SubscriptionManager> {
        &self.manager
    }

    /// The per-symbol cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<MarketCache> {
        &self.cache
    }

    /// The synchronous query surface.
    #[must_use]
    pub fn query(&self) -> &Arc<QueryService> {
        &self.query
    }

    /// The tick fan-out hub; consumers receive one payload map per cycle.
    #[must_use]
    pub fn hub(&self) -> &SharedTickHub {
        &self.hub
    }

    /// The primary feed's connection state.
    #[must_use]
    pub fn primary_state(&self) -> &Arc<FeedState> {
        &self.primary_state
    }

    /// Facts dropped by the backpressure queue since startup.
    #[must_use]
    pub fn queue_dropped_total(&self) -> u64 {
        self.queue.dropped_total()
    }

    /// Stop everything in dependency order.
    pub async fn shutdown(self) {
        info!("aggregator shutting down");

        // 1. Primary socket first: no new facts are produced after this.
        self.primary_cancel.cancel();
        let _ = self.primary_handle.await;

        // 2. Workers next; facts still queued are discarded, not flushed.
        self.worker_pool.shutdown().await;

        // 3. Broadcast loop, external feeds, poller, health server.
        self.aux_cancel.cancel();
        for handle in self.aux_handles {
            let _ = handle.await;
        }

        // 4. Bookkeeping.
        self.cache.clear();
        self.composer.clear();
        self.manager.clear();

        info!("aggregator stopped");
    }
}
