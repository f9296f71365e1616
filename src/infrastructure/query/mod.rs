//! Synchronous Query Surface
//!
//! Read-only access to cached market state plus two upstream-proxied calls
//! (instrument listing and on-demand depth snapshots). Upstream calls go
//! through the request coalescer so concurrent identical callers share one
//! venue call, and through the cooldown gate so a 429 pauses the whole call
//! class. While cooling down, the last good value is served even if stale;
//! absence of any cached value is the only case that surfaces an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::market::{BookLevel, SymbolSnapshot, TradeTick, Wall};
use crate::domain::symbol::Symbol;
use crate::infrastructure::bybit::{BybitRest, Instrument, RestError};
use crate::infrastructure::cache::MarketCache;
use crate::infrastructure::coalesce::{CallClass, CooldownGate, Singleflight};
use crate::infrastructure::config::QuerySettings;
use crate::infrastructure::metrics::{self, QueryOutcome};

/// Raw depth levels: (bids, asks) as (price, size) pairs, best first.
pub type DepthLevels = (Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>);

/// Failures surfaced by the upstream-proxied query calls.
///
/// `Clone` because coalesced callers all receive the same settled result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The upstream call failed and no cached value exists to fall back on.
    #[error("upstream call failed: {0}")]
    Upstream(String),
    /// The upstream rejected the call for rate-limiting reasons.
    #[error("upstream rate limited")]
    RateLimited,
    /// The call class is cooling down and nothing cached is available.
    #[error("cooling down for {0:?} with no cached value")]
    CoolingDown(Duration),
}

/// The synchronous query surface.
pub struct QueryService {
    rest: Arc<BybitRest>,
    cache: Arc<MarketCache>,
    cooldown: Arc<CooldownGate>,
    token_flight: Singleflight<CallClass, Result<Arc<Vec<Instrument>>, QueryError>>,
    book_flight: Singleflight<Symbol, Result<Arc<DepthLevels>, QueryError>>,
    last_token_list: Arc<RwLock<Option<Arc<Vec<Instrument>>>>>,
    last_books: Arc<RwLock<HashMap<Symbol, Arc<DepthLevels>>>>,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("inflight_token_calls", &self.token_flight.inflight_count())
            .field("inflight_book_calls", &self.book_flight.inflight_count())
            .finish_non_exhaustive()
    }
}

impl QueryService {
    /// Build the query surface over the shared cache and REST client.
    #[must_use]
    pub fn new(settings: &QuerySettings, rest: Arc<BybitRest>, cache: Arc<MarketCache>) -> Self {
        Self {
            rest,
            cache,
            cooldown: Arc::new(CooldownGate::new(
                settings.cooldown_floor,
                settings.cooldown_multiplier,
                settings.cooldown_ceiling,
            )),
            token_flight: Singleflight::new(),
            book_flight: Singleflight::new(),
            last_token_list: Arc::new(RwLock::new(None)),
            last_books: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // =========================================================================
    // Cached Reads
    // =========================================================================

    /// Full cached snapshot for one symbol.
    #[must_use]
    pub fn snapshot(&self, symbol: &Symbol) -> Option<SymbolSnapshot> {
        self.cache.snapshot(symbol)
    }

    /// Top `depth` levels of the cached book, best first.
    #[must_use]
    pub fn book_top(&self, symbol: &Symbol, depth: usize) -> Option<(Vec<BookLevel>, Vec<BookLevel>)> {
        let snap = self.cache.snapshot(symbol)?;
        let mut bids = snap.bids;
        let mut asks = snap.asks;
        bids.truncate(depth);
        asks.truncate(depth);
        Some((bids, asks))
    }

    /// Most recent trades, newest first.
    #[must_use]
    pub fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Vec<TradeTick> {
        self.cache.recent_trades(symbol, limit)
    }

    /// Currently detected walls.
    #[must_use]
    pub fn walls(&self, symbol: &Symbol) -> Vec<Wall> {
        self.cache
            .snapshot(symbol)
            .map_or_else(Vec::new, |snap| snap.walls)
    }

    // =========================================================================
    // Upstream Proxies
    // =========================================================================

    /// The tradable-instrument list, coalesced across concurrent callers.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] only when the upstream call fails (or is
    /// cooling down) and no previous good result is cached.
    pub async fn token_list(&self) -> Result<Arc<Vec<Instrument>>, QueryError> {
        if let Some(remaining) = self.cooldown.check(CallClass::TokenList) {
            if let Some(cached) = self.last_token_list.read().clone() {
                metrics::record_query_call(CallClass::TokenList.as_str(), QueryOutcome::Cooldown);
                return Ok(cached);
            }
            return Err(QueryError::CoolingDown(remaining));
        }

        let rest = Arc::clone(&self.rest);
        let cooldown = Arc::clone(&self.cooldown);
        let last = Arc::clone(&self.last_token_list);
        let (result, leader) = self
            .token_flight
            .run(CallClass::TokenList, move || async move {
                match rest.instruments().await {
                    Ok(list) => {
                        cooldown.on_success(CallClass::TokenList);
                        let list = Arc::new(list);
                        *last.write() = Some(Arc::clone(&list));
                        Ok(list)
                    }
                    Err(RestError::RateLimited) => {
                        warn!("instrument listing rate limited, entering cooldown");
                        cooldown.on_rate_limited(CallClass::TokenList);
                        Err(QueryError::RateLimited)
                    }
                    Err(err) => Err(QueryError::Upstream(err.to_string())),
                }
            })
            .await;

        self.finish_token_call(result, leader)
    }

    fn finish_token_call(
        &self,
        result: Result<Arc<Vec<Instrument>>, QueryError>,
        leader: bool,
    ) -> Result<Arc<Vec<Instrument>>, QueryError> {
        match result {
            Ok(list) => {
                let outcome = if leader { QueryOutcome::Upstream } else { QueryOutcome::Coalesced };
                metrics::record_query_call(CallClass::TokenList.as_str(), outcome);
                Ok(list)
            }
            Err(err) => {
                if let Some(cached) = self.last_token_list.read().clone() {
                    debug!(error = %err, "serving stale instrument list");
                    metrics::record_query_call(
                        CallClass::TokenList.as_str(),
                        QueryOutcome::StaleFallback,
                    );
                    return Ok(cached);
                }
                Err(err)
            }
        }
    }

    /// An on-demand depth snapshot straight from the venue, coalesced per
    /// symbol. The whole call class shares one cooldown: a 429 on any symbol
    /// pauses fresh snapshots for all of them.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] only when the upstream call fails (or is
    /// cooling down) and no previous good snapshot for this symbol is cached.
    pub async fn depth_snapshot(&self, symbol: &Symbol) -> Result<Arc<DepthLevels>, QueryError> {
        if let Some(remaining) = self.cooldown.check(CallClass::BookSnapshot) {
            if let Some(cached) = self.last_books.read().get(symbol).cloned() {
                metrics::record_query_call(CallClass::BookSnapshot.as_str(), QueryOutcome::Cooldown);
                return Ok(cached);
            }
            return Err(QueryError::CoolingDown(remaining));
        }

        let rest = Arc::clone(&self.rest);
        let cooldown = Arc::clone(&self.cooldown);
        let last = Arc::clone(&self.last_books);
        let key = symbol.clone();
        let fetch_symbol = symbol.clone();
        let (result, leader) = self
            .book_flight
            .run(key, move || async move {
                match rest.orderbook(&fetch_symbol).await {
                    Ok(levels) => {
                        cooldown.on_success(CallClass::BookSnapshot);
                        let levels = Arc::new(levels);
                        last.write().insert(fetch_symbol, Arc::clone(&levels));
                        Ok(levels)
                    }
                    Err(RestError::RateLimited) => {
                        warn!(symbol = %fetch_symbol, "depth snapshot rate limited, entering cooldown");
                        cooldown.on_rate_limited(CallClass::BookSnapshot);
                        Err(QueryError::RateLimited)
                    }
                    Err(err) => Err(QueryError::Upstream(err.to_string())),
                }
            })
            .await;

        match result {
            Ok(levels) => {
                let outcome = if leader { QueryOutcome::Upstream } else { QueryOutcome::Coalesced };
                metrics::record_query_call(CallClass::BookSnapshot.as_str(), outcome);
                Ok(levels)
            }
            Err(err) => {
                if let Some(cached) = self.last_books.read().get(symbol).cloned() {
                    debug!(symbol = %symbol, error = %err, "serving stale depth snapshot");
                    metrics::record_query_call(
                        CallClass::BookSnapshot.as_str(),
                        QueryOutcome::StaleFallback,
                    );
                    return Ok(cached);
                }
                Err(err)
            }
        }
    }

    /// Remaining cooldown for a call class, if one is active.
    #[must_use]
    pub fn cooldown_remaining(&self, class: CallClass) -> Option<Duration> {
        self.cooldown.check(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::application::ports::MarketEvent;
    use crate::domain::market::{Side, TradeTick};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn sym(s: &str) -> Symbol {
        Symbol::normalize(s).unwrap()
    }

    fn service_with_cache() -> (QueryService, Arc<MarketCache>) {
        let cache = Arc::new(MarketCache::new(dec("3"), Duration::from_secs(60)));
        let rest = Arc::new(BybitRest::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1".to_string(),
            40,
        ));
        let service = QueryService::new(&QuerySettings::default(), rest, Arc::clone(&cache));
        (service, cache)
    }

    #[test]
    fn book_top_truncates_to_requested_depth() {
        let (service, cache) = service_with_cache();
        cache.apply(MarketEvent::BookSnapshot {
            symbol: sym("BTC"),
            bids: vec![
                (dec("100"), dec("1")),
                (dec("99"), dec("1")),
                (dec("98"), dec("1")),
            ],
            asks: vec![(dec("101"), dec("1"))],
            ts: Utc::now(),
        });

        let (bids, asks) = service.book_top(&sym("BTC"), 2).unwrap();
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].price, dec("100"));
        assert_eq!(asks.len(), 1);
    }

    #[test]
    fn recent_trades_come_newest_first() {
        let (service, cache) = service_with_cache();
        for price in ["1", "2", "3"] {
            cache.apply(MarketEvent::Trade {
                symbol: sym("BTC"),
                trade: TradeTick {
                    price: dec(price),
                    size: Decimal::ONE,
                    side: Side::Buy,
                    ts: Utc::now(),
                },
            });
        }

        let trades = service.recent_trades(&sym("BTC"), 2);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].price, dec("3"));
        assert_eq!(trades[1].price, dec("2"));
    }

    #[test]
    fn unknown_symbol_reads_are_empty() {
        let (service, _cache) = service_with_cache();
        assert!(service.snapshot(&sym("DOGE")).is_none());
        assert!(service.book_top(&sym("DOGE"), 5).is_none());
        assert!(service.recent_trades(&sym("DOGE"), 5).is_empty());
        assert!(service.walls(&sym("DOGE")).is_empty());
    }

    #[tokio::test]
    async fn cooldown_without_cache_surfaces_an_error() {
        let (service, _cache) = service_with_cache();
        service.cooldown.on_rate_limited(CallClass::TokenList);

        match service.token_list().await {
            Err(QueryError::CoolingDown(remaining)) => assert!(remaining > Duration::ZERO),
            other => panic!("expected cooldown error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cooldown_with_cache_serves_the_last_good_list() {
        let (service, _cache) = service_with_cache();
        let cached = Arc::new(vec![Instrument {
            market: "BTCUSDT".to_string(),
            symbol: Some(sym("BTC")),
            status: "Trading".to_string(),
        }]);
        *service.last_token_list.write() = Some(Arc::clone(&cached));
        service.cooldown.on_rate_limited(CallClass::TokenList);

        let list = service.token_list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].market, "BTCUSDT");
    }

    #[tokio::test]
    async fn upstream_failure_falls_back_to_stale_snapshot() {
        // The REST base points at a closed port, so the upstream call fails;
        // the previously cached depth must be served instead.
        let (service, _cache) = service_with_cache();
        let cached: Arc<DepthLevels> =
            Arc::new((vec![(dec("100"), dec("1"))], vec![(dec("101"), dec("1"))]));
        service
            .last_books
            .write()
            .insert(sym("BTC"), Arc::clone(&cached));

        let levels = service.depth_snapshot(&sym("BTC")).await.unwrap();
        assert_eq!(levels.0[0].0, dec("100"));
    }
}
