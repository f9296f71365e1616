//! External Feed Composer
//!
//! Aggregates trade flow from the auxiliary spot venues into cross-venue
//! composite metrics: weighted CVD deltas over trailing windows and a
//! freshness-gated open-interest blend against the primary venue. Venues
//! whose data has gone stale simply drop out of the weighted sums; the
//! composite degrades rather than going dark.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::ports::{MarketEvent, MarketEventSink};
use crate::domain::market::{OiComposite, OiSource};
use crate::domain::subscription::SubscriptionManager;
use crate::domain::symbol::Symbol;
use crate::infrastructure::cache::MarketCache;
use crate::infrastructure::config::ExternalFeedSettings;

pub mod oi;
pub mod series;
pub mod venue;

pub use series::CvdSeries;
pub use venue::{
    AuxInbound, AuxTrade, AuxVenueId, BinanceAdapter, OkxAdapter, VenueAdapter, VenueFeed,
};

/// Recompute cadence for composite metrics.
const COMPOSE_INTERVAL: Duration = Duration::from_secs(1);

/// Trailing windows for composite CVD deltas.
const CVD_SHORT_WINDOW: Duration = Duration::from_secs(60);
const CVD_LONG_WINDOW: Duration = Duration::from_secs(300);

/// Composite metrics for one symbol at one instant.
#[derive(Debug, Clone, Copy)]
pub struct ComposedMetrics {
    /// Weighted CVD delta over the trailing minute.
    pub cvd_1m: Option<Decimal>,
    /// Weighted CVD delta over the trailing five minutes.
    pub cvd_5m: Option<Decimal>,
    /// Open-interest blend, when a fresh source exists.
    pub oi: Option<OiComposite>,
}

/// Shared store of per-venue CVD series and external open interest.
#[derive(Debug)]
pub struct ExternalComposer {
    settings: ExternalFeedSettings,
    series: RwLock<HashMap<(AuxVenueId, Symbol), CvdSeries>>,
    external_oi: RwLock<HashMap<Symbol, (Decimal, DateTime<Utc>)>>,
}

impl ExternalComposer {
    /// New empty composer.
    #[must_use]
    pub fn new(settings: ExternalFeedSettings) -> Self {
        Self {
            settings,
            series: RwLock::new(HashMap::new()),
            external_oi: RwLock::new(HashMap::new()),
        }
    }

    /// Feed one auxiliary trade into its venue's series. Returns whether the
    /// trade contributed (duplicates and stale ids do not).
    pub fn record_trade(&self, venue: AuxVenueId, trade: &AuxTrade) -> bool {
        let mut series = self.series.write();
        series
            .entry((venue, trade.symbol.clone()))
            .or_default()
            .record(trade.trade_id, trade.side, trade.price, trade.size, trade.ts)
    }

    /// Record an externally polled open-interest observation.
    pub fn record_external_oi(&self, symbol: &Symbol, value: Decimal, ts: DateTime<Utc>) {
        self.external_oi.write().insert(symbol.clone(), (value, ts));
    }

    /// Compute the composite metrics for `symbol` as of `now`.
    ///
    /// `primary_oi` is the primary venue's open interest with its write time;
    /// both it and the external observation are gated by the configured TTL
    /// before entering the blend.
    #[must_use]
    pub fn composites(
        &self,
        symbol: &Symbol,
        primary_oi: Option<(Decimal, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> ComposedMetrics {
        ComposedMetrics {
            cvd_1m: self.weighted_cvd(symbol, CVD_SHORT_WINDOW, now),
            cvd_5m: self.weighted_cvd(symbol, CVD_LONG_WINDOW, now),
            oi: self.blend_oi(symbol, primary_oi, now),
        }
    }

    /// Weighted average of per-venue CVD deltas. Venues with stale or
    /// baseline-less series drop out; with no contributors the composite
    /// is absent rather than zero.
    fn weighted_cvd(&self, symbol: &Symbol, window: Duration, now: DateTime<Utc>) -> Option<Decimal> {
        let series = self.series.read();
        let mut weighted_sum = Decimal::ZERO;
        let mut weight_sum = Decimal::ZERO;

        for venue in [AuxVenueId::Binance, AuxVenueId::Okx] {
            let Some(entry) = series.get(&(venue, symbol.clone())) else {
                continue;
            };
            if !entry.is_fresh(self.settings.ttl, now) {
                continue;
            }
            let Some(delta) = entry.delta(window, now) else {
                continue;
            };
            let weight = self.cvd_weight(venue);
            weighted_sum += delta * weight;
            weight_sum += weight;
        }

        if weight_sum.is_zero() {
            None
        } else {
            Some(weighted_sum / weight_sum)
        }
    }

    fn blend_oi(
        &self,
        symbol: &Symbol,
        primary_oi: Option<(Decimal, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> Option<OiComposite> {
        let fresh = |ts: DateTime<Utc>| {
            now.signed_duration_since(ts)
                .to_std()
                .is_ok_and(|age| age <= self.settings.ttl)
        };

        let primary = primary_oi.filter(|(_, ts)| fresh(*ts)).map(|(v, _)| v);
        let external = self
            .external_oi
            .read()
            .get(symbol)
            .filter(|(_, ts)| fresh(*ts))
            .map(|(v, _)| *v);

        match (primary, external) {
            (Some(p), Some(e)) => {
                let wp = self.settings.oi_weight_primary;
                let we = self.settings.oi_weight_external;
                Some(OiComposite {
                    value: (p * wp + e * we) / (wp + we),
                    source: OiSource::Blended,
                })
            }
            (Some(p), None) => Some(OiComposite {
                value: p,
                source: OiSource::Primary,
            }),
            (None, Some(e)) => Some(OiComposite {
                value: e,
                source: OiSource::External,
            }),
            (None, None) => None,
        }
    }

    const fn cvd_weight(&self, venue: AuxVenueId) -> Decimal {
        match venue {
            AuxVenueId::Binance => self.settings.cvd_weight_binance,
            AuxVenueId::Okx => self.settings.cvd_weight_okx,
        }
    }

    /// Drop one venue's series for a symbol (on unsubscribe from that venue).
    pub fn evict_venue(&self, venue: AuxVenueId, symbol: &Symbol) {
        self.series.write().remove(&(venue, symbol.clone()));
    }

    /// Drop all state for a symbol (when it leaves the active set).
    pub fn evict(&self, symbol: &Symbol) {
        self.series
            .write()
            .retain(|(_, tracked), _| tracked != symbol);
        self.external_oi.write().remove(symbol);
    }

    /// Remove every series and observation. Shutdown teardown.
    pub fn clear(&self) {
        self.series.write().clear();
        self.external_oi.write().clear();
    }

    /// Number of live (venue, symbol) series.
    #[must_use]
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }
}

/// Periodically recompute composites for the active set and push them
/// through the ingestion sink.
pub async fn compose_loop(
    composer: Arc<ExternalComposer>,
    manager: Arc<SubscriptionManager>,
    cache: Arc<MarketCache>,
    sink: Arc<dyn MarketEventSink>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(COMPOSE_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    debug!("compose loop started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {
                let now = Utc::now();
                for symbol in manager.active_symbols() {
                    let primary = cache.primary_open_interest(&symbol);
                    let metrics = composer.composites(&symbol, primary, now);
                    sink.submit(MarketEvent::Composites {
                        symbol,
                        cvd_1m: metrics.cvd_1m,
                        cvd_5m: metrics.cvd_5m,
                        oi: metrics.oi,
                        ts: now,
                    });
                }
            }
        }
    }

    info!("compose loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::domain::market::Side;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn sym(s: &str) -> Symbol {
        Symbol::normalize(s).unwrap()
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn trade(id: u64, side: Side, notional: &str, ts: DateTime<Utc>) -> AuxTrade {
        AuxTrade {
            symbol: sym("BTC"),
            trade_id: id,
            side,
            price: dec(notional),
            size: Decimal::ONE,
            ts,
        }
    }

    /// Seeds a venue with a baseline sample followed by later flow so the
    /// trailing delta is well-defined.
    fn seed_venue(
        composer: &ExternalComposer,
        venue: AuxVenueId,
        baseline_ts: DateTime<Utc>,
        flow_ts: DateTime<Utc>,
        flow_notional: &str,
    ) {
        composer.record_trade(venue, &trade(1, Side::Buy, "0", baseline_ts));
        composer.record_trade(venue, &trade(2, Side::Buy, flow_notional, flow_ts));
    }

    #[test]
    fn composite_cvd_weights_venues() {
        let composer = ExternalComposer::new(ExternalFeedSettings::default());
        let t0 = base_time();
        let now = t0 + chrono::Duration::seconds(90);
        // Baselines 90s back (outside the 1m lookback), flow 30s back.
        seed_venue(&composer, AuxVenueId::Binance, t0, now - chrono::Duration::seconds(30), "100");
        seed_venue(&composer, AuxVenueId::Okx, t0, now - chrono::Duration::seconds(30), "200");

        let metrics = composer.composites(&sym("BTC"), None, now);
        // (100*0.6 + 200*0.4) / 1.0
        assert_eq!(metrics.cvd_1m, Some(dec("140")));
    }

    #[test]
    fn stale_venue_drops_out_of_composite() {
        let settings = ExternalFeedSettings::default();
        let ttl = settings.ttl;
        let composer = ExternalComposer::new(settings);
        let t0 = base_time();
        let now = t0 + chrono::Duration::seconds(90);

        seed_venue(&composer, AuxVenueId::Binance, t0, now - chrono::Duration::seconds(30), "100");
        // OKX last updated beyond the TTL relative to `later`.
        seed_venue(&composer, AuxVenueId::Okx, t0, now - chrono::Duration::seconds(30), "900");

        let later = now + chrono::Duration::from_std(ttl).unwrap() + chrono::Duration::seconds(1);
        // Refresh only Binance so it alone passes the gate at `later`.
        composer.record_trade(
            AuxVenueId::Binance,
            &trade(3, Side::Buy, "50", later - chrono::Duration::seconds(5)),
        );

        let metrics = composer.composites(&sym("BTC"), None, later);
        // Only Binance contributes: its own delta, undiluted by OKX's weight.
        assert_eq!(metrics.cvd_1m, Some(dec("50")));
    }

    #[test]
    fn no_fresh_venue_means_no_composite() {
        let composer = ExternalComposer::new(ExternalFeedSettings::default());
        let metrics = composer.composites(&sym("BTC"), None, base_time());
        assert_eq!(metrics.cvd_1m, None);
        assert_eq!(metrics.cvd_5m, None);
    }

    #[test]
    fn oi_blend_labels_sources() {
        let composer = ExternalComposer::new(ExternalFeedSettings::default());
        let now = base_time();

        // Both fresh: weighted blend.
        composer.record_external_oi(&sym("BTC"), dec("2000"), now);
        let oi = composer
            .composites(&sym("BTC"), Some((dec("1000"), now)), now)
            .oi
            .unwrap();
        assert_eq!(oi.source, OiSource::Blended);
        // (1000*0.7 + 2000*0.3) / 1.0
        assert_eq!(oi.value, dec("1300"));

        // Primary only.
        let oi = composer
            .composites(&sym("ETH"), Some((dec("500"), now)), now)
            .oi
            .unwrap();
        assert_eq!(oi.source, OiSource::Primary);
        assert_eq!(oi.value, dec("500"));
    }

    #[test]
    fn stale_external_oi_falls_back_to_primary() {
        let settings = ExternalFeedSettings::default();
        let ttl = settings.ttl;
        let composer = ExternalComposer::new(settings);
        let now = base_time();

        composer.record_external_oi(&sym("BTC"), dec("2000"), now);
        let later = now + chrono::Duration::from_std(ttl).unwrap() + chrono::Duration::seconds(1);

        let oi = composer
            .composites(&sym("BTC"), Some((dec("1000"), later)), later)
            .oi
            .unwrap();
        assert_eq!(oi.source, OiSource::Primary);
        assert_eq!(oi.value, dec("1000"));
    }

    #[test]
    fn oi_absent_when_no_source_is_fresh() {
        let composer = ExternalComposer::new(ExternalFeedSettings::default());
        assert!(composer.composites(&sym("BTC"), None, base_time()).oi.is_none());
    }

    #[test]
    fn evict_drops_all_venues_for_symbol() {
        let composer = ExternalComposer::new(ExternalFeedSettings::default());
        let now = base_time();
        composer.record_trade(AuxVenueId::Binance, &trade(1, Side::Buy, "10", now));
        composer.record_trade(AuxVenueId::Okx, &trade(1, Side::Buy, "10", now));
        assert_eq!(composer.series_count(), 2);

        composer.evict(&sym("BTC"));
        assert_eq!(composer.series_count(), 0);
    }

    #[test]
    fn evict_venue_leaves_other_venue_intact() {
        let composer = ExternalComposer::new(ExternalFeedSettings::default());
        let now = base_time();
        composer.record_trade(AuxVenueId::Binance, &trade(1, Side::Buy, "10", now));
        composer.record_trade(AuxVenueId::Okx, &trade(1, Side::Buy, "10", now));

        composer.evict_venue(AuxVenueId::Binance, &sym("BTC"));
        assert_eq!(composer.series_count(), 1);
    }
}
