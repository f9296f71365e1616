//! Cumulative Volume Delta Series
//!
//! Per (venue, symbol) accumulation of signed trade notional, keyed by a
//! strictly increasing venue trade id so duplicate or replayed deliveries
//! are no-ops. A parallel `(timestamp, cumulative)` series is pruned to a
//! trailing window; deltas over a lookback are computed against the last
//! sample at or before the cutoff.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::market::Side;

/// Retention window for the cumulative series; must cover the longest
/// lookback (5 minutes) with margin.
pub const SERIES_WINDOW: Duration = Duration::from_secs(360);

/// One venue's cumulative signed-notional series for one symbol.
#[derive(Debug, Clone, Default)]
pub struct CvdSeries {
    cumulative: Decimal,
    last_trade_id: Option<u64>,
    samples: VecDeque<(DateTime<Utc>, Decimal)>,
    last_update: Option<DateTime<Utc>>,
}

impl CvdSeries {
    /// Empty series.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one trade. Ids at or below the last seen id are ignored,
    /// making redelivery idempotent. Returns whether the trade contributed.
    pub fn record(
        &mut self,
        trade_id: u64,
        side: Side,
        price: Decimal,
        size: Decimal,
        ts: DateTime<Utc>,
    ) -> bool {
        if self.last_trade_id.is_some_and(|last| trade_id <= last) {
            return false;
        }
        self.last_trade_id = Some(trade_id);

        let notional = price * size;
        self.cumulative += match side {
            Side::Buy => notional,
            Side::Sell => -notional,
        };
        self.samples.push_back((ts, self.cumulative));
        self.last_update = Some(ts);
        self.prune(ts);
        true
    }

    /// Delta of the cumulative value over `lookback`, or `None` until a
    /// baseline sample at or before the cutoff exists.
    #[must_use]
    pub fn delta(&self, lookback: Duration, now: DateTime<Utc>) -> Option<Decimal> {
        let Ok(lookback) = chrono::Duration::from_std(lookback) else {
            return None;
        };
        let cutoff = now - lookback;

        // Last sample at or before the cutoff.
        let baseline = self
            .samples
            .iter()
            .take_while(|(ts, _)| *ts <= cutoff)
            .last()
            .map(|(_, value)| *value)?;
        Some(self.cumulative - baseline)
    }

    /// Current cumulative signed notional.
    #[must_use]
    pub const fn cumulative(&self) -> Decimal {
        self.cumulative
    }

    /// When this series last absorbed a trade.
    #[must_use]
    pub const fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Whether the series absorbed a trade within `ttl` of `now`.
    #[must_use]
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.last_update.is_some_and(|at| {
            now.signed_duration_since(at)
                .to_std()
                .is_ok_and(|age| age <= ttl)
        })
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let Ok(window) = chrono::Duration::from_std(SERIES_WINDOW) else {
            return;
        };
        let cutoff = now - window;
        while self
            .samples
            .front()
            .is_some_and(|(ts, _)| *ts < cutoff)
        {
            self.samples.pop_front();
        }
    }
}
