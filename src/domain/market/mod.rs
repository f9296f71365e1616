//! Market Data Types
//!
//! Per-symbol latest-known state and the value types it is built from:
//! order book sides, trade prints, liquidation events, and derived walls.
//!
//! `SymbolState` is owned exclusively by the cache, mutated by the feed
//! connectors, and read by the broadcast loop and the query surface. Every
//! mutation path refreshes `updated_at`; consumers treat entries older than a
//! freshness threshold as stale rather than authoritative.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Maximum levels retained per book side.
pub const BOOK_DEPTH_CAP: usize = 40;

/// Maximum trade prints retained per symbol.
pub const TRADE_RING_CAP: usize = 100;

/// Maximum liquidation events retained per symbol.
pub const LIQUIDATION_RING_CAP: usize = 200;

/// Taker side of a trade or forced close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Aggressor bought.
    Buy,
    /// Aggressor sold.
    Sell,
}

/// A single price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting size at the level.
    pub size: Decimal,
}

/// A recent trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeTick {
    /// Trade price.
    pub price: Decimal,
    /// Trade size (base units).
    pub size: Decimal,
    /// Taker side.
    pub side: Side,
    /// Venue timestamp.
    pub ts: DateTime<Utc>,
}

/// A forced-close (liquidation) event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiquidationEvent {
    /// Side of the liquidated position's closing order.
    pub side: Side,
    /// Bankruptcy/fill price.
    pub price: Decimal,
    /// Liquidated quantity.
    pub size: Decimal,
    /// Venue timestamp.
    pub ts: DateTime<Utc>,
}

/// A book level whose resting size greatly exceeds the side-local average.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wall {
    /// Side the wall sits on.
    pub side: Side,
    /// Wall price level.
    pub price: Decimal,
    /// Resting size at the wall.
    pub size: Decimal,
}

/// Source label for a composite open-interest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OiSource {
    /// Only the primary venue's OI was fresh.
    Primary,
    /// Only the auxiliary venue's OI was fresh.
    External,
    /// Both sides were fresh and blended by weight.
    Blended,
}

/// A freshness-gated open-interest composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OiComposite {
    /// Blended (or single-source) open interest.
    pub value: Decimal,
    /// Which sources contributed.
    pub source: OiSource,
}

// =============================================================================
// Order Book
// =============================================================================

/// Two ordered sides of (price, size) levels, capped at [`BOOK_DEPTH_CAP`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderBook {
    /// Bid levels, best (highest price) first.
    pub bids: Vec<BookLevel>,
    /// Ask levels, best (lowest price) first.
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Whether both sides are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Best bid level, if any.
    #[must_use]
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    /// Best ask level, if any.
    #[must_use]
    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    /// Midpoint of the best bid/ask, if both sides are populated.
    #[must_use]
    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    /// Replace both sides wholesale (venue snapshot).
    pub fn apply_snapshot(&mut self, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) {
        self.bids = Self::sorted_side(bids, true);
        self.asks = Self::sorted_side(asks, false);
    }

    /// Apply an incremental delta: size zero removes a level, otherwise the
    /// level is inserted or replaced. Sides stay sorted and capped.
    pub fn apply_delta(&mut self, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) {
        Self::merge_side(&mut self.bids, bids, true);
        Self::merge_side(&mut self.asks, asks, false);
    }

    fn sorted_side(levels: Vec<(Decimal, Decimal)>, descending: bool) -> Vec<BookLevel> {
        let mut side: Vec<BookLevel> = levels
            .into_iter()
            .filter(|(_, size)| *size > Decimal::ZERO)
            .map(|(price, size)| BookLevel { price, size })
            .collect();
        if descending {
            side.sort_by(|a, b| b.price.cmp(&a.price));
        } else {
            side.sort_by(|a, b| a.price.cmp(&b.price));
        }
        side.truncate(BOOK_DEPTH_CAP);
        side
    }

    fn merge_side(side: &mut Vec<BookLevel>, deltas: Vec<(Decimal, Decimal)>, descending: bool) {
        for (price, size) in deltas {
            match side.iter().position(|level| level.price == price) {
                Some(idx) if size == Decimal::ZERO => {
                    side.remove(idx);
                }
                Some(idx) => side[idx].size = size,
                None if size > Decimal::ZERO => side.push(BookLevel { price, size }),
                None => {}
            }
        }
        if descending {
            side.sort_by(|a, b| b.price.cmp(&a.price));
        } else {
            side.sort_by(|a, b| a.price.cmp(&b.price));
        }
        side.truncate(BOOK_DEPTH_CAP);
    }
}

/// Detect walls: levels whose size exceeds `multiplier` × the side average.
///
/// A side with fewer than 3 levels produces no walls; the average is too
/// local to mean anything.
#[must_use]
pub fn detect_walls(book: &OrderBook, multiplier: Decimal) -> Vec<Wall> {
    let mut walls = Vec::new();
    for (levels, side) in [(&book.bids, Side::Buy), (&book.asks, Side::Sell)] {
        if levels.len() < 3 {
            continue;
        }
        let total: Decimal = levels.iter().map(|level| level.size).sum();
        let avg = total / Decimal::from(levels.len());
        let threshold = avg * multiplier;
        for level in levels {
            if level.size > threshold {
                walls.push(Wall {
                    side,
                    price: level.price,
                    size: level.size,
                });
            }
        }
    }
    walls
}

// =============================================================================
// Symbol State
// =============================================================================

/// Latest-known per-symbol state. One entry per tracked symbol, owned by the
/// cache. Missing, stale, and zero are distinct: optional fields stay `None`
/// until a venue reports them.
#[derive(Debug, Clone)]
pub struct SymbolState {
    /// Last best-mid or last-trade price.
    pub price: Option<Decimal>,
    /// When `price` was last written.
    pub price_ts: Option<DateTime<Utc>>,
    /// Order book, both sides capped at [`BOOK_DEPTH_CAP`].
    pub book: OrderBook,
    /// When the book was last written.
    pub book_ts: Option<DateTime<Utc>>,
    /// Recent trade prints, newest last, capped at [`TRADE_RING_CAP`].
    pub trades: VecDeque<TradeTick>,
    /// Primary-venue open interest.
    pub open_interest: Option<Decimal>,
    /// When `open_interest` was last written.
    pub open_interest_ts: Option<DateTime<Utc>>,
    /// Primary-venue funding rate.
    pub funding_rate: Option<Decimal>,
    /// Primary-venue cumulative volume delta (signed notional).
    pub cvd: Decimal,
    /// Cross-venue composite CVD over the trailing 1 minute.
    pub cvd_composite_1m: Option<Decimal>,
    /// Cross-venue composite CVD over the trailing 5 minutes.
    pub cvd_composite_5m: Option<Decimal>,
    /// Freshness-gated open-interest composite.
    pub oi_composite: Option<OiComposite>,
    /// Recent forced-close events, capped at [`LIQUIDATION_RING_CAP`].
    pub liquidations: VecDeque<LiquidationEvent>,
    /// Walls detected on the last book update.
    pub walls: Vec<Wall>,
    /// Last mutation time, any field.
    pub updated_at: DateTime<Utc>,
}

impl SymbolState {
    /// Fresh empty state stamped with `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            price: None,
            price_ts: None,
            book: OrderBook::default(),
            book_ts: None,
            trades: VecDeque::with_capacity(TRADE_RING_CAP),
            open_interest: None,
            open_interest_ts: None,
            funding_rate: None,
            cvd: Decimal::ZERO,
            cvd_composite_1m: None,
            cvd_composite_5m: None,
            oi_composite: None,
            liquidations: VecDeque::new(),
            walls: Vec::new(),
            updated_at: now,
        }
    }

    /// Record a price observation.
    pub fn record_price(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.price = Some(price);
        self.price_ts = Some(now);
        self.updated_at = now;
    }

    /// Replace the book with a venue snapshot and re-detect walls.
    pub fn apply_book_snapshot(
        &mut self,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        wall_multiplier: Decimal,
        now: DateTime<Utc>,
    ) {
        self.book.apply_snapshot(bids, asks);
        self.after_book_write(wall_multiplier, now);
    }

    /// Apply an incremental book delta and re-detect walls.
    pub fn apply_book_delta(
        &mut self,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        wall_multiplier: Decimal,
        now: DateTime<Utc>,
    ) {
        self.book.apply_delta(bids, asks);
        self.after_book_write(wall_multiplier, now);
    }

    fn after_book_write(&mut self, wall_multiplier: Decimal, now: DateTime<Utc>) {
        self.walls = detect_walls(&self.book, wall_multiplier);
        self.book_ts = Some(now);
        self.updated_at = now;
        if let Some(mid) = self.book.mid() {
            self.price = Some(mid);
            self.price_ts = Some(now);
        }
    }

    /// Record a trade print: ring buffer + primary CVD accumulation.
    pub fn record_trade(&mut self, trade: TradeTick, now: DateTime<Utc>) {
        let signed_notional = match trade.side {
            Side::Buy => trade.price * trade.size,
            Side::Sell => -(trade.price * trade.size),
        };
        self.cvd += signed_notional;

        if self.trades.len() >= TRADE_RING_CAP {
            self.trades.pop_front();
        }
        self.trades.push_back(trade);
        self.updated_at = now;
    }

    /// Record a liquidation event.
    pub fn record_liquidation(&mut self, event: LiquidationEvent, now: DateTime<Utc>) {
        if self.liquidations.len() >= LIQUIDATION_RING_CAP {
            self.liquidations.pop_front();
        }
        self.liquidations.push_back(event);
        self.updated_at = now;
    }

    /// Record primary-venue context (open interest and/or funding rate).
    pub fn record_context(
        &mut self,
        open_interest: Option<Decimal>,
        funding_rate: Option<Decimal>,
        now: DateTime<Utc>,
    ) {
        if let Some(oi) = open_interest {
            self.open_interest = Some(oi);
            self.open_interest_ts = Some(now);
        }
        if let Some(funding) = funding_rate {
            self.funding_rate = Some(funding);
        }
        self.updated_at = now;
    }

    /// Merge composite projections computed by the external feed composer.
    ///
    /// `updated_at` advances only when at least one composite is present:
    /// an all-absent projection clears the fields without counting as fresh
    /// market data, so staleness detection keeps working for symbols whose
    /// feeds have gone quiet.
    pub fn record_composites(
        &mut self,
        cvd_1m: Option<Decimal>,
        cvd_5m: Option<Decimal>,
        oi: Option<OiComposite>,
        now: DateTime<Utc>,
    ) {
        let any = cvd_1m.is_some() || cvd_5m.is_some() || oi.is_some();
        self.cvd_composite_1m = cvd_1m;
        self.cvd_composite_5m = cvd_5m;
        self.oi_composite = oi;
        if any {
            self.updated_at = now;
        }
    }

    /// Whether the state as a whole has gone stale.
    #[must_use]
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.updated_at);
        age.to_std().map_or(false, |age| age > ttl)
    }

    /// Immutable snapshot for broadcast and query payloads.
    #[must_use]
    pub fn snapshot(&self) -> SymbolSnapshot {
        SymbolSnapshot {
            price: self.price,
            price_ts: self.price_ts,
            bids: self.book.bids.clone(),
            asks: self.book.asks.clone(),
            book_ts: self.book_ts,
            open_interest: self.open_interest,
            funding_rate: self.funding_rate,
            cvd: self.cvd,
            cvd_composite_1m: self.cvd_composite_1m,
            cvd_composite_5m: self.cvd_composite_5m,
            oi_composite: self.oi_composite,
            walls: self.walls.clone(),
            trade_count: self.trades.len(),
            liquidation_count: self.liquidations.len(),
            updated_at: self.updated_at,
            stale: false,
        }
    }
}

/// Serializable point-in-time view of a symbol's state.
///
/// Optional fields are omitted from the wire payload when absent so that
/// consumers can distinguish "never reported" from zero.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolSnapshot {
    /// Last known price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// When the price was last written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_ts: Option<DateTime<Utc>>,
    /// Bid levels, best first.
    pub bids: Vec<BookLevel>,
    /// Ask levels, best first.
    pub asks: Vec<BookLevel>,
    /// When the book was last written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book_ts: Option<DateTime<Utc>>,
    /// Primary-venue open interest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<Decimal>,
    /// Primary-venue funding rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_rate: Option<Decimal>,
    /// Primary-venue cumulative volume delta.
    pub cvd: Decimal,
    /// Composite CVD, trailing 1 minute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvd_composite_1m: Option<Decimal>,
    /// Composite CVD, trailing 5 minutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvd_composite_5m: Option<Decimal>,
    /// Composite open interest with source label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi_composite: Option<OiComposite>,
    /// Walls from the last book update.
    pub walls: Vec<Wall>,
    /// Number of retained trade prints.
    pub trade_count: usize,
    /// Number of retained liquidation events.
    pub liquidation_count: usize,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Whether the state exceeded the serving-side freshness threshold.
    /// Set by the cache when the snapshot is taken.
    pub stale: bool,
}
