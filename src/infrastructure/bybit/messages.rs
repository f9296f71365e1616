//! Bybit v5 Wire Messages
//!
//! Serde types for the linear-perp public WebSocket stream and helpers to
//! classify inbound frames. Venue numbers arrive as JSON strings; they are
//! decoded straight into `Decimal`.
//!
//! Malformed frames classify as [`BybitInbound::Unknown`] and are dropped by
//! the caller; a bad payload must never abort the read loop.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Outbound Control Frames
// =============================================================================

/// Subscribe/unsubscribe/ping control frame.
#[derive(Debug, Clone, Serialize)]
pub struct OpRequest {
    /// Operation: `subscribe`, `unsubscribe`, or `ping`.
    pub op: &'static str,
    /// Topic arguments, e.g. `publicTrade.BTCUSDT`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl OpRequest {
    /// Subscribe to `topics`.
    #[must_use]
    pub const fn subscribe(topics: Vec<String>) -> Self {
        Self {
            op: "subscribe",
            args: topics,
        }
    }

    /// Unsubscribe from `topics`.
    #[must_use]
    pub const fn unsubscribe(topics: Vec<String>) -> Self {
        Self {
            op: "unsubscribe",
            args: topics,
        }
    }

    /// Application-level ping; Bybit drops quiet connections.
    #[must_use]
    pub const fn ping() -> Self {
        Self {
            op: "ping",
            args: Vec::new(),
        }
    }
}

// =============================================================================
// Inbound Payloads
// =============================================================================

/// One trade print from a `publicTrade.*` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEntry {
    /// Trade time, Unix milliseconds.
    #[serde(rename = "T")]
    pub ts_ms: i64,
    /// Venue market id, e.g. `BTCUSDT`.
    #[serde(rename = "s")]
    pub market: String,
    /// Taker side, `Buy` or `Sell`.
    #[serde(rename = "S")]
    pub side: String,
    /// Trade size.
    #[serde(rename = "v")]
    pub size: Decimal,
    /// Trade price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Venue trade id.
    #[serde(rename = "i")]
    pub trade_id: String,
}

/// Payload of an `orderbook.*` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct BookData {
    /// Venue market id.
    #[serde(rename = "s")]
    pub market: String,
    /// Bid levels as (price, size).
    #[serde(rename = "b")]
    pub bids: Vec<(Decimal, Decimal)>,
    /// Ask levels as (price, size).
    #[serde(rename = "a")]
    pub asks: Vec<(Decimal, Decimal)>,
    /// Update id; `1` marks a forced snapshot.
    #[serde(rename = "u")]
    pub update_id: u64,
}

/// Payload of a `tickers.*` frame. Delta frames omit unchanged fields.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerData {
    /// Venue market id.
    #[serde(rename = "symbol")]
    pub market: String,
    /// Open interest, absent on unrelated deltas.
    #[serde(rename = "openInterest", default, deserialize_with = "de_opt_decimal")]
    pub open_interest: Option<Decimal>,
    /// Funding rate, absent on unrelated deltas.
    #[serde(rename = "fundingRate", default, deserialize_with = "de_opt_decimal")]
    pub funding_rate: Option<Decimal>,
    /// Last trade price, absent on unrelated deltas.
    #[serde(rename = "lastPrice", default, deserialize_with = "de_opt_decimal")]
    pub last_price: Option<Decimal>,
}

/// One event from an `allLiquidation.*` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct LiquidationEntry {
    /// Event time, Unix milliseconds.
    #[serde(rename = "T")]
    pub ts_ms: i64,
    /// Venue market id.
    #[serde(rename = "s")]
    pub market: String,
    /// Side of the closing order.
    #[serde(rename = "S")]
    pub side: String,
    /// Liquidated size.
    #[serde(rename = "v")]
    pub size: Decimal,
    /// Bankruptcy price.
    #[serde(rename = "p")]
    pub price: Decimal,
}

/// Bybit sends numeric fields as strings and sometimes as `""`; treat empty
/// and null as absent.
fn de_opt_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

// =============================================================================
// Frame Classification
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawFrame {
    topic: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    ts: Option<i64>,
    op: Option<String>,
    success: Option<bool>,
    ret_msg: Option<String>,
    data: Option<serde_json::Value>,
}

/// Whether a book frame replaces or amends the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookKind {
    /// Full replacement.
    Snapshot,
    /// Incremental update.
    Delta,
}

/// A classified inbound frame.
#[derive(Debug)]
pub enum BybitInbound {
    /// Acknowledgement of a subscribe/unsubscribe request.
    Ack {
        /// Whether the venue accepted the request.
        success: bool,
        /// Venue message on rejection.
        ret_msg: Option<String>,
    },
    /// Reply to an application-level ping.
    Pong,
    /// Trade prints.
    Trades {
        /// Frame timestamp, Unix milliseconds.
        ts_ms: i64,
        /// The prints.
        entries: Vec<TradeEntry>,
    },
    /// Order-book snapshot or delta.
    Book {
        /// Snapshot or delta.
        kind: BookKind,
        /// Frame timestamp, Unix milliseconds.
        ts_ms: i64,
        /// The book payload.
        data: BookData,
    },
    /// Ticker context (OI, funding, last price).
    Ticker {
        /// Frame timestamp, Unix milliseconds.
        ts_ms: i64,
        /// The ticker payload.
        data: TickerData,
    },
    /// Liquidation events.
    Liquidations {
        /// Frame timestamp, Unix milliseconds.
        ts_ms: i64,
        /// The events.
        entries: Vec<LiquidationEntry>,
    },
    /// Anything undecodable or unrecognized.
    Unknown,
}

/// Classify one inbound text frame.
#[must_use]
pub fn parse_frame(text: &str) -> BybitInbound {
    let Ok(raw) = serde_json::from_str::<RawFrame>(text) else {
        return BybitInbound::Unknown;
    };

    if let Some(op) = raw.op.as_deref() {
        return match op {
            "subscribe" | "unsubscribe" => BybitInbound::Ack {
                success: raw.success.unwrap_or(false),
                ret_msg: raw.ret_msg.filter(|m| !m.is_empty()),
            },
            "ping" | "pong" => BybitInbound::Pong,
            _ => BybitInbound::Unknown,
        };
    }

    let (Some(topic), Some(data)) = (raw.topic.as_deref(), raw.data) else {
        return BybitInbound::Unknown;
    };
    let ts_ms = raw.ts.unwrap_or_default();

    if topic.starts_with("publicTrade.") {
        match serde_json::from_value(data) {
            Ok(entries) => BybitInbound::Trades { ts_ms, entries },
            Err(_) => BybitInbound::Unknown,
        }
    } else if topic.starts_with("orderbook.") {
        let kind = match raw.kind.as_deref() {
            Some("snapshot") => BookKind::Snapshot,
            Some("delta") => BookKind::Delta,
            _ => return BybitInbound::Unknown,
        };
        match serde_json::from_value(data) {
            Ok(data) => BybitInbound::Book { kind, ts_ms, data },
            Err(_) => BybitInbound::Unknown,
        }
    } else if topic.starts_with("tickers.") {
        match serde_json::from_value(data) {
            Ok(data) => BybitInbound::Ticker { ts_ms, data },
            Err(_) => BybitInbound::Unknown,
        }
    } else if topic.starts_with("allLiquidation.") {
        match serde_json::from_value(data) {
            Ok(entries) => BybitInbound::Liquidations { ts_ms, entries },
            Err(_) => BybitInbound::Unknown,
        }
    } else {
        BybitInbound::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trade_frame() {
        let text = r#"{
            "topic": "publicTrade.BTCUSDT",
            "type": "snapshot",
            "ts": 1672304486868,
            "data": [{
                "T": 1672304486865,
                "s": "BTCUSDT",
                "S": "Buy",
                "v": "0.001",
                "p": "16578.50",
                "L": "PlusTick",
                "i": "20f43950-d8dd-5b31-9112-a178eb6023af",
                "BT": false
            }]
        }"#;

        match parse_frame(text) {
            BybitInbound::Trades { ts_ms, entries } => {
                assert_eq!(ts_ms, 1_672_304_486_868);
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].market, "BTCUSDT");
                assert_eq!(entries[0].side, "Buy");
                assert_eq!(entries[0].price, "16578.50".parse().unwrap());
            }
            other => panic!("expected trades, got {other:?}"),
        }
    }

    #[test]
    fn parses_book_delta_frame() {
        let text = r#"{
            "topic": "orderbook.40.BTCUSDT",
            "type": "delta",
            "ts": 1687565704,
            "data": {
                "s": "BTCUSDT",
                "b": [["30240.00", "1.305"], ["30239.00", "0"]],
                "a": [["30248.70", "0.416"]],
                "u": 177400507,
                "seq": 66544703342
            }
        }"#;

        match parse_frame(text) {
            BybitInbound::Book { kind, data, .. } => {
                assert_eq!(kind, BookKind::Delta);
                assert_eq!(data.bids.len(), 2);
                assert_eq!(data.bids[1].1, Decimal::ZERO);
                assert_eq!(data.asks[0].0, "30248.70".parse().unwrap());
            }
            other => panic!("expected book, got {other:?}"),
        }
    }

    #[test]
    fn parses_partial_ticker_delta() {
        let text = r#"{
            "topic": "tickers.BTCUSDT",
            "type": "delta",
            "ts": 1673272861686,
            "data": {
                "symbol": "BTCUSDT",
                "fundingRate": "-0.000212",
                "openInterest": ""
            }
        }"#;

        match parse_frame(text) {
            BybitInbound::Ticker { data, .. } => {
                assert_eq!(data.funding_rate, Some("-0.000212".parse().unwrap()));
                assert!(data.open_interest.is_none());
                assert!(data.last_price.is_none());
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn parses_liquidation_frame() {
        let text = r#"{
            "topic": "allLiquidation.ETHUSDT",
            "type": "snapshot",
            "ts": 1739502303204,
            "data": [{
                "T": 1739502302929,
                "s": "ETHUSDT",
                "S": "Sell",
                "v": "0.02",
                "p": "2671.76"
            }]
        }"#;

        match parse_frame(text) {
            BybitInbound::Liquidations { entries, .. } => {
                assert_eq!(entries[0].side, "Sell");
                assert_eq!(entries[0].size, "0.02".parse().unwrap());
            }
            other => panic!("expected liquidations, got {other:?}"),
        }
    }

    #[test]
    fn parses_subscribe_ack() {
        let text = r#"{"success":true,"ret_msg":"","conn_id":"x","op":"subscribe"}"#;
        match parse_frame(text) {
            BybitInbound::Ack { success, ret_msg } => {
                assert!(success);
                assert!(ret_msg.is_none());
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn rejected_ack_carries_message() {
        let text =
            r#"{"success":false,"ret_msg":"error:handler not found","op":"subscribe"}"#;
        match parse_frame(text) {
            BybitInbound::Ack { success, ret_msg } => {
                assert!(!success);
                assert_eq!(ret_msg.as_deref(), Some("error:handler not found"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_classify_as_unknown() {
        assert!(matches!(parse_frame("not json"), BybitInbound::Unknown));
        assert!(matches!(parse_frame("{}"), BybitInbound::Unknown));
        assert!(matches!(
            parse_frame(r#"{"topic":"publicTrade.BTCUSDT","data":{"bad":"shape"}}"#),
            BybitInbound::Unknown
        ));
    }

    #[test]
    fn subscribe_request_serializes_topics() {
        let req = OpRequest::subscribe(vec![
            "orderbook.40.BTCUSDT".to_string(),
            "publicTrade.BTCUSDT".to_string(),
        ]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""op":"subscribe""#));
        assert!(json.contains("orderbook.40.BTCUSDT"));
    }

    #[test]
    fn ping_omits_empty_args() {
        let json = serde_json::to_string(&OpRequest::ping()).unwrap();
        assert_eq!(json, r#"{"op":"ping"}"#);
    }
}
