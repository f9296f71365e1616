//! Bybit v5 REST Client
//!
//! Two read-only endpoints: full order-book snapshots (book hydration after
//! a subscribe) and the linear-perp instrument listing (backing the query
//! surface's token list). Rate-limit responses are surfaced as a distinct
//! error so the cooldown gate can react.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::application::ports::{DepthSnapshotSource, SnapshotError};
use crate::domain::symbol::Symbol;
use crate::infrastructure::metrics::{self, Venue};

/// Bybit venue retCode for acceptance.
const RET_CODE_OK: i64 = 0;

/// Errors from the REST client.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// Transport-level failure.
    #[error("bybit rest transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The venue rejected the call for rate-limiting reasons.
    #[error("bybit rest rate limited")]
    RateLimited,
    /// The venue answered with a non-zero retCode.
    #[error("bybit rest rejected (retCode {code}): {message}")]
    Venue {
        /// Venue retCode.
        code: i64,
        /// Venue retMsg.
        message: String,
    },
}

/// A tradable linear-perp instrument.
#[derive(Debug, Clone)]
pub struct Instrument {
    /// Venue market id, e.g. `BTCUSDT`.
    pub market: String,
    /// Normalized symbol, when the market id maps cleanly.
    pub symbol: Option<Symbol>,
    /// Venue trading status.
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OrderbookResult {
    #[serde(rename = "b")]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a")]
    asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResult {
    list: Vec<InstrumentRaw>,
}

#[derive(Debug, Deserialize)]
struct InstrumentRaw {
    symbol: String,
    status: String,
}

/// REST client for the primary venue.
#[derive(Debug, Clone)]
pub struct BybitRest {
    http: reqwest::Client,
    base_url: String,
    book_depth: usize,
}

impl BybitRest {
    /// New client against `base_url` requesting `book_depth` levels.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: String, book_depth: usize) -> Self {
        Self {
            http,
            base_url,
            book_depth,
        }
    }

    async fn get_envelope<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RestError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.http.get(&url).query(query).send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RestError::RateLimited);
        }
        let envelope: Envelope<T> = response.error_for_status()?.json().await?;

        if envelope.ret_code != RET_CODE_OK {
            // Bybit signals rate limiting in-band as well.
            if envelope.ret_code == 10006 {
                return Err(RestError::RateLimited);
            }
            return Err(RestError::Venue {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }
        envelope.result.ok_or(RestError::Venue {
            code: RET_CODE_OK,
            message: "missing result".to_string(),
        })
    }

    /// Fetch a full depth snapshot for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] on transport failure, rate limiting, or venue
    /// rejection.
    pub async fn orderbook(
        &self,
        symbol: &Symbol,
    ) -> Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>), RestError> {
        let result: OrderbookResult = self
            .get_envelope(
                "/v5/market/orderbook",
                &[
                    ("category", "linear".to_string()),
                    ("symbol", symbol.bybit_perp()),
                    ("limit", self.book_depth.to_string()),
                ],
            )
            .await?;
        debug!(symbol = %symbol, bids = result.bids.len(), asks = result.asks.len(), "depth snapshot fetched");
        Ok((result.bids, result.asks))
    }

    /// Fetch every tradable linear-perp instrument.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] on transport failure, rate limiting, or venue
    /// rejection.
    pub async fn instruments(&self) -> Result<Vec<Instrument>, RestError> {
        let result: InstrumentsResult = self
            .get_envelope(
                "/v5/market/instruments-info",
                &[
                    ("category", "linear".to_string()),
                    ("limit", "1000".to_string()),
                ],
            )
            .await?;

        Ok(result
            .list
            .into_iter()
            .map(|raw| {
                let symbol = Symbol::from_bybit_market(&raw.symbol);
                Instrument {
                    market: raw.symbol,
                    symbol,
                    status: raw.status,
                }
            })
            .collect())
    }
}

#[async_trait]
impl DepthSnapshotSource for BybitRest {
    async fn fetch_depth(
        &self,
        symbol: &Symbol,
    ) -> Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>), SnapshotError> {
        match self.orderbook(symbol).await {
            Ok(book) => Ok(book),
            Err(RestError::Transport(err)) => {
                metrics::record_snapshot_failure(Venue::Bybit);
                Err(SnapshotError::Transport(err.to_string()))
            }
            Err(err @ (RestError::RateLimited | RestError::Venue { .. })) => {
                metrics::record_snapshot_failure(Venue::Bybit);
                Err(SnapshotError::Rejected {
                    symbol: symbol.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_decodes_orderbook_result() {
        let body = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "s": "BTCUSDT",
                "b": [["65485.47", "47.081"]],
                "a": [["65557.7", "16.606"]],
                "ts": 1716863719031,
                "u": 230704
            }
        }"#;
        let envelope: Envelope<OrderbookResult> = serde_json::from_str(body).unwrap();
        let result = envelope.result.unwrap();
        assert_eq!(result.bids[0].0, "65485.47".parse().unwrap());
        assert_eq!(result.asks[0].1, "16.606".parse().unwrap());
    }

    #[test]
    fn envelope_surfaces_ret_code() {
        let body = r#"{"retCode":10001,"retMsg":"params error","result":null}"#;
        let envelope: Envelope<OrderbookResult> = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.ret_code, 10001);
        assert!(envelope.result.is_none());
    }

    #[test]
    fn instrument_listing_decodes() {
        let body = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "category": "linear",
                "list": [
                    {"symbol": "BTCUSDT", "status": "Trading", "baseCoin": "BTC"},
                    {"symbol": "10000NFTUSDT", "status": "Trading", "baseCoin": "10000NFT"}
                ]
            }
        }"#;
        let envelope: Envelope<InstrumentsResult> = serde_json::from_str(body).unwrap();
        let list = envelope.result.unwrap().list;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].symbol, "BTCUSDT");
    }
}
