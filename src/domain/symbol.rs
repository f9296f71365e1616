//! Symbol Registry
//!
//! Validation and normalization of symbol tokens. Symbols are the sharding
//! key for every other entity in the aggregator: cache entries, subscription
//! refcounts, and external metric series are all keyed by `Symbol`.
//!
//! Normalization is a pure function: venue suffixes and quote pairs are
//! stripped, the result is uppercased, and anything that does not match the
//! token grammar (`[A-Z0-9]{1,20}`) is rejected.

use serde::{Deserialize, Serialize};

/// Maximum length of a normalized symbol token.
pub const MAX_SYMBOL_LEN: usize = 20;

/// Quote-asset suffixes stripped during normalization, longest first so that
/// `USDT` wins over `USD`.
const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "BUSD", "USD"];

/// Venue-style derivative suffixes stripped before quote-pair handling.
const VENUE_SUFFIXES: &[&str] = &[".P", "-PERP", "_PERP", "-SWAP"];

/// Errors produced by symbol normalization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// Input was empty after stripping suffixes.
    #[error("empty symbol")]
    Empty,

    /// Normalized token exceeds [`MAX_SYMBOL_LEN`].
    #[error("symbol too long: {0}")]
    TooLong(String),

    /// Token contains characters outside `[A-Z0-9]`.
    #[error("invalid symbol: {0}")]
    InvalidCharacters(String),
}

/// A validated, normalized symbol token (uppercase alphanumeric, ≤20 chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Normalize a raw token into a canonical symbol.
    ///
    /// Strips venue suffixes (`.P`, `-PERP`, `-SWAP`), separator-delimited
    /// quote pairs (`BTC-USDT`, `BTC_USD`), and trailing quote assets
    /// (`BTCUSDT` → `BTC`), then validates the remaining token.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError`] if the result is empty, too long, or contains
    /// characters outside the token grammar.
    pub fn normalize(raw: &str) -> Result<Self, SymbolError> {
        let mut token = raw.trim().to_uppercase();

        for suffix in VENUE_SUFFIXES {
            if let Some(stripped) = token.strip_suffix(suffix) {
                token = stripped.to_string();
                break;
            }
        }

        // Separator-delimited quote pair: keep only the base asset.
        if let Some((base, quote)) = token.split_once(['-', '_', '/']) {
            if QUOTE_SUFFIXES.contains(&quote) {
                token = base.to_string();
            } else {
                // Unknown counter-asset; collapse the separator and validate
                // the concatenation below.
                token = format!("{base}{quote}");
            }
        }

        for suffix in QUOTE_SUFFIXES {
            if token.len() > suffix.len() {
                if let Some(stripped) = token.strip_suffix(suffix) {
                    token = stripped.to_string();
                    break;
                }
            }
        }

        if token.is_empty() {
            return Err(SymbolError::Empty);
        }
        if token.len() > MAX_SYMBOL_LEN {
            return Err(SymbolError::TooLong(token));
        }
        if !token.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            return Err(SymbolError::InvalidCharacters(token));
        }

        Ok(Self(token))
    }

    /// The canonical token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bybit linear perpetual product id (e.g. `BTCUSDT`).
    #[must_use]
    pub fn bybit_perp(&self) -> String {
        format!("{}USDT", self.0)
    }

    /// Binance combined-stream name for aggregate trades (e.g. `btcusdt@aggTrade`).
    #[must_use]
    pub fn binance_stream(&self) -> String {
        format!("{}usdt@aggTrade", self.0.to_lowercase())
    }

    /// Binance USDT-margined futures product id (e.g. `BTCUSDT`).
    #[must_use]
    pub fn binance_perp(&self) -> String {
        format!("{}USDT", self.0)
    }

    /// OKX spot instrument id (e.g. `BTC-USDT`).
    #[must_use]
    pub fn okx_inst(&self) -> String {
        format!("{}-USDT", self.0)
    }

    /// Recover a symbol from a Bybit product id (`BTCUSDT` → `BTC`).
    #[must_use]
    pub fn from_bybit_market(market: &str) -> Option<Self> {
        Self::normalize(market).ok()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
