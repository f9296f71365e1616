//! External Open-Interest Poller
//!
//! Periodically pulls open interest for the active set from the auxiliary
//! futures REST endpoint and records the observations in the composer,
//! where TTL gating and blending happen.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ExternalComposer;
use crate::domain::subscription::SubscriptionManager;
use crate::domain::symbol::Symbol;

#[derive(Debug, Deserialize)]
struct OpenInterestResponse {
    #[serde(rename = "openInterest")]
    open_interest: Decimal,
    time: i64,
}

/// Polls the auxiliary open-interest endpoint on a fixed cadence.
pub struct OiPoller {
    http: reqwest::Client,
    url: String,
    interval: Duration,
    max_symbols: usize,
    manager: Arc<SubscriptionManager>,
    composer: Arc<ExternalComposer>,
    cancel: CancellationToken,
}

impl OiPoller {
    /// Construct a poller; call [`run`](Self::run) to drive it.
    #[must_use]
    pub fn new(
        url: String,
        interval: Duration,
        max_symbols: usize,
        manager: Arc<SubscriptionManager>,
        composer: Arc<ExternalComposer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            interval,
            max_symbols,
            manager,
            composer,
            cancel,
        }
    }

    /// Poll until cancelled. Failures are logged and retried on the next
    /// cadence; supplementary data never escalates.
    pub async fn run(self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    let symbols: Vec<Symbol> = self
                        .manager
                        .active_symbols()
                        .into_iter()
                        .take(self.max_symbols)
                        .collect();
                    for symbol in symbols {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        self.poll_symbol(&symbol).await;
                    }
                }
            }
        }

        info!("open interest poller stopped");
    }

    async fn poll_symbol(&self, symbol: &Symbol) {
        match self.fetch(symbol).await {
            Ok((value, ts_ms)) => {
                let ts = Utc
                    .timestamp_millis_opt(ts_ms)
                    .single()
                    .unwrap_or_else(Utc::now);
                self.composer.record_external_oi(symbol, value, ts);
                debug!(%symbol, %value, "external open interest recorded");
            }
            Err(err) => {
                warn!(%symbol, error = %err, "external open interest poll failed");
            }
        }
    }

    async fn fetch(&self, symbol: &Symbol) -> Result<(Decimal, i64), reqwest::Error> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("symbol", symbol.binance_perp())])
            .send()
            .await?
            .error_for_status()?;
        let body: OpenInterestResponse = response.json().await?;
        Ok((body.open_interest, body.time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_interest_response_parses() {
        let body = r#"{"openInterest":"10659.509","symbol":"BTCUSDT","time":1589437530011}"#;
        let parsed: OpenInterestResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.open_interest, "10659.509".parse().unwrap());
        assert_eq!(parsed.time, 1_589_437_530_011);
    }
}
