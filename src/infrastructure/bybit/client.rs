//! Bybit v5 WebSocket Client
//!
//! Maintains the single connection to the primary venue's linear-perp public
//! stream. The connection lifecycle is
//! `Disconnected → Connecting → Subscribing → Streaming → Disconnected`,
//! with reconnect delays governed by [`BackoffPolicy`].
//!
//! While streaming, the read loop uses a short poll timeout; a quiet socket
//! is the opportunity to service pending subscription changes (diffing the
//! multiplexer's active set against what this session has subscribed) and to
//! send the application-level ping the venue requires. Subscribes go out in
//! small batches with a pause in between so a large active set does not
//! burst the venue's control-frame limits.
//!
//! On every reconnect the per-session subscription bookkeeping starts empty;
//! nothing is assumed still subscribed from a previous connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{BookKind, BybitInbound, OpRequest, parse_frame};
use crate::application::ports::{DepthSnapshotSource, MarketEvent, MarketEventSink};
use crate::domain::market::{LiquidationEvent, Side, TradeTick};
use crate::domain::subscription::SubscriptionManager;
use crate::domain::symbol::Symbol;
use crate::infrastructure::cache::MarketCache;
use crate::infrastructure::metrics::{self, Venue};
use crate::infrastructure::config::PrimaryFeedSettings;
use crate::infrastructure::ws::{
    BackoffPolicy, ConnectionPhase, DisconnectClass, FeedState,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = futures_util::stream::SplitSink<WsStream, Message>;

/// Application-level ping cadence; Bybit drops connections quiet for 30s+.
const PING_INTERVAL: Duration = Duration::from_secs(20);

enum SessionEnd {
    Cancelled,
    Disconnected(DisconnectClass),
}

/// The primary-venue feed connector.
pub struct BybitClient {
    settings: PrimaryFeedSettings,
    ws_url: String,
    manager: Arc<SubscriptionManager>,
    sink: Arc<dyn MarketEventSink>,
    snapshots: Arc<dyn DepthSnapshotSource>,
    cache: Arc<MarketCache>,
    feed_state: Arc<FeedState>,
    cancel: CancellationToken,
}

impl BybitClient {
    /// Construct a connector; call [`run`](Self::run) to drive it.
    #[must_use]
    pub fn new(
        settings: PrimaryFeedSettings,
        ws_url: String,
        manager: Arc<SubscriptionManager>,
        sink: Arc<dyn MarketEventSink>,
        snapshots: Arc<dyn DepthSnapshotSource>,
        cache: Arc<MarketCache>,
        feed_state: Arc<FeedState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            ws_url,
            manager,
            sink,
            snapshots,
            cache,
            feed_state,
            cancel,
        }
    }

    /// Drive connect/reconnect until cancelled.
    pub async fn run(self) {
        let mut backoff = BackoffPolicy::new(self.settings.backoff.clone());

        while !self.cancel.is_cancelled() {
            self.feed_state.set_phase(ConnectionPhase::Connecting);
            info!(url = %self.ws_url, "connecting to primary venue");

            let end = match connect_async(self.ws_url.as_str()).await {
                Ok((stream, _response)) => self.drive_session(stream, &mut backoff).await,
                Err(err) => {
                    let class = classify_connect_error(&err);
                    warn!(error = %err, ?class, "primary handshake failed");
                    self.feed_state.record_disconnect(None, Some(err.to_string()));
                    SessionEnd::Disconnected(class)
                }
            };

            let class = match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Disconnected(class) => class,
            };

            let delay = backoff.on_disconnect(class);
            metrics::record_reconnect(Venue::Bybit);
            self.feed_state.increment_reconnect_attempts();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempt_count(),
                "primary reconnect scheduled"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.feed_state.set_phase(ConnectionPhase::Closing);
        info!("primary connector stopped");
        self.feed_state.set_phase(ConnectionPhase::Disconnected);
    }

    async fn drive_session(&self, stream: WsStream, backoff: &mut BackoffPolicy) -> SessionEnd {
        let (mut writer, mut reader) = stream.split();
        self.feed_state.set_phase(ConnectionPhase::Subscribing);

        // Fresh session, fresh bookkeeping.
        let mut subscribed: HashSet<Symbol> = HashSet::new();
        let mut streaming = false;
        let mut last_ping = Instant::now();

        if self.sync_subscriptions(&mut writer, &mut subscribed).await.is_err() {
            self.feed_state.record_disconnect(None, Some("subscribe write failed".to_string()));
            return SessionEnd::Disconnected(DisconnectClass::Transport);
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                frame = tokio::time::timeout(self.settings.poll_timeout, reader.next()) => {
                    match frame {
                        // Quiet socket: service subscription changes and keepalive.
                        Err(_elapsed) => {
                            if last_ping.elapsed() >= PING_INTERVAL {
                                if send_json(&mut writer, &OpRequest::ping()).await.is_err() {
                                    self.feed_state.record_disconnect(None, Some("ping write failed".to_string()));
                                    return SessionEnd::Disconnected(DisconnectClass::Transport);
                                }
                                last_ping = Instant::now();
                            }
                            if self.sync_subscriptions(&mut writer, &mut subscribed).await.is_err() {
                                self.feed_state.record_disconnect(None, Some("subscribe write failed".to_string()));
                                return SessionEnd::Disconnected(DisconnectClass::Transport);
                            }
                        }
                        Ok(Some(Ok(message))) => {
                            match self.handle_message(message, &mut writer, &mut streaming, backoff).await {
                                Ok(true) => {}
                                Ok(false) | Err(()) => {
                                    return SessionEnd::Disconnected(DisconnectClass::Transport);
                                }
                            }
                        }
                        Ok(Some(Err(err))) => {
                            warn!(error = %err, "primary read error");
                            self.feed_state.record_disconnect(None, Some(err.to_string()));
                            return SessionEnd::Disconnected(DisconnectClass::Transport);
                        }
                        Ok(None) => {
                            self.feed_state.record_disconnect(None, Some("stream ended".to_string()));
                            return SessionEnd::Disconnected(DisconnectClass::Transport);
                        }
                    }
                }
            }
        }
    }

    /// Handle one inbound message. Returns `Ok(false)` when the venue closed
    /// the connection.
    async fn handle_message(
        &self,
        message: Message,
        writer: &mut WsWriter,
        streaming: &mut bool,
        backoff: &mut BackoffPolicy,
    ) -> Result<bool, ()> {
        match message {
            Message::Text(text) => {
                self.feed_state.increment_messages();
                self.handle_frame(text.as_str(), streaming, backoff);
                Ok(true)
            }
            Message::Ping(payload) => {
                writer.send(Message::Pong(payload)).await.map_err(|_| ())?;
                Ok(true)
            }
            Message::Close(frame) => {
                let (code, reason) = close_details(frame);
                info!(?code, reason = reason.as_deref(), "primary venue closed connection");
                self.feed_state.record_disconnect(code, reason);
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    fn handle_frame(&self, text: &str, streaming: &mut bool, backoff: &mut BackoffPolicy) {
        match parse_frame(text) {
            BybitInbound::Ack { success: true, .. } => {
                if !*streaming {
                    *streaming = true;
                    backoff.on_streaming();
                    self.feed_state.set_phase(ConnectionPhase::Streaming);
                    info!("primary feed streaming");
                }
            }
            BybitInbound::Ack { success: false, ret_msg } => {
                warn!(ret_msg = ret_msg.as_deref(), "primary venue rejected subscription");
            }
            BybitInbound::Pong => {}
            BybitInbound::Trades { entries, .. } => {
                for entry in entries {
                    let Some(symbol) = Symbol::from_bybit_market(&entry.market) else {
                        continue;
                    };
                    let Some(side) = parse_side(&entry.side) else { continue };
                    metrics::record_message_received(Venue::Bybit, "trade");
                    self.sink.submit(MarketEvent::Trade {
                        symbol,
                        trade: TradeTick {
                            price: entry.price,
                            size: entry.size,
                            side,
                            ts: ts_from_ms(entry.ts_ms),
                        },
                    });
                }
            }
            BybitInbound::Book { kind, ts_ms, data } => {
                let Some(symbol) = Symbol::from_bybit_market(&data.market) else {
                    return;
                };
                let ts = ts_from_ms(ts_ms);
                metrics::record_message_received(Venue::Bybit, "book");
                let event = match kind {
                    BookKind::Snapshot => MarketEvent::BookSnapshot {
                        symbol,
                        bids: data.bids,
                        asks: data.asks,
                        ts,
                    },
                    BookKind::Delta => MarketEvent::BookDelta {
                        symbol,
                        bids: data.bids,
                        asks: data.asks,
                        ts,
                    },
                };
                self.sink.submit(event);
            }
            BybitInbound::Ticker { ts_ms, data } => {
                let Some(symbol) = Symbol::from_bybit_market(&data.market) else {
                    return;
                };
                let ts = ts_from_ms(ts_ms);
                metrics::record_message_received(Venue::Bybit, "ticker");
                if data.open_interest.is_some() || data.funding_rate.is_some() {
                    self.sink.submit(MarketEvent::Context {
                        symbol: symbol.clone(),
                        open_interest: data.open_interest,
                        funding_rate: data.funding_rate,
                        ts,
                    });
                }
                if let Some(price) = data.last_price {
                    self.sink.submit(MarketEvent::Price { symbol, price, ts });
                }
            }
            BybitInbound::Liquidations { entries, .. } => {
                for entry in entries {
                    let Some(symbol) = Symbol::from_bybit_market(&entry.market) else {
                        continue;
                    };
                    let Some(side) = parse_side(&entry.side) else { continue };
                    metrics::record_message_received(Venue::Bybit, "liquidation");
                    self.sink.submit(MarketEvent::Liquidation {
                        symbol,
                        event: LiquidationEvent {
                            side,
                            price: entry.price,
                            size: entry.size,
                            ts: ts_from_ms(entry.ts_ms),
                        },
                    });
                }
            }
            BybitInbound::Unknown => {
                debug!("dropping unrecognized primary frame");
            }
        }
    }

    /// Diff the multiplexer's active set against this session's subscribed
    /// set and issue the deltas, batching subscribes.
    async fn sync_subscriptions(
        &self,
        writer: &mut WsWriter,
        subscribed: &mut HashSet<Symbol>,
    ) -> Result<(), ()> {
        let desired: HashSet<Symbol> = self.manager.active_symbols().into_iter().collect();

        let to_remove: Vec<Symbol> = subscribed.difference(&desired).cloned().collect();
        if !to_remove.is_empty() {
            let topics = to_remove.iter().flat_map(|s| self.topics_for(s)).collect();
            send_json(writer, &OpRequest::unsubscribe(topics)).await.map_err(|_| ())?;
            for symbol in &to_remove {
                subscribed.remove(symbol);
            }
            debug!(count = to_remove.len(), "unsubscribed departed symbols");
        }

        let mut to_add: Vec<Symbol> = desired.difference(subscribed).cloned().collect();
        to_add.sort();
        if to_add.is_empty() {
            return Ok(());
        }

        let batch_size = self.settings.subscribe_batch_size.max(1);
        for (index, batch) in to_add.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.subscribe_batch_pause).await;
            }
            let topics = batch.iter().flat_map(|s| self.topics_for(s)).collect();
            send_json(writer, &OpRequest::subscribe(topics)).await.map_err(|_| ())?;
            debug!(count = batch.len(), "subscribe batch sent");
        }

        for symbol in to_add {
            // Hydrate only books with no cached levels: on reconnect the
            // book usually survives in the cache, and a late REST snapshot
            // must not overwrite levels already advanced by stream deltas.
            if !self.cache.has_book(&symbol) {
                self.spawn_book_hydration(symbol.clone());
            }
            subscribed.insert(symbol);
        }
        Ok(())
    }

    /// Seed the order book from REST off the read loop's critical path.
    fn spawn_book_hydration(&self, symbol: Symbol) {
        let snapshots = Arc::clone(&self.snapshots);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            match snapshots.fetch_depth(&symbol).await {
                Ok((bids, asks)) => {
                    sink.submit(MarketEvent::BookSnapshot {
                        symbol,
                        bids,
                        asks,
                        ts: Utc::now(),
                    });
                }
                Err(err) => {
                    warn!(symbol = %symbol, error = %err, "book hydration failed");
                }
            }
        });
    }

    fn topics_for(&self, symbol: &Symbol) -> Vec<String> {
        let market = symbol.bybit_perp();
        vec![
            format!("orderbook.{}.{market}", self.settings.book_depth),
            format!("publicTrade.{market}"),
            format!("tickers.{market}"),
            format!("allLiquidation.{market}"),
        ]
    }
}

async fn send_json(
    writer: &mut WsWriter,
    request: &OpRequest,
) -> Result<(), tungstenite::Error> {
    let text = serde_json::to_string(request).unwrap_or_default();
    writer.send(Message::Text(text.into())).await
}

fn classify_connect_error(err: &tungstenite::Error) -> DisconnectClass {
    match err {
        tungstenite::Error::Http(response)
            if response.status() == tungstenite::http::StatusCode::TOO_MANY_REQUESTS =>
        {
            DisconnectClass::RateLimited
        }
        _ => DisconnectClass::Transport,
    }
}

fn close_details(frame: Option<CloseFrame>) -> (Option<u16>, Option<String>) {
    frame.map_or((None, None), |frame| {
        (Some(frame.code.into()), Some(frame.reason.to_string()))
    })
}

fn parse_side(raw: &str) -> Option<Side> {
    match raw {
        "Buy" => Some(Side::Buy),
        "Sell" => Some(Side::Sell),
        _ => None,
    }
}

fn ts_from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parsing() {
        assert_eq!(parse_side("Buy"), Some(Side::Buy));
        assert_eq!(parse_side("Sell"), Some(Side::Sell));
        assert_eq!(parse_side("buy"), None);
    }

    #[test]
    fn topic_list_covers_all_channels() {
        let client_settings = PrimaryFeedSettings::default();
        let symbol = Symbol::normalize("BTC").unwrap();
        let market = symbol.bybit_perp();
        let topics = [
            format!("orderbook.{}.{market}", client_settings.book_depth),
            format!("publicTrade.{market}"),
            format!("tickers.{market}"),
            format!("allLiquidation.{market}"),
        ];
        assert_eq!(topics[0], "orderbook.40.BTCUSDT");
        assert_eq!(topics[3], "allLiquidation.BTCUSDT");
    }

    #[test]
    fn timestamp_conversion() {
        let ts = ts_from_ms(1_672_304_486_868);
        assert_eq!(ts.timestamp_millis(), 1_672_304_486_868);
    }

    #[test]
    fn close_frame_details() {
        let (code, reason) = close_details(None);
        assert!(code.is_none() && reason.is_none());
    }
}
