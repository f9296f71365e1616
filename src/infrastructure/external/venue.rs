//! Auxiliary Venue Feeds
//!
//! The two supplementary spot connections (Binance aggregate trades, OKX
//! trades). Each runs its own reconnect state machine with shorter backoff
//! than the primary feed, and a periodic resync tick that diffs the desired
//! symbol set against what the session has subscribed. Symbols a venue
//! rejects land on that venue's blocklist and stay out of future resyncs
//! for that venue only.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ExternalComposer;
use crate::domain::market::Side;
use crate::domain::subscription::SubscriptionManager;
use crate::domain::symbol::Symbol;
use crate::infrastructure::config::ExternalFeedSettings;
use crate::infrastructure::metrics::{self, Venue};
use crate::infrastructure::ws::{
    BackoffPolicy, ConnectionPhase, DisconnectClass, FeedState,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = futures_util::stream::SplitSink<WsStream, Message>;

/// Poll timeout for the auxiliary read loops.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Keepalive cadence (OKX expects activity at least every 30s).
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Identifies one auxiliary venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuxVenueId {
    /// Spot venue A.
    Binance,
    /// Spot venue B.
    Okx,
}

impl AuxVenueId {
    /// Lowercase label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Okx => "okx",
        }
    }
}

/// One normalized trade from an auxiliary venue.
#[derive(Debug, Clone)]
pub struct AuxTrade {
    /// Normalized symbol.
    pub symbol: Symbol,
    /// Venue trade id, strictly increasing per market.
    pub trade_id: u64,
    /// Taker side.
    pub side: Side,
    /// Trade price.
    pub price: Decimal,
    /// Trade size.
    pub size: Decimal,
    /// Venue timestamp.
    pub ts: DateTime<Utc>,
}

/// A classified inbound frame from an auxiliary venue.
#[derive(Debug)]
pub enum AuxInbound {
    /// Trade prints.
    Trades(Vec<AuxTrade>),
    /// Control acknowledgement.
    Ack,
    /// The venue rejected a subscription.
    Rejected {
        /// The offending symbol, when it can be recovered from the error.
        symbol: Option<Symbol>,
        /// Venue-reported reason.
        reason: String,
    },
    /// Keepalive reply.
    Pong,
    /// Anything undecodable or unrecognized.
    Unknown,
}

/// Venue-specific wire behavior behind one interface.
pub trait VenueAdapter: Send + Sync + 'static {
    /// Which venue this adapter speaks for.
    fn id(&self) -> AuxVenueId;
    /// Metrics label.
    fn metric_venue(&self) -> Venue;
    /// Control frame subscribing to `symbols`.
    fn subscribe_frame(&self, symbols: &[Symbol]) -> String;
    /// Control frame unsubscribing from `symbols`.
    fn unsubscribe_frame(&self, symbols: &[Symbol]) -> String;
    /// Application-level keepalive, if the venue wants one.
    fn ping_frame(&self) -> Option<String>;
    /// Classify one inbound text frame.
    fn parse(&self, text: &str) -> AuxInbound;
}

// =============================================================================
// Binance Adapter
// =============================================================================

/// Binance combined-stream adapter (aggregate trades).
#[derive(Debug, Default)]
pub struct BinanceAdapter {
    request_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct BinanceCombined {
    stream: Option<String>,
    data: Option<BinanceAggTrade>,
    result: Option<serde_json::Value>,
    id: Option<u64>,
    error: Option<BinanceError>,
}

#[derive(Debug, Deserialize)]
struct BinanceError {
    msg: String,
}

#[derive(Debug, Deserialize)]
struct BinanceAggTrade {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "s")]
    market: String,
    #[serde(rename = "a")]
    agg_id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "T")]
    ts_ms: i64,
    /// Buyer is maker: the taker sold.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

impl BinanceAdapter {
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl VenueAdapter for BinanceAdapter {
    fn id(&self) -> AuxVenueId {
        AuxVenueId::Binance
    }

    fn metric_venue(&self) -> Venue {
        Venue::Binance
    }

    fn subscribe_frame(&self, symbols: &[Symbol]) -> String {
        let params: Vec<String> = symbols.iter().map(Symbol::binance_stream).collect();
        json!({"method": "SUBSCRIBE", "params": params, "id": self.next_id()}).to_string()
    }

    fn unsubscribe_frame(&self, symbols: &[Symbol]) -> String {
        let params: Vec<String> = symbols.iter().map(Symbol::binance_stream).collect();
        json!({"method": "UNSUBSCRIBE", "params": params, "id": self.next_id()}).to_string()
    }

    fn ping_frame(&self) -> Option<String> {
        // Binance pings from the server side; answering those is enough.
        None
    }

    fn parse(&self, text: &str) -> AuxInbound {
        let Ok(frame) = serde_json::from_str::<BinanceCombined>(text) else {
            return AuxInbound::Unknown;
        };

        if let Some(error) = frame.error {
            return AuxInbound::Rejected {
                symbol: None,
                reason: error.msg,
            };
        }
        if frame.id.is_some() && frame.result.is_some() {
            return AuxInbound::Ack;
        }

        let (Some(_stream), Some(data)) = (frame.stream, frame.data) else {
            return AuxInbound::Unknown;
        };
        if data.event != "aggTrade" {
            return AuxInbound::Unknown;
        }
        let Some(symbol) = Symbol::from_bybit_market(&data.market) else {
            return AuxInbound::Unknown;
        };

        let side = if data.buyer_is_maker { Side::Sell } else { Side::Buy };
        AuxInbound::Trades(vec![AuxTrade {
            symbol,
            trade_id: data.agg_id,
            side,
            price: data.price,
            size: data.quantity,
            ts: ts_from_ms(data.ts_ms),
        }])
    }
}

// =============================================================================
// OKX Adapter
// =============================================================================

/// OKX public-channel adapter (spot trades).
#[derive(Debug, Default)]
pub struct OkxAdapter;

#[derive(Debug, Deserialize)]
struct OkxFrame {
    event: Option<String>,
    msg: Option<String>,
    arg: Option<OkxArg>,
    data: Option<Vec<OkxTrade>>,
}

#[derive(Debug, Deserialize)]
struct OkxArg {
    #[serde(rename = "instId")]
    inst_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OkxTrade {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "tradeId")]
    trade_id: String,
    #[serde(rename = "px")]
    price: Decimal,
    #[serde(rename = "sz")]
    size: Decimal,
    side: String,
    ts: String,
}

impl VenueAdapter for OkxAdapter {
    fn id(&self) -> AuxVenueId {
        AuxVenueId::Okx
    }

    fn metric_venue(&self) -> Venue {
        Venue::Okx
    }

    fn subscribe_frame(&self, symbols: &[Symbol]) -> String {
        let args: Vec<serde_json::Value> = symbols
            .iter()
            .map(|s| json!({"channel": "trades", "instId": s.okx_inst()}))
            .collect();
        json!({"op": "subscribe", "args": args}).to_string()
    }

    fn unsubscribe_frame(&self, symbols: &[Symbol]) -> String {
        let args: Vec<serde_json::Value> = symbols
            .iter()
            .map(|s| json!({"channel": "trades", "instId": s.okx_inst()}))
            .collect();
        json!({"op": "unsubscribe", "args": args}).to_string()
    }

    fn ping_frame(&self) -> Option<String> {
        Some("ping".to_string())
    }

    fn parse(&self, text: &str) -> AuxInbound {
        if text == "pong" {
            return AuxInbound::Pong;
        }
        let Ok(frame) = serde_json::from_str::<OkxFrame>(text) else {
            return AuxInbound::Unknown;
        };

        match frame.event.as_deref() {
            Some("subscribe" | "unsubscribe") => return AuxInbound::Ack,
            Some("error") => {
                let reason = frame.msg.unwrap_or_else(|| "unknown error".to_string());
                let symbol = frame
                    .arg
                    .and_then(|arg| arg.inst_id)
                    .map_or_else(|| inst_id_from_msg(&reason), Some)
                    .and_then(|inst| Symbol::normalize(&inst).ok());
                return AuxInbound::Rejected { symbol, reason };
            }
            _ => {}
        }

        let Some(data) = frame.data else {
            return AuxInbound::Unknown;
        };
        let trades: Vec<AuxTrade> = data
            .into_iter()
            .filter_map(|trade| {
                let symbol = Symbol::normalize(&trade.inst_id).ok()?;
                let side = match trade.side.as_str() {
                    "buy" => Side::Buy,
                    "sell" => Side::Sell,
                    _ => return None,
                };
                Some(AuxTrade {
                    symbol,
                    trade_id: trade.trade_id.parse().ok()?,
                    side,
                    price: trade.price,
                    size: trade.size,
                    ts: ts_from_ms(trade.ts.parse().ok()?),
                })
            })
            .collect();

        if trades.is_empty() {
            AuxInbound::Unknown
        } else {
            AuxInbound::Trades(trades)
        }
    }
}

/// OKX error messages embed the instrument id, e.g.
/// `channel:trades,instId:BTC-FAKE doesn't exist`.
fn inst_id_from_msg(msg: &str) -> Option<String> {
    let start = msg.find("instId:")? + "instId:".len();
    let rest = &msg[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(rest.len());
    let inst = &rest[..end];
    if inst.is_empty() { None } else { Some(inst.to_string()) }
}

fn ts_from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

// =============================================================================
// Venue Feed Task
// =============================================================================

enum SessionEnd {
    Cancelled,
    Disconnected,
}

/// One auxiliary venue connection.
///
/// Owns its blocklist so rejected symbols survive reconnects; the
/// per-session subscribed set does not.
pub struct VenueFeed {
    adapter: Box<dyn VenueAdapter>,
    ws_url: String,
    settings: ExternalFeedSettings,
    manager: Arc<SubscriptionManager>,
    composer: Arc<ExternalComposer>,
    feed_state: Arc<FeedState>,
    blocklist: parking_lot::Mutex<HashSet<Symbol>>,
    cancel: CancellationToken,
}

impl VenueFeed {
    /// Construct a feed; call [`run`](Self::run) to drive it.
    #[must_use]
    pub fn new(
        adapter: Box<dyn VenueAdapter>,
        ws_url: String,
        settings: ExternalFeedSettings,
        manager: Arc<SubscriptionManager>,
        composer: Arc<ExternalComposer>,
        feed_state: Arc<FeedState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            ws_url,
            settings,
            manager,
            composer,
            feed_state,
            blocklist: parking_lot::Mutex::new(HashSet::new()),
            cancel,
        }
    }

    /// Symbols currently blocklisted for this venue.
    #[must_use]
    pub fn blocklisted(&self) -> Vec<Symbol> {
        let mut list: Vec<Symbol> = self.blocklist.lock().iter().cloned().collect();
        list.sort();
        list
    }

    /// Drive connect/reconnect until cancelled.
    pub async fn run(self) {
        let venue = self.adapter.id().as_str();
        let mut backoff = BackoffPolicy::new(self.settings.backoff.clone());

        while !self.cancel.is_cancelled() {
            self.feed_state.set_phase(ConnectionPhase::Connecting);
            debug!(venue, url = %self.ws_url, "connecting auxiliary feed");

            let end = match connect_async(self.ws_url.as_str()).await {
                Ok((stream, _response)) => self.drive_session(stream, &mut backoff).await,
                Err(err) => {
                    warn!(venue, error = %err, "auxiliary handshake failed");
                    self.feed_state.record_disconnect(None, Some(err.to_string()));
                    SessionEnd::Disconnected
                }
            };

            if matches!(end, SessionEnd::Cancelled) {
                break;
            }

            let delay = backoff.on_disconnect(DisconnectClass::Transport);
            metrics::record_reconnect(self.adapter.metric_venue());
            self.feed_state.increment_reconnect_attempts();
            debug!(venue, ?delay, "auxiliary reconnect scheduled");

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.feed_state.set_phase(ConnectionPhase::Disconnected);
        info!(venue, "auxiliary feed stopped");
    }

    async fn drive_session(&self, stream: WsStream, backoff: &mut BackoffPolicy) -> SessionEnd {
        let venue = self.adapter.id().as_str();
        let (mut writer, mut reader) = stream.split();
        self.feed_state.set_phase(ConnectionPhase::Subscribing);

        let mut subscribed: HashSet<Symbol> = HashSet::new();
        let mut streaming = false;
        let mut last_ping = Instant::now();
        let mut resync = tokio::time::interval(self.settings.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        resync.reset(); // the initial resync below covers the first tick

        if self.resync(&mut writer, &mut subscribed).await.is_err() {
            self.feed_state.record_disconnect(None, Some("subscribe write failed".to_string()));
            return SessionEnd::Disconnected;
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                _ = resync.tick() => {
                    if self.resync(&mut writer, &mut subscribed).await.is_err() {
                        self.feed_state.record_disconnect(None, Some("resync write failed".to_string()));
                        return SessionEnd::Disconnected;
                    }
                }
                frame = tokio::time::timeout(POLL_TIMEOUT, reader.next()) => {
                    match frame {
                        Err(_elapsed) => {
                            if last_ping.elapsed() >= PING_INTERVAL {
                                if let Some(ping) = self.adapter.ping_frame() {
                                    if writer.send(Message::Text(ping.into())).await.is_err() {
                                        self.feed_state.record_disconnect(None, Some("ping write failed".to_string()));
                                        return SessionEnd::Disconnected;
                                    }
                                }
                                last_ping = Instant::now();
                            }
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            self.feed_state.increment_messages();
                            self.handle_frame(text.as_str(), &mut streaming, backoff);
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            if writer.send(Message::Pong(payload)).await.is_err() {
                                self.feed_state.record_disconnect(None, Some("pong write failed".to_string()));
                                return SessionEnd::Disconnected;
                            }
                        }
                        Ok(Some(Ok(Message::Close(frame)))) => {
                            let (code, reason) = frame
                                .map_or((None, None), |f| (Some(u16::from(f.code)), Some(f.reason.to_string())));
                            debug!(venue, ?code, "auxiliary venue closed connection");
                            self.feed_state.record_disconnect(code, reason);
                            return SessionEnd::Disconnected;
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(err))) => {
                            warn!(venue, error = %err, "auxiliary read error");
                            self.feed_state.record_disconnect(None, Some(err.to_string()));
                            return SessionEnd::Disconnected;
                        }
                        Ok(None) => {
                            self.feed_state.record_disconnect(None, Some("stream ended".to_string()));
                            return SessionEnd::Disconnected;
                        }
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str, streaming: &mut bool, backoff: &mut BackoffPolicy) {
        match self.adapter.parse(text) {
            AuxInbound::Trades(trades) => {
                if !*streaming {
                    *streaming = true;
                    backoff.on_streaming();
                    self.feed_state.set_phase(ConnectionPhase::Streaming);
                }
                for trade in trades {
                    metrics::record_message_received(self.adapter.metric_venue(), "trade");
                    self.composer.record_trade(self.adapter.id(), &trade);
                }
            }
            AuxInbound::Ack => {
                if !*streaming {
                    *streaming = true;
                    backoff.on_streaming();
                    self.feed_state.set_phase(ConnectionPhase::Streaming);
                }
            }
            AuxInbound::Rejected { symbol, reason } => {
                if let Some(symbol) = symbol {
                    warn!(
                        venue = self.adapter.id().as_str(),
                        symbol = %symbol,
                        reason,
                        "symbol rejected, blocklisting for this venue"
                    );
                    self.blocklist.lock().insert(symbol);
                } else {
                    warn!(venue = self.adapter.id().as_str(), reason, "subscription rejected");
                }
            }
            AuxInbound::Pong => {}
            AuxInbound::Unknown => {
                debug!(venue = self.adapter.id().as_str(), "dropping unrecognized frame");
            }
        }
    }

    /// Diff desired (active set ∩ external cap, minus the blocklist) against
    /// subscribed and issue the deltas.
    async fn resync(
        &self,
        writer: &mut WsWriter,
        subscribed: &mut HashSet<Symbol>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let desired: HashSet<Symbol> = {
            let blocklist = self.blocklist.lock();
            self.manager
                .active_symbols()
                .into_iter()
                .filter(|s| !blocklist.contains(s))
                .take(self.settings.max_symbols)
                .collect()
        };

        let to_remove: Vec<Symbol> = subscribed.difference(&desired).cloned().collect();
        if !to_remove.is_empty() {
            let frame = self.adapter.unsubscribe_frame(&to_remove);
            writer.send(Message::Text(frame.into())).await?;
            for symbol in &to_remove {
                subscribed.remove(symbol);
                self.composer.evict_venue(self.adapter.id(), symbol);
            }
        }

        let to_add: Vec<Symbol> = desired.difference(subscribed).cloned().collect();
        if !to_add.is_empty() {
            let frame = self.adapter.subscribe_frame(&to_add);
            writer.send(Message::Text(frame.into())).await?;
            subscribed.extend(to_add);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        Symbol::normalize(s).unwrap()
    }

    #[test]
    fn binance_subscribe_frame_uses_stream_names() {
        let adapter = BinanceAdapter::default();
        let frame = adapter.subscribe_frame(&[sym("BTC"), sym("ETH")]);
        assert!(frame.contains(r#""method":"SUBSCRIBE""#));
        assert!(frame.contains("btcusdt@aggTrade"));
        assert!(frame.contains("ethusdt@aggTrade"));
    }

    #[test]
    fn binance_agg_trade_parses_with_taker_side() {
        let adapter = BinanceAdapter::default();
        let text = r#"{
            "stream": "btcusdt@aggTrade",
            "data": {
                "e": "aggTrade", "E": 1672515782136, "s": "BTCUSDT",
                "a": 5933014, "p": "16569.01", "q": "0.014",
                "f": 100, "l": 105, "T": 1672515782136, "m": true, "M": true
            }
        }"#;

        match adapter.parse(text) {
            AuxInbound::Trades(trades) => {
                assert_eq!(trades.len(), 1);
                assert_eq!(trades[0].symbol, sym("BTC"));
                assert_eq!(trades[0].trade_id, 5_933_014);
                // Buyer was maker, so the taker sold.
                assert_eq!(trades[0].side, Side::Sell);
            }
            other => panic!("expected trades, got {other:?}"),
        }
    }

    #[test]
    fn binance_control_ack_parses() {
        let adapter = BinanceAdapter::default();
        assert!(matches!(adapter.parse(r#"{"result":null,"id":1}"#), AuxInbound::Ack));
    }

    #[test]
    fn okx_trade_frame_parses() {
        let adapter = OkxAdapter;
        let text = r#"{
            "arg": {"channel": "trades", "instId": "BTC-USDT"},
            "data": [{
                "instId": "BTC-USDT", "tradeId": "130639474",
                "px": "42219.9", "sz": "0.12060306",
                "side": "buy", "ts": "1630048897897"
            }]
        }"#;

        match adapter.parse(text) {
            AuxInbound::Trades(trades) => {
                assert_eq!(trades[0].symbol, sym("BTC"));
                assert_eq!(trades[0].trade_id, 130_639_474);
                assert_eq!(trades[0].side, Side::Buy);
            }
            other => panic!("expected trades, got {other:?}"),
        }
    }

    #[test]
    fn okx_error_recovers_rejected_symbol() {
        let adapter = OkxAdapter;
        let text = r#"{
            "event": "error",
            "code": "60018",
            "msg": "channel:trades,instId:FAKE-USDT doesn't exist"
        }"#;

        match adapter.parse(text) {
            AuxInbound::Rejected { symbol, .. } => {
                assert_eq!(symbol, Some(sym("FAKE")));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn okx_pong_text_parses() {
        assert!(matches!(OkxAdapter.parse("pong"), AuxInbound::Pong));
    }

    #[test]
    fn malformed_frames_are_unknown() {
        assert!(matches!(BinanceAdapter::default().parse("junk"), AuxInbound::Unknown));
        assert!(matches!(OkxAdapter.parse("{}"), AuxInbound::Unknown));
    }

    #[test]
    fn inst_id_extraction_from_error_message() {
        assert_eq!(
            inst_id_from_msg("channel:trades,instId:BTC-FAKE doesn't exist"),
            Some("BTC-FAKE".to_string())
        );
        assert_eq!(inst_id_from_msg("no instrument here"), None);
    }
}
