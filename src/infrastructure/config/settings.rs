//! Aggregator Configuration Settings
//!
//! Configuration types for the feed aggregator, loaded from `FEEDMUX_*`
//! environment variables. Every knob has a default; only malformed bootstrap
//! symbols make loading fail.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::domain::symbol::{Symbol, SymbolError};
use crate::infrastructure::ws::BackoffConfig;

/// Venue endpoint URLs.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// Primary venue (Bybit) linear-perp public WebSocket.
    pub bybit_ws_url: String,
    /// Primary venue REST base for depth snapshots.
    pub bybit_rest_url: String,
    /// Auxiliary spot venue A (Binance) combined-stream WebSocket.
    pub binance_ws_url: String,
    /// Auxiliary spot venue B (OKX) public WebSocket.
    pub okx_ws_url: String,
    /// Auxiliary open-interest REST endpoint (Binance futures).
    pub binance_oi_url: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            bybit_ws_url: "wss://stream.bybit.com/v5/public/linear".to_string(),
            bybit_rest_url: "https://api.bybit.com".to_string(),
            binance_ws_url: "wss://stream.binance.com:9443/stream".to_string(),
            okx_ws_url: "wss://ws.okx.com:8443/ws/v5/public".to_string(),
            binance_oi_url: "https://fapi.binance.com/fapi/v1/openInterest".to_string(),
        }
    }
}

/// Subscription multiplexer settings.
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    /// Hard cap on concurrently tracked symbols.
    pub max_symbols: usize,
    /// Symbols subscribed at startup as system subscriptions.
    pub bootstrap_symbols: Vec<Symbol>,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            max_symbols: 30,
            bootstrap_symbols: Vec::new(),
        }
    }
}

/// Primary-venue connector settings.
#[derive(Debug, Clone)]
pub struct PrimaryFeedSettings {
    /// Reconnect backoff behavior.
    pub backoff: BackoffConfig,
    /// Symbols per subscribe control frame.
    pub subscribe_batch_size: usize,
    /// Pause between consecutive subscribe frames.
    pub subscribe_batch_pause: Duration,
    /// Poll timeout on the read loop; bounds how long pending
    /// subscription changes wait while the socket is quiet.
    pub poll_timeout: Duration,
    /// Order-book depth requested from the venue (levels per side).
    pub book_depth: usize,
}

impl Default for PrimaryFeedSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig {
                floor: Duration::from_secs(1),
                ceiling: Duration::from_secs(60),
                rate_limit_floor: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.1,
                stable_uptime: Duration::from_secs(30),
            },
            subscribe_batch_size: 10,
            subscribe_batch_pause: Duration::from_millis(250),
            poll_timeout: Duration::from_millis(500),
            book_depth: 40,
        }
    }
}

/// Auxiliary-venue (external feed) settings.
#[derive(Debug, Clone)]
pub struct ExternalFeedSettings {
    /// Reconnect backoff behavior (shorter than primary; supplementary data).
    pub backoff: BackoffConfig,
    /// How often each venue connection diffs desired vs. subscribed symbols.
    pub resync_interval: Duration,
    /// Freshness window for a venue's data to participate in composites.
    pub ttl: Duration,
    /// Cap on symbols tracked externally (subset of the active set).
    pub max_symbols: usize,
    /// Composite CVD weight for Binance.
    pub cvd_weight_binance: Decimal,
    /// Composite CVD weight for OKX.
    pub cvd_weight_okx: Decimal,
    /// Composite OI weight for the primary venue.
    pub oi_weight_primary: Decimal,
    /// Composite OI weight for the external source.
    pub oi_weight_external: Decimal,
    /// Polling cadence for the external open-interest REST source.
    pub oi_poll_interval: Duration,
}

impl Default for ExternalFeedSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig {
                floor: Duration::from_millis(500),
                ceiling: Duration::from_secs(30),
                rate_limit_floor: Duration::from_secs(5),
                multiplier: 2.0,
                jitter_factor: 0.1,
                stable_uptime: Duration::from_secs(15),
            },
            resync_interval: Duration::from_secs(30),
            ttl: Duration::from_secs(30),
            max_symbols: 10,
            cvd_weight_binance: Decimal::new(6, 1),
            cvd_weight_okx: Decimal::new(4, 1),
            oi_weight_primary: Decimal::new(7, 1),
            oi_weight_external: Decimal::new(3, 1),
            oi_poll_interval: Duration::from_secs(15),
        }
    }
}

/// Ingestion queue and worker pool settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Bounded queue capacity; overflow drops with a counter.
    pub capacity: usize,
    /// Number of worker tasks draining the queue.
    pub workers: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            workers: 4,
        }
    }
}

/// Broadcast loop settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Target cadence between broadcast cycles.
    pub interval: Duration,
    /// Capacity of each per-symbol broadcast channel.
    pub channel_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            channel_capacity: 256,
        }
    }
}

/// Synchronous query surface settings.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    /// Cooldown floor after the first rate-limit rejection.
    pub cooldown_floor: Duration,
    /// Cooldown growth factor on repeated rejections.
    pub cooldown_multiplier: f64,
    /// Cooldown ceiling.
    pub cooldown_ceiling: Duration,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            cooldown_floor: Duration::from_secs(5),
            cooldown_multiplier: 1.7,
            cooldown_ceiling: Duration::from_secs(120),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port for the health/metrics HTTP server.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 9201 }
    }
}

/// Complete aggregator configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Venue endpoints.
    pub endpoints: EndpointSettings,
    /// Subscription multiplexer settings.
    pub subscription: SubscriptionSettings,
    /// Primary connector settings.
    pub primary: PrimaryFeedSettings,
    /// External feed settings.
    pub external: ExternalFeedSettings,
    /// Queue and worker pool settings.
    pub queue: QueueSettings,
    /// Broadcast loop settings.
    pub broadcast: BroadcastSettings,
    /// Query surface settings.
    pub query: QuerySettings,
    /// Server ports.
    pub server: ServerSettings,
    /// Multiplier over the side-average size for wall detection.
    pub wall_multiplier: Decimal,
    /// Age beyond which a served snapshot is marked stale.
    pub staleness_ttl: Duration,
}

impl AggregatorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `FEEDMUX_BOOTSTRAP_SYMBOLS` contains a symbol
    /// that fails normalization.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let endpoints = EndpointSettings {
            bybit_ws_url: env_string("FEEDMUX_BYBIT_WS_URL", defaults.endpoints.bybit_ws_url),
            bybit_rest_url: env_string("FEEDMUX_BYBIT_REST_URL", defaults.endpoints.bybit_rest_url),
            binance_ws_url: env_string("FEEDMUX_BINANCE_WS_URL", defaults.endpoints.binance_ws_url),
            okx_ws_url: env_string("FEEDMUX_OKX_WS_URL", defaults.endpoints.okx_ws_url),
            binance_oi_url: env_string("FEEDMUX_BINANCE_OI_URL", defaults.endpoints.binance_oi_url),
        };

        let bootstrap_symbols = match std::env::var("FEEDMUX_BOOTSTRAP_SYMBOLS") {
            Ok(raw) => parse_symbol_list(&raw)?,
            Err(_) => defaults.subscription.bootstrap_symbols,
        };

        let subscription = SubscriptionSettings {
            max_symbols: parse_env_usize("FEEDMUX_MAX_SYMBOLS", defaults.subscription.max_symbols),
            bootstrap_symbols,
        };

        let primary = PrimaryFeedSettings {
            backoff: BackoffConfig {
                floor: parse_env_duration_millis(
                    "FEEDMUX_PRIMARY_RECONNECT_FLOOR_MS",
                    defaults.primary.backoff.floor,
                ),
                ceiling: parse_env_duration_secs(
                    "FEEDMUX_PRIMARY_RECONNECT_CEILING_SECS",
                    defaults.primary.backoff.ceiling,
                ),
                rate_limit_floor: parse_env_duration_secs(
                    "FEEDMUX_PRIMARY_RATE_LIMIT_FLOOR_SECS",
                    defaults.primary.backoff.rate_limit_floor,
                ),
                multiplier: parse_env_f64(
                    "FEEDMUX_PRIMARY_RECONNECT_MULTIPLIER",
                    defaults.primary.backoff.multiplier,
                ),
                jitter_factor: defaults.primary.backoff.jitter_factor,
                stable_uptime: parse_env_duration_secs(
                    "FEEDMUX_PRIMARY_STABLE_UPTIME_SECS",
                    defaults.primary.backoff.stable_uptime,
                ),
            },
            subscribe_batch_size: parse_env_usize(
                "FEEDMUX_SUBSCRIBE_BATCH_SIZE",
                defaults.primary.subscribe_batch_size,
            ),
            subscribe_batch_pause: parse_env_duration_millis(
                "FEEDMUX_SUBSCRIBE_BATCH_PAUSE_MS",
                defaults.primary.subscribe_batch_pause,
            ),
            poll_timeout: parse_env_duration_millis(
                "FEEDMUX_PRIMARY_POLL_TIMEOUT_MS",
                defaults.primary.poll_timeout,
            ),
            book_depth: defaults.primary.book_depth,
        };

        let external = ExternalFeedSettings {
            backoff: BackoffConfig {
                floor: parse_env_duration_millis(
                    "FEEDMUX_EXTERNAL_RECONNECT_FLOOR_MS",
                    defaults.external.backoff.floor,
                ),
                ceiling: parse_env_duration_secs(
                    "FEEDMUX_EXTERNAL_RECONNECT_CEILING_SECS",
                    defaults.external.backoff.ceiling,
                ),
                rate_limit_floor: defaults.external.backoff.rate_limit_floor,
                multiplier: defaults.external.backoff.multiplier,
                jitter_factor: defaults.external.backoff.jitter_factor,
                stable_uptime: parse_env_duration_secs(
                    "FEEDMUX_EXTERNAL_STABLE_UPTIME_SECS",
                    defaults.external.backoff.stable_uptime,
                ),
            },
            resync_interval: parse_env_duration_secs(
                "FEEDMUX_EXTERNAL_RESYNC_INTERVAL_SECS",
                defaults.external.resync_interval,
            ),
            ttl: parse_env_duration_secs("FEEDMUX_EXTERNAL_TTL_SECS", defaults.external.ttl),
            max_symbols: parse_env_usize(
                "FEEDMUX_MAX_EXTERNAL_SYMBOLS",
                defaults.external.max_symbols,
            ),
            cvd_weight_binance: parse_env_decimal(
                "FEEDMUX_CVD_WEIGHT_BINANCE",
                defaults.external.cvd_weight_binance,
            ),
            cvd_weight_okx: parse_env_decimal(
                "FEEDMUX_CVD_WEIGHT_OKX",
                defaults.external.cvd_weight_okx,
            ),
            oi_weight_primary: parse_env_decimal(
                "FEEDMUX_OI_WEIGHT_PRIMARY",
                defaults.external.oi_weight_primary,
            ),
            oi_weight_external: parse_env_decimal(
                "FEEDMUX_OI_WEIGHT_EXTERNAL",
                defaults.external.oi_weight_external,
            ),
            oi_poll_interval: parse_env_duration_secs(
                "FEEDMUX_OI_POLL_INTERVAL_SECS",
                defaults.external.oi_poll_interval,
            ),
        };

        let queue = QueueSettings {
            capacity: parse_env_usize("FEEDMUX_QUEUE_CAPACITY", defaults.queue.capacity),
            workers: parse_env_usize("FEEDMUX_WORKER_COUNT", defaults.queue.workers),
        };

        let broadcast = BroadcastSettings {
            interval: parse_env_duration_millis(
                "FEEDMUX_BROADCAST_INTERVAL_MS",
                defaults.broadcast.interval,
            ),
            channel_capacity: parse_env_usize(
                "FEEDMUX_BROADCAST_CHANNEL_CAPACITY",
                defaults.broadcast.channel_capacity,
            ),
        };

        let query = QuerySettings {
            cooldown_floor: parse_env_duration_secs(
                "FEEDMUX_COOLDOWN_FLOOR_SECS",
                defaults.query.cooldown_floor,
            ),
            cooldown_multiplier: parse_env_f64(
                "FEEDMUX_COOLDOWN_MULTIPLIER",
                defaults.query.cooldown_multiplier,
            ),
            cooldown_ceiling: parse_env_duration_secs(
                "FEEDMUX_COOLDOWN_CEILING_SECS",
                defaults.query.cooldown_ceiling,
            ),
        };

        let server = ServerSettings {
            health_port: parse_env_u16("FEEDMUX_HEALTH_PORT", defaults.server.health_port),
        };

        let wall_multiplier = parse_env_decimal("FEEDMUX_WALL_MULTIPLIER", Decimal::from(3));
        let staleness_ttl =
            parse_env_duration_secs("FEEDMUX_STALENESS_TTL_SECS", defaults.staleness_ttl);

        Ok(Self {
            endpoints,
            subscription,
            primary,
            external,
            queue,
            broadcast,
            query,
            server,
            wall_multiplier,
            staleness_ttl,
        })
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointSettings::default(),
            subscription: SubscriptionSettings::default(),
            primary: PrimaryFeedSettings::default(),
            external: ExternalFeedSettings::default(),
            queue: QueueSettings::default(),
            broadcast: BroadcastSettings::default(),
            query: QuerySettings::default(),
            server: ServerSettings::default(),
            wall_multiplier: Decimal::from(3),
            staleness_ttl: Duration::from_secs(10),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A bootstrap symbol failed normalization.
    #[error("invalid bootstrap symbol {raw:?}: {source}")]
    InvalidBootstrapSymbol {
        /// The raw token as given.
        raw: String,
        /// The normalization failure.
        source: SymbolError,
    },
}

fn parse_symbol_list(raw: &str) -> Result<Vec<Symbol>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Symbol::normalize(s).map_err(|source| ConfigError::InvalidBootstrapSymbol {
                raw: s.to_string(),
                source,
            })
        })
        .collect()
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AggregatorConfig::default();
        assert_eq!(config.broadcast.interval, Duration::from_millis(50));
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.queue.workers, 4);
        assert!(config.primary.backoff.rate_limit_floor > config.primary.backoff.floor);
        assert!(config.external.backoff.floor < config.primary.backoff.floor);
    }

    #[test]
    fn composite_weights_sum_to_one() {
        let config = ExternalFeedSettings::default();
        assert_eq!(config.cvd_weight_binance + config.cvd_weight_okx, Decimal::ONE);
        assert_eq!(config.oi_weight_primary + config.oi_weight_external, Decimal::ONE);
    }

    #[test]
    fn symbol_list_parsing() {
        let symbols = parse_symbol_list("btcusdt, ETHUSDT ,,sol-usdt").unwrap();
        let names: Vec<&str> = symbols.iter().map(Symbol::as_str).collect();
        assert_eq!(names, vec!["BTC", "ETH", "SOL"]);
    }

    #[test]
    fn symbol_list_rejects_garbage() {
        assert!(parse_symbol_list("btc, not a symbol!").is_err());
    }
}
