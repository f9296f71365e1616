//! Feed State Tracking
//!
//! Shared, thread-safe view of each venue connection's lifecycle, exposed
//! through the health endpoint and the Prometheus gauges. Connectors write
//! into this; the health layer only reads.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Connection lifecycle phase of a venue feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No socket, not currently trying.
    Disconnected,
    /// TCP/TLS/WebSocket handshake in progress.
    Connecting,
    /// Connected, sending subscription control frames.
    Subscribing,
    /// Fully subscribed and processing inbound frames.
    Streaming,
    /// Orderly shutdown in progress.
    Closing,
    /// Unrecoverable error; supervisor will tear down and restart.
    Faulted,
}

/// Details of the most recent disconnect.
#[derive(Debug, Clone, Serialize)]
pub struct LastDisconnect {
    /// Venue-reported close code, if any.
    pub close_code: Option<u16>,
    /// Venue-reported close reason, if any.
    pub reason: Option<String>,
    /// When the disconnect was observed.
    pub at: DateTime<Utc>,
}

/// Tracks the state of one upstream feed connection.
#[derive(Debug)]
pub struct FeedState {
    venue: &'static str,
    phase: parking_lot::RwLock<ConnectionPhase>,
    last_connected_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_disconnect: parking_lot::RwLock<Option<LastDisconnect>>,
    reconnect_attempts: AtomicU64,
    messages_received: AtomicU64,
}

impl FeedState {
    /// New state for `venue`, starting disconnected.
    #[must_use]
    pub const fn new(venue: &'static str) -> Self {
        Self {
            venue,
            phase: parking_lot::RwLock::new(ConnectionPhase::Disconnected),
            last_connected_at: parking_lot::RwLock::new(None),
            last_disconnect: parking_lot::RwLock::new(None),
            reconnect_attempts: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    /// Venue label this state tracks.
    #[must_use]
    pub const fn venue(&self) -> &'static str {
        self.venue
    }

    /// Set the connection phase. Entering `Streaming` stamps the connect
    /// time and clears the reconnect counter.
    pub fn set_phase(&self, phase: ConnectionPhase) {
        *self.phase.write() = phase;
        if phase == ConnectionPhase::Streaming {
            *self.last_connected_at.write() = Some(Utc::now());
            self.reconnect_attempts.store(0, Ordering::Relaxed);
        }
    }

    /// Current connection phase.
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.read()
    }

    /// Record a disconnect with the venue-reported close frame, if any.
    pub fn record_disconnect(&self, close_code: Option<u16>, reason: Option<String>) {
        *self.phase.write() = ConnectionPhase::Disconnected;
        *self.last_disconnect.write() = Some(LastDisconnect {
            close_code,
            reason,
            at: Utc::now(),
        });
    }

    /// Increment the reconnect attempt counter.
    pub fn increment_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the inbound frame counter.
    pub fn increment_messages(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the feed is currently streaming.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.phase() == ConnectionPhase::Streaming
    }

    /// Serializable snapshot for the health endpoint.
    #[must_use]
    pub fn snapshot(&self) -> FeedStateSnapshot {
        FeedStateSnapshot {
            venue: self.venue,
            phase: self.phase(),
            last_connected_at: *self.last_connected_at.read(),
            last_disconnect: self.last_disconnect.read().clone(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a [`FeedState`].
#[derive(Debug, Clone, Serialize)]
pub struct FeedStateSnapshot {
    /// Venue label.
    pub venue: &'static str,
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Last time the feed reached streaming.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Most recent disconnect details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<LastDisconnect>,
    /// Attempts since the last streaming session.
    pub reconnect_attempts: u64,
    /// Total inbound frames processed.
    pub messages_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_stamps_connect_time_and_resets_attempts() {
        let state = FeedState::new("bybit");
        state.increment_reconnect_attempts();
        state.increment_reconnect_attempts();

        state.set_phase(ConnectionPhase::Streaming);

        let snap = state.snapshot();
        assert_eq!(snap.phase, ConnectionPhase::Streaming);
        assert!(snap.last_connected_at.is_some());
        assert_eq!(snap.reconnect_attempts, 0);
    }

    #[test]
    fn disconnect_records_close_frame() {
        let state = FeedState::new("bybit");
        state.set_phase(ConnectionPhase::Streaming);
        state.record_disconnect(Some(1006), Some("abnormal closure".into()));

        let snap = state.snapshot();
        assert_eq!(snap.phase, ConnectionPhase::Disconnected);
        let last = snap.last_disconnect.unwrap();
        assert_eq!(last.close_code, Some(1006));
        assert_eq!(last.reason.as_deref(), Some("abnormal closure"));
    }

    #[test]
    fn message_counter_accumulates() {
        let state = FeedState::new("binance");
        for _ in 0..5 {
            state.increment_messages();
        }
        assert_eq!(state.snapshot().messages_received, 5);
    }
}
