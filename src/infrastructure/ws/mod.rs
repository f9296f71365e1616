//! WebSocket Connection Support
//!
//! Venue-agnostic pieces shared by every feed connector: the reconnect
//! backoff policy and the observable per-feed connection state.

pub mod feed_state;
pub mod reconnect;

pub use feed_state::{ConnectionPhase, FeedState, FeedStateSnapshot};
pub use reconnect::{BackoffConfig, BackoffPolicy, DisconnectClass};
