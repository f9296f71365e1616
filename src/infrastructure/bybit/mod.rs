//! Bybit Adapter
//!
//! Primary-venue integration: the v5 public WebSocket connector, the wire
//! message types, and the REST client used for book hydration and the
//! instrument listing.

pub mod client;
pub mod messages;
pub mod rest;

pub use client::BybitClient;
pub use rest::{BybitRest, Instrument, RestError};
