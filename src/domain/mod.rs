//! Domain Layer
//!
//! Venue-independent business types and rules: symbol normalization, the
//! per-symbol market state model, and refcounted subscription tracking.
//! Nothing in this layer touches a socket, a clock source other than values
//! passed in, or any other infrastructure concern.

pub mod market;
pub mod subscription;
pub mod symbol;
