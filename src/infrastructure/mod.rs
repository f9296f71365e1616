//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Primary venue (Bybit) WebSocket and REST adapters.
pub mod bybit;

/// Per-symbol market state cache.
pub mod cache;

/// Request coalescing and rate-limit cooldown.
pub mod coalesce;

/// Configuration loading and settings types.
pub mod config;

/// Auxiliary venue feeds and the external feed composer.
pub mod external;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Backpressure queue, ingest routing, and the worker pool.
pub mod queue;

/// Synchronous query surface.
pub mod query;

/// Tick fan-out hub and broadcast loop.
pub mod broadcast;

/// Tracing setup.
pub mod telemetry;

/// Shared WebSocket connection machinery (backoff, feed state).
pub mod ws;
