//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the port interfaces that define how the domain
//! interacts with external systems. The orchestration itself lives in the
//! crate-level [`crate::app`] module.

/// Port interfaces for external systems (event ingestion, REST snapshots).
pub mod ports;
