//! Configuration Module
//!
//! Configuration loading and dependency injection for the aggregator.

mod settings;

pub use settings::{
    AggregatorConfig, BroadcastSettings, ConfigError, EndpointSettings, ExternalFeedSettings,
    PrimaryFeedSettings, QuerySettings, QueueSettings, ServerSettings, SubscriptionSettings,
};
