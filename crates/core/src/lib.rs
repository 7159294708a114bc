//! Core functionality for the qmesh orchestration system.
//!
//! This crate provides the configuration, logging, event and time
//! utilities shared by every other qmesh crate.

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod time;

pub use config::{
    Config, ConnectionConfig, DiscoveryConfig, HealthConfig, NodeConfig, OrchestrationConfig,
    RoutingConfig,
};
pub use error::{CoreError, CoreResult};
pub use event::{Event, EventBuilder, EventKind, EventLog, EventMetadata, EventSeverity};
pub use time::{current_timestamp_ms, elapsed_ms};
