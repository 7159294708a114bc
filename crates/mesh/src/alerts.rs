//! Alerts from the analytics side.
//!
//! The orchestrator subscribes to an [`AlertSource`] and reacts to every
//! alert it receives; it never polls.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// What the alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertCategory {
    Performance,
    Availability,
    ChannelQuality,
    Security,
    Capacity,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// An alert raised against one or more resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    /// Node or resource IDs
    pub affected: Vec<String>,
    #[serde(default)]
    pub message: String,
    /// Observed metric values, merged over the topology metrics for scaling
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// Raise time (Unix epoch milliseconds)
    pub timestamp: u64,
}

impl Alert {
    pub fn new(category: AlertCategory, severity: AlertSeverity, affected: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            affected,
            message: String::new(),
            metrics: HashMap::new(),
            timestamp: qmesh_core::current_timestamp_ms(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Broadcast fan-out of alerts.
#[derive(Debug, Clone)]
pub struct AlertSource {
    sender: broadcast::Sender<Alert>,
}

impl AlertSource {
    /// Create a source buffering up to `capacity` undelivered alerts per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an alert. Returns the number of subscribers that will see it.
    pub fn publish(&self, alert: Alert) -> usize {
        self.sender.send(alert).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }
}

impl Default for AlertSource {
    fn default() -> Self {
        Self::new(256)
    }
}
