//! Event schema for topology and control-loop events in the mesh.
//!
//! Every state change that an operator may need to reconstruct later is
//! recorded as an [`Event`]: nodes joining and leaving, links being established
//! or failing, routes changing, channel errors and the corrective actions taken
//! by the control loops. Events are kept in an append-only [`EventLog`] with a
//! fixed capacity; the oldest entries are evicted first.

use crate::time::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Severity level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSeverity {
    /// Informational event
    Info,
    /// Warning condition
    Warning,
    /// Error condition
    Error,
    /// Critical condition requiring failover
    Critical,
}

/// Kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A verified node was added to the topology
    NodeJoined,
    /// A node went offline or was removed
    NodeLeft,
    /// A secured link became active
    ConnectionEstablished,
    /// A link could not be established or was marked failed
    ConnectionFailed,
    /// A link crossed the error-rate threshold
    ConnectionDegraded,
    /// A degraded link recovered
    ConnectionRecovered,
    /// Routes were recomputed and differ from the previous table
    RouteChanged,
    /// Handshake failure or error-rate breach on a secure channel
    ChannelError,
    /// A link's session key was replaced
    KeyRotated,
    /// Auto-scaling executed an action
    ScalingAction,
    /// Failover moved a primary's duties to a backup
    Failover,
    /// A failover binding was released
    Failback,
    /// Self-healing attempted an action
    Healing,
    /// A periodic cycle failed
    CycleFailed,
    /// An orchestrator sub-resource changed state
    ComponentState,
}

impl EventKind {
    /// Stable string form, as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NodeJoined => "node-joined",
            EventKind::NodeLeft => "node-left",
            EventKind::ConnectionEstablished => "connection-established",
            EventKind::ConnectionFailed => "connection-failed",
            EventKind::ConnectionDegraded => "connection-degraded",
            EventKind::ConnectionRecovered => "connection-recovered",
            EventKind::RouteChanged => "route-changed",
            EventKind::ChannelError => "channel-error",
            EventKind::KeyRotated => "key-rotated",
            EventKind::ScalingAction => "scaling-action",
            EventKind::Failover => "failover",
            EventKind::Failback => "failback",
            EventKind::Healing => "healing",
            EventKind::CycleFailed => "cycle-failed",
            EventKind::ComponentState => "component-state",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core event structure for all mesh events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub event_id: String,
    /// Timestamp (Unix epoch milliseconds)
    pub timestamp: u64,
    /// Event kind
    pub kind: EventKind,
    /// Event severity
    pub severity: EventSeverity,
    /// IDs of the nodes, connections or resources this event concerns
    pub entities: Vec<String>,
    /// Source component
    pub source: String,
    /// Human-readable message
    pub message: String,
    /// Structured payload
    pub payload: EventMetadata,
}

impl Event {
    /// Whether the event concerns the given entity.
    pub fn concerns(&self, entity_id: &str) -> bool {
        self.entities.iter().any(|e| e == entity_id)
    }
}

/// Structured metadata for events.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventMetadata {
    /// Key-value pairs for additional context
    #[serde(flatten)]
    pub data: std::collections::HashMap<String, serde_json::Value>,
}

impl EventMetadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key-value pair.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}

/// Builder for creating events.
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    /// Create a new event builder.
    pub fn new(kind: EventKind, source: impl Into<String>) -> Self {
        Self {
            event: Event {
                event_id: uuid::Uuid::new_v4().to_string(),
                timestamp: current_timestamp_ms(),
                kind,
                severity: EventSeverity::Info,
                entities: Vec::new(),
                source: source.into(),
                message: String::new(),
                payload: EventMetadata::new(),
            },
        }
    }

    /// Set the severity.
    pub fn severity(mut self, severity: EventSeverity) -> Self {
        self.event.severity = severity;
        self
    }

    /// Add an affected entity.
    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.event.entities.push(entity_id.into());
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: u64) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    /// Set the message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.event.message = message.into();
        self
    }

    /// Add payload data.
    pub fn payload(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.event.payload.insert(key, value);
        self
    }

    /// Build the event.
    pub fn build(self) -> Event {
        self.event
    }
}

/// Bounded, append-only event log.
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<Event>,
    capacity: usize,
    total_appended: u64,
}

impl EventLog {
    /// Default number of retained events.
    pub const DEFAULT_CAPACITY: usize = 1000;

    /// Create a log retaining at most `capacity` events (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            total_appended: 0,
        }
    }

    /// Append an event, evicting the oldest one when full.
    pub fn append(&mut self, event: Event) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
        self.total_appended += 1;
    }

    /// The most recent `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Retained events of one kind, oldest first.
    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.entries.iter().filter(|e| e.kind == kind).cloned().collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of retained events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events appended over the lifetime of the log, including evicted ones.
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
