//! Secured links (connections) between mesh nodes.
//!
//! Connections are undirected: a link between A and B serves both directions
//! and is stored once. Status moves `establishing -> active <-> degraded`, and
//! any live state may drop to `failed`, which is terminal.

use qmesh_crypto::{ChannelMetrics, SessionId};
use serde::{Deserialize, Serialize};

/// How the link is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    Direct,
    Relayed,
    Fallback,
}

/// Link lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Establishing,
    Active,
    Degraded,
    Failed,
}

impl ConnectionStatus {
    /// Active or degraded.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionStatus::Active | ConnectionStatus::Degraded)
    }

    /// Whether moving to `next` is a legal transition. Setting the current
    /// status again is always allowed except out of `failed`.
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (Failed, Failed) => true,
            (Failed, _) => false,
            (Establishing, Active | Failed | Establishing) => true,
            (Establishing, Degraded) => false,
            (Active | Degraded, Establishing) => false,
            (Active | Degraded, _) => true,
        }
    }
}

/// Measured quality of the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelQuality {
    pub error_rate: f64,
    /// Key generation rate in bits per second
    pub key_rate: f64,
    pub distance_km: f64,
    pub fidelity: f64,
}

impl From<ChannelMetrics> for ChannelQuality {
    fn from(metrics: ChannelMetrics) -> Self {
        Self {
            error_rate: metrics.error_rate,
            key_rate: metrics.key_rate,
            distance_km: metrics.distance_km,
            fidelity: metrics.fidelity,
        }
    }
}

/// Reference to the link's session key. The key itself stays in the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityBinding {
    pub session_id: SessionId,
    pub key_fingerprint: String,
    pub key_bits: usize,
    pub rotation_interval_ms: u64,
    /// Last rotation (Unix epoch milliseconds)
    pub last_rotation: u64,
}

impl SecurityBinding {
    /// Whether the key is due for rotation at `now`.
    pub fn rotation_due(&self, now: u64) -> bool {
        self.rotation_interval_ms > 0
            && now.saturating_sub(self.last_rotation) >= self.rotation_interval_ms
    }
}

/// Quality-of-service statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QosStats {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub bandwidth_mbps: f64,
    /// Delivery reliability, 0.0 to 1.0
    pub reliability: f64,
}

impl QosStats {
    /// Starting estimate for a freshly established link: 5 us/km of fibre plus
    /// 1 ms of processing, reliability from the channel error rate.
    pub fn estimate(quality: &ChannelQuality) -> Self {
        let latency_ms = 1.0 + quality.distance_km * 0.005;
        Self {
            latency_ms,
            jitter_ms: latency_ms * 0.1,
            bandwidth_mbps: 1000.0,
            reliability: (1.0 - quality.error_rate).clamp(0.0, 1.0),
        }
    }
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// An edge of the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source: String,
    pub target: String,
    pub connection_type: ConnectionType,
    pub status: ConnectionStatus,
    pub quality: ChannelQuality,
    pub security: SecurityBinding,
    pub qos: QosStats,
    pub traffic: TrafficCounters,
    /// Creation time (Unix epoch milliseconds)
    pub established_at: u64,
    /// Last status or measurement change
    pub updated_at: u64,
}

impl Connection {
    /// A new active connection with estimated QoS.
    pub fn active(
        source: impl Into<String>,
        target: impl Into<String>,
        connection_type: ConnectionType,
        quality: ChannelQuality,
        security: SecurityBinding,
        now: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            connection_type,
            status: ConnectionStatus::Active,
            qos: QosStats::estimate(&quality),
            quality,
            security,
            traffic: TrafficCounters::default(),
            established_at: now,
            updated_at: now,
        }
    }

    /// Whether the connection links `a` and `b`, in either direction.
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.source == a && self.target == b) || (self.source == b && self.target == a)
    }

    /// Whether `node_id` is one of the endpoints.
    pub fn involves(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }

    /// The endpoint opposite `node_id`.
    pub fn other_end(&self, node_id: &str) -> Option<&str> {
        if self.source == node_id {
            Some(&self.target)
        } else if self.target == node_id {
            Some(&self.source)
        } else {
            None
        }
    }
}
