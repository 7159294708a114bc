//! Mesh node model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique identifier for a node in the mesh
pub type NodeId = String;

/// Trust level given to a node that completed the discovery handshake.
pub const HANDSHAKE_TRUST_LEVEL: f64 = 0.9;

/// Trust level of the local node.
pub const LOCAL_TRUST_LEVEL: f64 = 1.0;

/// What a node can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Maximum number of concurrent secure channels
    pub max_secure_channels: u32,
    /// Supported key algorithms
    pub algorithms: Vec<String>,
    /// Hardware crypto acceleration available
    pub hardware_acceleration: bool,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            max_secure_channels: 16,
            algorithms: vec!["ed25519".to_string(), "x25519".to_string()],
            hardware_acceleration: false,
        }
    }
}

impl From<&qmesh_core::NodeConfig> for NodeCapabilities {
    fn from(config: &qmesh_core::NodeConfig) -> Self {
        Self {
            max_secure_channels: config.max_secure_channels,
            algorithms: config.algorithms.clone(),
            hardware_acceleration: config.hardware_acceleration,
        }
    }
}

/// Mutable liveness and quality status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub online: bool,
    pub secure_channel_ready: bool,
    /// Last seen timestamp (Unix epoch milliseconds)
    pub last_seen: u64,
    /// Utilisation, 0.0 to 1.0
    pub load: f64,
    /// Mean error rate over the node's live connections
    pub error_rate: f64,
}

/// Trust metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTrust {
    /// Public key, hex encoded
    pub public_key: String,
    /// Trust level (0.0 to 1.0)
    pub trust_level: f64,
    /// Identity was verified (signed beacon or local bootstrap)
    pub attestation_valid: bool,
}

/// A node in the mesh topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Network address (IP:port)
    pub address: String,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    pub trust: NodeTrust,
    /// IDs of incident connections
    pub connections: BTreeSet<String>,
    /// Whether this is the node running the orchestrator
    pub is_local: bool,
}

impl Node {
    /// A node that has not completed a handshake yet.
    pub fn new(
        id: impl Into<NodeId>,
        address: impl Into<String>,
        capabilities: NodeCapabilities,
        now: u64,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            capabilities,
            status: NodeStatus {
                online: true,
                secure_channel_ready: false,
                last_seen: now,
                load: 0.0,
                error_rate: 0.0,
            },
            trust: NodeTrust {
                public_key: String::new(),
                trust_level: 0.0,
                attestation_valid: false,
            },
            connections: BTreeSet::new(),
            is_local: false,
        }
    }

    /// The local node, fully trusted.
    pub fn local(
        id: impl Into<NodeId>,
        address: impl Into<String>,
        capabilities: NodeCapabilities,
        public_key: &[u8],
        now: u64,
    ) -> Self {
        let mut node = Self::new(id, address, capabilities, now);
        node.is_local = true;
        node.status.secure_channel_ready = true;
        node.trust = NodeTrust {
            public_key: hex::encode(public_key),
            trust_level: LOCAL_TRUST_LEVEL,
            attestation_valid: true,
        };
        node
    }

    /// Mark the node as verified by a completed handshake.
    pub fn verified(mut self, public_key_hex: impl Into<String>) -> Self {
        self.status.secure_channel_ready = true;
        self.trust = NodeTrust {
            public_key: public_key_hex.into(),
            trust_level: HANDSHAKE_TRUST_LEVEL,
            attestation_valid: true,
        };
        self
    }

    /// Online and able to carry secure channels.
    pub fn is_healthy(&self) -> bool {
        self.status.online && self.status.secure_channel_ready
    }

    /// Number of incident connections.
    pub fn degree(&self) -> usize {
        self.connections.len()
    }
}
