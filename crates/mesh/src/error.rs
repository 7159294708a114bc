//! Error types for qmesh mesh operations.
//!
//! Unknown-entity errors are always recoverable and left to the caller.
//! Provider failures abort the operation before any state is committed.

use qmesh_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Node not present in the topology
    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },

    /// Connection not present in the topology
    #[error("Unknown connection: {connection_id}")]
    UnknownConnection { connection_id: String },

    /// No active route between two nodes
    #[error("No route from {source_id} to {target_id}")]
    UnknownRoute { source_id: String, target_id: String },

    /// The secure channel for a link could not be set up
    #[error("Connection {source_id} -> {target_id} failed: {reason}")]
    ConnectionFailed {
        source_id: String,
        target_id: String,
        reason: String,
    },

    /// Key or secure-channel provider error
    #[error("Provider failure: {0}")]
    Provider(#[from] CryptoError),

    /// A startup dependency did not become ready in time
    #[error("Initialization of {component} timed out after {timeout_ms} ms")]
    InitializationTimeout { component: String, timeout_ms: u64 },

    /// Request rejected before touching state
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Network I/O errors
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy referenced by name does not exist
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    /// A corrective action could not be carried out
    #[error("Action {action} on {resource} failed: {reason}")]
    ActionFailed {
        action: String,
        resource: String,
        reason: String,
    },
}

impl MeshError {
    /// Whether the error refers to a node, connection or route that does not exist.
    pub fn is_unknown_entity(&self) -> bool {
        matches!(
            self,
            MeshError::UnknownNode { .. }
                | MeshError::UnknownConnection { .. }
                | MeshError::UnknownRoute { .. }
        )
    }

    pub(crate) fn unknown_node(node_id: impl Into<String>) -> Self {
        MeshError::UnknownNode {
            node_id: node_id.into(),
        }
    }

    pub(crate) fn unknown_connection(connection_id: impl Into<String>) -> Self {
        MeshError::UnknownConnection {
            connection_id: connection_id.into(),
        }
    }
}

impl From<qmesh_core::CoreError> for MeshError {
    fn from(err: qmesh_core::CoreError) -> Self {
        MeshError::Config(err.to_string())
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
