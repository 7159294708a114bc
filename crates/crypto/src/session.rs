//! Secure-channel provider: symmetric session keys for mesh links.
//!
//! The orchestration core asks the provider for a fresh session when it
//! handshakes with a discovered node and when it establishes or re-keys a
//! link. A session yields key material of the requested length plus a
//! [`ChannelMetrics`] quality report (error rate, key rate, fidelity, distance)
//! that the core records on the link.
//!
//! [`X25519SessionProvider`] is the bundled implementation. It derives each
//! session key from an X25519 exchange between two ephemeral key pairs,
//! stretched to the requested length with the BLAKE3 XOF. Per-peer
//! [`LinkProfile`]s describe the physical channel (distance, expected error
//! rate, key rate) so the metrics reflect the deployment.

use crate::error::{CryptoError, CryptoResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

/// Largest session key the provider hands out.
pub const MAX_SESSION_BITS: usize = 8192;

/// Context string for BLAKE3 key derivation.
const KDF_CONTEXT: &str = "qmesh 2024 link session key";

/// Opaque session handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Measured quality of a secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    /// Fraction of corrupted bits (QBER), 0.0 to 1.0
    pub error_rate: f64,
    /// Key generation rate in bits per second
    pub key_rate: f64,
    /// State fidelity, 0.0 to 1.0
    pub fidelity: f64,
    /// Physical channel length in kilometres
    pub distance_km: f64,
}

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self {
            error_rate: 0.0,
            key_rate: 0.0,
            fidelity: 1.0,
            distance_km: 0.0,
        }
    }
}

/// Key material of an established session. Zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    pub session_id: SessionId,
    pub bit_length: usize,
    pub metrics: ChannelMetrics,
    material: Zeroizing<Vec<u8>>,
}

impl SessionKey {
    pub fn new(session_id: SessionId, material: Vec<u8>, metrics: ChannelMetrics) -> Self {
        Self {
            session_id,
            bit_length: material.len() * 8,
            metrics,
            material: Zeroizing::new(material),
        }
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }

    /// Short, non-secret fingerprint usable in logs and link records.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.material);
        hex::encode(&hash.as_bytes()[..8])
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("session_id", &self.session_id)
            .field("bit_length", &self.bit_length)
            .field("metrics", &self.metrics)
            .field("material", &"<redacted>")
            .finish()
    }
}

/// Source of symmetric session keys for discovery handshakes and links.
#[async_trait]
pub trait SecureChannelProvider: Send + Sync {
    /// Resolves once the provider can serve sessions.
    async fn ready(&self) -> CryptoResult<()> {
        Ok(())
    }

    /// Start a session with the peer identified by `peer_hint`.
    async fn start_secure_session(
        &self,
        peer_hint: &str,
        bit_length: usize,
    ) -> CryptoResult<SessionId>;

    /// Key material of a started session, if it completed.
    async fn get_session_key(&self, session_id: &SessionId) -> Option<SessionKey>;

    /// Forget a session. Unknown sessions are ignored.
    async fn close_session(&self, _session_id: &SessionId) {}
}

/// Physical description of the channel towards one peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkProfile {
    pub distance_km: f64,
    pub error_rate: f64,
    /// Fixed key rate; when absent the provider reports the measured rate
    pub key_rate: Option<f64>,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            distance_km: 0.0,
            error_rate: 0.0,
            key_rate: None,
        }
    }
}

/// X25519 + BLAKE3 session provider.
///
/// Both ephemeral halves are generated in-process; the responder half stands
/// in for the peer until the exchange is carried over the wire.
pub struct X25519SessionProvider {
    local_id: String,
    sessions: RwLock<HashMap<SessionId, SessionKey>>,
    profiles: RwLock<HashMap<String, LinkProfile>>,
    unreachable: RwLock<HashSet<String>>,
}

impl X25519SessionProvider {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            sessions: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
        }
    }

    /// Describe the channel towards `peer_hint`.
    pub fn set_link_profile(&self, peer_hint: impl Into<String>, profile: LinkProfile) {
        self.profiles.write().insert(peer_hint.into(), profile);
    }

    /// Mark a peer as unreachable; sessions with it fail until cleared.
    pub fn set_unreachable(&self, peer_hint: impl Into<String>, unreachable: bool) {
        let peer_hint = peer_hint.into();
        if unreachable {
            self.unreachable.write().insert(peer_hint);
        } else {
            self.unreachable.write().remove(&peer_hint);
        }
    }

    /// Number of sessions currently held.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn derive_key(&self, peer_hint: &str, bit_length: usize) -> Zeroizing<Vec<u8>> {
        let initiator = EphemeralSecret::random_from_rng(rand::thread_rng());
        let responder = EphemeralSecret::random_from_rng(rand::thread_rng());
        let responder_public = X25519PublicKey::from(&responder);
        let shared = initiator.diffie_hellman(&responder_public);

        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT);
        hasher.update(shared.as_bytes());
        hasher.update(self.local_id.as_bytes());
        hasher.update(peer_hint.as_bytes());

        let mut material = Zeroizing::new(vec![0u8; bit_length / 8]);
        hasher.finalize_xof().fill(&mut material);
        material
    }
}

#[async_trait]
impl SecureChannelProvider for X25519SessionProvider {
    async fn start_secure_session(
        &self,
        peer_hint: &str,
        bit_length: usize,
    ) -> CryptoResult<SessionId> {
        if bit_length == 0 || bit_length % 8 != 0 || bit_length > MAX_SESSION_BITS {
            return Err(CryptoError::InvalidParameter {
                name: "bit_length".to_string(),
                reason: format!("{bit_length} is not a multiple of 8 in 8..={MAX_SESSION_BITS}"),
            });
        }
        if self.unreachable.read().contains(peer_hint) {
            return Err(CryptoError::SessionFailed {
                peer: peer_hint.to_string(),
                reason: "peer unreachable".to_string(),
            });
        }

        let started = Instant::now();
        let material = self.derive_key(peer_hint, bit_length);
        let elapsed = started.elapsed().as_secs_f64().max(1e-6);

        let profile = self
            .profiles
            .read()
            .get(peer_hint)
            .copied()
            .unwrap_or_default();
        let metrics = ChannelMetrics {
            error_rate: profile.error_rate,
            key_rate: profile
                .key_rate
                .unwrap_or(bit_length as f64 / elapsed),
            fidelity: (1.0 - 2.0 * profile.error_rate).clamp(0.0, 1.0),
            distance_km: profile.distance_km,
        };

        let session_id = SessionId::new();
        let key = SessionKey::new(session_id.clone(), material.to_vec(), metrics);
        self.sessions.write().insert(session_id.clone(), key);

        tracing::debug!(peer = peer_hint, session = %session_id, bit_length, "Secure session established");
        Ok(session_id)
    }

    async fn get_session_key(&self, session_id: &SessionId) -> Option<SessionKey> {
        self.sessions.read().get(session_id).cloned()
    }

    async fn close_session(&self, session_id: &SessionId) {
        self.sessions.write().remove(session_id);
    }
}
