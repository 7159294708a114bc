//! Key/Crypto provider: long-term identity keys for mesh nodes.
//!
//! The orchestration core uses this provider once, at local-node bootstrap, to
//! create the node's identity key and publish its public half in discovery
//! beacons. Beacon signatures are checked with [`verify_signature`].

use crate::error::{CryptoError, CryptoResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

/// Identity key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// Ed25519 signatures
    Ed25519,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(KeyAlgorithm::Ed25519),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Reference to a generated key pair. The secret half never leaves the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    pub owner_id: String,
    pub algorithm: KeyAlgorithm,
    /// First 16 bytes of the BLAKE3 hash of the public key, hex encoded
    pub public_key_id: String,
    /// Creation time (Unix epoch milliseconds)
    pub created_at: u64,
}

/// Source of long-term identity keys.
pub trait KeyProvider: Send + Sync {
    /// Generate (or replace) the key pair owned by `owner_id`.
    fn generate_key_pair(&self, algorithm: KeyAlgorithm, owner_id: &str)
        -> CryptoResult<KeyHandle>;

    /// Public key bytes of `owner_id`.
    fn get_public_key(&self, owner_id: &str) -> CryptoResult<Vec<u8>>;

    /// Sign `message` with the key owned by `owner_id`.
    fn sign(&self, owner_id: &str, message: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// In-process Ed25519 key store.
#[derive(Default)]
pub struct SoftwareKeyProvider {
    keys: RwLock<HashMap<String, SigningKey>>,
}

impl SoftwareKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of owners with a key pair.
    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }
}

impl KeyProvider for SoftwareKeyProvider {
    fn generate_key_pair(
        &self,
        algorithm: KeyAlgorithm,
        owner_id: &str,
    ) -> CryptoResult<KeyHandle> {
        if owner_id.is_empty() {
            return Err(CryptoError::InvalidParameter {
                name: "owner_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let mut secret_bytes = [0u8; 32];
        rand::thread_rng()
            .try_fill_bytes(&mut secret_bytes)
            .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        secret_bytes.zeroize();

        let handle = KeyHandle {
            owner_id: owner_id.to_string(),
            algorithm,
            public_key_id: key_id(&signing_key.verifying_key()),
            created_at: current_timestamp_ms(),
        };

        self.keys.write().insert(owner_id.to_string(), signing_key);
        tracing::debug!(owner_id, key_id = %handle.public_key_id, "Generated identity key");
        Ok(handle)
    }

    fn get_public_key(&self, owner_id: &str) -> CryptoResult<Vec<u8>> {
        self.keys
            .read()
            .get(owner_id)
            .map(|key| key.verifying_key().to_bytes().to_vec())
            .ok_or_else(|| CryptoError::KeyNotFound {
                owner_id: owner_id.to_string(),
            })
    }

    fn sign(&self, owner_id: &str, message: &[u8]) -> CryptoResult<Vec<u8>> {
        let keys = self.keys.read();
        let key = keys.get(owner_id).ok_or_else(|| CryptoError::KeyNotFound {
            owner_id: owner_id.to_string(),
        })?;
        Ok(key.sign(message).to_bytes().to_vec())
    }
}

/// Verify an Ed25519 signature against raw public key bytes.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| CryptoError::Signature(format!("bad public key length {}", public_key.len())))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| CryptoError::Signature(e.to_string()))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| CryptoError::Signature(e.to_string()))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|e| CryptoError::Signature(e.to_string()))
}

/// Stable public key identifier.
pub fn key_id(verifying_key: &VerifyingKey) -> String {
    let hash = blake3::hash(verifying_key.as_bytes());
    hex::encode(&hash.as_bytes()[..16])
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_fetch_public_key() {
        let provider = SoftwareKeyProvider::new();
        let handle = provider
            .generate_key_pair(KeyAlgorithm::Ed25519, "node-1")
            .unwrap();

        assert_eq!(handle.owner_id, "node-1");
        assert_eq!(handle.public_key_id.len(), 32);

        let public_key = provider.get_public_key("node-1").unwrap();
        assert_eq!(public_key.len(), 32);
        assert_eq!(provider.key_count(), 1);
    }

    #[test]
    fn test_unknown_owner() {
        let provider = SoftwareKeyProvider::new();
        assert!(matches!(
            provider.get_public_key("ghost"),
            Err(CryptoError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let provider = SoftwareKeyProvider::new();
        provider
            .generate_key_pair(KeyAlgorithm::Ed25519, "node-1")
            .unwrap();
        let public_key = provider.get_public_key("node-1").unwrap();

        let signature = provider.sign("node-1", b"beacon").unwrap();
        assert!(verify_signature(&public_key, b"beacon", &signature).is_ok());
        assert!(verify_signature(&public_key, b"tampered", &signature).is_err());
    }

    #[test]
    fn test_regenerate_replaces_key() {
        let provider = SoftwareKeyProvider::new();
        provider.generate_key_pair(KeyAlgorithm::Ed25519, "n").unwrap();
        let first = provider.get_public_key("n").unwrap();
        provider.generate_key_pair(KeyAlgorithm::Ed25519, "n").unwrap();
        let second = provider.get_public_key("n").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("Ed25519".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Ed25519);
        assert!(matches!(
            "dilithium3".parse::<KeyAlgorithm>(),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_verify_rejects_bad_key_length() {
        assert!(verify_signature(&[1, 2, 3], b"m", &[0u8; 64]).is_err());
    }
}
