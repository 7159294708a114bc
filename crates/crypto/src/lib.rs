//! Cryptographic providers consumed by the qmesh orchestration core.
//!
//! The core treats cryptography as two opaque collaborators:
//!
//! - **Key/Crypto Provider** ([`KeyProvider`]): long-term identity keys,
//!   used once at local-node bootstrap and for signing discovery beacons.
//! - **Secure-Channel Provider** ([`SecureChannelProvider`]): symmetric
//!   session keys plus a channel quality report, used for discovery
//!   handshakes and for every link the core establishes.
//!
//! Bundled implementations: [`SoftwareKeyProvider`] (Ed25519) and
//! [`X25519SessionProvider`] (X25519 exchange, BLAKE3 key derivation).

pub mod error;
pub mod keys;
pub mod session;

pub use error::{CryptoError, CryptoResult};
pub use keys::{key_id, verify_signature, KeyAlgorithm, KeyHandle, KeyProvider, SoftwareKeyProvider};
pub use session::{
    ChannelMetrics, LinkProfile, SecureChannelProvider, SessionId, SessionKey,
    X25519SessionProvider, MAX_SESSION_BITS,
};
