//! Device identity and the trusted-peer store.
//!
//! A node's identity is an Ed25519 keypair generated on first run; its
//! `deviceId` is the hex SHA-256 of the raw public key and never changes
//! for the life of the node. The trust store is the set of peers allowed
//! to complete a handshake.

pub mod identity;
pub mod trust_store;

use thiserror::Error;

pub use identity::{device_id_from_public_key_hex, verify_signature, DeviceIdentity};
pub use trust_store::{TrustStore, TrustedPeer};

/// Failures from identity and trust-store persistence. These are local
/// errors and never cross the wire.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("identity file corrupt: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("could not acquire store lock at {path}: {reason}")]
    LockUnavailable { path: String, reason: String },
}
