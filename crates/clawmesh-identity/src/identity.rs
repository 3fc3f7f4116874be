//! Device identity: Ed25519 keypair with on-disk persistence.

use std::path::Path;

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::IdentityError;

/// On-disk shape of `identity/device.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    version: u32,
    device_id: String,
    private_key_pem: String,
    public_key_pem: String,
    created_at_iso: chrono::DateTime<chrono::Utc>,
}

/// The node's long-lived signing identity.
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    device_id: String,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// `deviceId` = hex SHA-256 over the raw public-key bytes.
pub fn device_id_for(verifying_key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifying_key.as_bytes());
    hex::encode(hasher.finalize())
}

impl DeviceIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let device_id = device_id_for(&verifying_key);
        Self {
            signing_key,
            verifying_key,
            device_id,
        }
    }

    /// Load the identity at `path`, or generate and persist one.
    ///
    /// The stored `deviceId` must match the stored key; a mismatch means
    /// the file was tampered with or copied between nodes and is refused.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let file: IdentityFile = serde_json::from_str(&contents)?;
            let signing_key = SigningKey::from_pkcs8_pem(&file.private_key_pem)
                .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
            let identity = Self::from_signing_key(signing_key);
            if identity.device_id != file.device_id {
                return Err(IdentityError::Corrupt(format!(
                    "stored deviceId {} does not match key-derived {}",
                    file.device_id, identity.device_id
                )));
            }
            info!(device_id = %identity.device_id, path = %path.display(), "loaded identity");
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.persist(path)?;
        info!(device_id = %identity.device_id, path = %path.display(), "generated new identity");
        Ok(identity)
    }

    /// Write the identity file atomically with owner-only permissions.
    fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        let private_key_pem = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let public_key_pem = self
            .verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;

        let file = IdentityFile {
            version: 1,
            device_id: self.device_id.clone(),
            private_key_pem: private_key_pem.to_string(),
            public_key_pem,
            created_at_iso: chrono::Utc::now(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Stable node identity: hex SHA-256 of the raw public key.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Hex-encoded raw public key bytes.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// Sign a message, returning the hex-encoded signature.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Verify an Ed25519 signature given hex-encoded key and signature.
pub fn verify_signature(public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(pk_bytes) = hex::decode(public_key_hex) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(pk_array): Result<[u8; 32], _> = pk_bytes.try_into() else {
        return false;
    };
    let Ok(sig_array): Result<[u8; 64], _> = sig_bytes.try_into() else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pk_array) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);
    verifying_key.verify(message, &signature).is_ok()
}

/// `deviceId` derived from a hex public key, for checking a claimed id
/// against presented key material.
pub fn device_id_from_public_key_hex(public_key_hex: &str) -> Option<String> {
    let bytes = hex::decode(public_key_hex).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_is_sha256_of_public_key() {
        let identity = DeviceIdentity::generate();
        let derived = device_id_from_public_key_hex(&identity.public_key_hex()).unwrap();
        assert_eq!(identity.device_id(), derived);
        assert_eq!(identity.device_id().len(), 64);
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = DeviceIdentity::generate();
        let sig = identity.sign_hex(b"mesh.connect|v1|abc|123");
        assert!(verify_signature(
            &identity.public_key_hex(),
            b"mesh.connect|v1|abc|123",
            &sig
        ));
        assert!(!verify_signature(
            &identity.public_key_hex(),
            b"mesh.connect|v1|abc|124",
            &sig
        ));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(!verify_signature("zz", b"m", "zz"));
        assert!(!verify_signature("aabb", b"m", "ccdd"));
    }

    #[test]
    fn test_load_or_create_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity").join("device.json");

        let first = DeviceIdentity::load_or_create(&path).unwrap();
        let second = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        DeviceIdentity::load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_tampered_device_id_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        DeviceIdentity::load_or_create(&path).unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw["deviceId"] = serde_json::json!("deadbeef");
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        match DeviceIdentity::load_or_create(&path) {
            Err(IdentityError::Corrupt(_)) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
