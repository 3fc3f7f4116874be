//! Mesh configuration.
//!
//! The recognized option set is closed: unknown keys are rejected so a
//! typo cannot silently disable a peer or a capability.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ErrorCode, MeshError, MeshResult};

/// Smallest allowed discovery announce interval.
pub const MIN_SCAN_INTERVAL_MS: u64 = 5000;

fn default_enabled() -> bool {
    true
}

fn default_scan_interval_ms() -> u64 {
    15_000
}

/// A statically configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StaticPeerConfig {
    /// WebSocket URL, e.g. `ws://10.0.0.12:7430`.
    pub url: String,
    pub device_id: String,
    /// Certificate pin. Recognized for contract compatibility, but this
    /// node terminates plaintext `ws://` and observes no certificate, so
    /// a pinned peer is rejected at validation rather than failing every
    /// dial at runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_fingerprint: Option<String>,
}

/// Mesh configuration as loaded from the `[mesh]` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MeshConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Capabilities this node advertises.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub peers: Vec<StaticPeerConfig>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            scan_interval_ms: default_scan_interval_ms(),
            capabilities: Vec::new(),
            peers: Vec::new(),
        }
    }
}

impl MeshConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> MeshResult<Self> {
        let config: MeshConfig = toml::from_str(contents)
            .map_err(|e| MeshError::new(ErrorCode::InvalidParams, format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file path; a missing file yields the defaults.
    pub fn load(path: &Path) -> MeshResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MeshError::new(
                ErrorCode::InvalidParams,
                format!("failed to read config {}: {e}", path.display()),
            )
        })?;
        Self::from_toml(&contents)
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> MeshResult<()> {
        if self.scan_interval_ms < MIN_SCAN_INTERVAL_MS {
            return Err(MeshError::new(
                ErrorCode::InvalidParams,
                format!(
                    "scanIntervalMs must be at least {MIN_SCAN_INTERVAL_MS}, got {}",
                    self.scan_interval_ms
                ),
            ));
        }
        for cap in &self.capabilities {
            if crate::capability::Capability::parse(cap).is_none() {
                return Err(MeshError::new(
                    ErrorCode::InvalidParams,
                    format!("malformed capability string {cap:?}"),
                ));
            }
        }
        for peer in &self.peers {
            if peer.url.trim().is_empty() || peer.device_id.trim().is_empty() {
                return Err(MeshError::new(
                    ErrorCode::InvalidParams,
                    "static peer entries require url and deviceId".to_string(),
                ));
            }
            if peer.tls_fingerprint.is_some() {
                return Err(MeshError::new(
                    ErrorCode::InvalidParams,
                    format!(
                        "peer {} pins tlsFingerprint, but this node dials plaintext ws:// and \
                         cannot attest a certificate; remove the pin or terminate TLS in front",
                        peer.device_id
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert!(config.enabled);
        assert_eq!(config.scan_interval_ms, 15_000);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = MeshConfig::from_toml(
            r#"
            enabled = true
            scanIntervalMs = 10000
            capabilities = ["channel:telegram", "sensor:soil"]

            [[peers]]
            url = "ws://10.0.0.12:7430"
            deviceId = "abc123"
            "#,
        )
        .unwrap();
        assert_eq!(config.scan_interval_ms, 10_000);
        assert_eq!(config.capabilities.len(), 2);
        assert_eq!(config.peers[0].device_id, "abc123");
        assert!(config.peers[0].tls_fingerprint.is_none());
    }

    #[test]
    fn test_pinned_static_peer_rejected() {
        // tlsFingerprint is a recognized key, so it must not trip the
        // unknown-field check, but a plaintext node cannot honor it.
        let err = MeshConfig::from_toml(
            r#"
            [[peers]]
            url = "ws://10.0.0.12:7430"
            deviceId = "abc123"
            tlsFingerprint = "aa:bb"
            "#,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
        assert!(err.message.contains("tlsFingerprint"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = MeshConfig::from_toml("enabeld = true").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
    }

    #[test]
    fn test_scan_interval_floor() {
        let err = MeshConfig::from_toml("scanIntervalMs = 4999").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
        assert!(MeshConfig::from_toml("scanIntervalMs = 5000").is_ok());
    }

    #[test]
    fn test_malformed_capability_rejected() {
        let err = MeshConfig::from_toml(r#"capabilities = ["telegram"]"#).unwrap_err();
        assert!(err.message.contains("capability"));
    }
}
