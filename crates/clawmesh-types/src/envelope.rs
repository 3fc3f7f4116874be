//! Command envelope (v1).
//!
//! The signed, versioned control-plane message: what to do, where, and
//! under what trust. Envelopes travel inside forward payloads and are
//! validated at both ends of the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, MeshError, MeshResult};
use crate::trust::TrustMetadata;

/// Envelope protocol version understood by this node.
pub const ENVELOPE_VERSION: u32 = 1;

/// What a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Capability,
    Device,
    Peer,
    Task,
}

/// Where a command came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSource {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Where a command is going.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTarget {
    pub kind: TargetKind,
    #[serde(rename = "ref")]
    pub reference: String,
}

/// What the command does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOperation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A validated v1 command envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub version: u32,
    pub kind: String,
    pub command_id: String,
    pub created_at_ms: i64,
    pub source: CommandSource,
    pub target: CommandTarget,
    pub operation: CommandOperation,
    pub trust: TrustMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The caller-supplied portion of an envelope; [`CommandDraft::materialize`]
/// stamps the protocol fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CommandSource>,
    pub target: CommandTarget,
    pub operation: CommandOperation,
    pub trust: TrustMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CommandDraft {
    /// Produce a complete envelope: `version=1`, `kind="command"`, a
    /// fresh `commandId`, and the current wall clock. The source node id
    /// defaults to the local device when the draft names none.
    pub fn materialize(self, local_device_id: &str, now_ms: i64) -> CommandEnvelope {
        CommandEnvelope {
            version: ENVELOPE_VERSION,
            kind: "command".to_string(),
            command_id: uuid::Uuid::new_v4().to_string(),
            created_at_ms: now_ms,
            source: self.source.unwrap_or_else(|| CommandSource {
                node_id: local_device_id.to_string(),
                role: None,
            }),
            target: self.target,
            operation: self.operation,
            trust: self.trust,
            note: self.note,
        }
    }
}

/// Validate a raw value as a v1 command envelope.
///
/// Checks version, kind, id and timestamp presence, the target/operation
/// shape, and the presence and domain of the trust block. Unknown enum
/// values fail.
pub fn validate_command_envelope(raw: &Value) -> MeshResult<CommandEnvelope> {
    let invalid = |msg: String| MeshError::new(ErrorCode::InvalidCommandEnvelope, msg);

    let envelope: CommandEnvelope = serde_json::from_value(raw.clone())
        .map_err(|e| invalid(format!("malformed command envelope: {e}")))?;

    if envelope.version != ENVELOPE_VERSION {
        return Err(invalid(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }
    if envelope.kind != "command" {
        return Err(invalid(format!("unsupported envelope kind {:?}", envelope.kind)));
    }
    if envelope.command_id.trim().is_empty() {
        return Err(invalid("commandId must be non-empty".to_string()));
    }
    if envelope.source.node_id.trim().is_empty() {
        return Err(invalid("source.nodeId must be non-empty".to_string()));
    }
    if envelope.target.reference.trim().is_empty() {
        return Err(invalid("target.ref must be non-empty".to_string()));
    }
    if envelope.operation.name.trim().is_empty() {
        return Err(invalid("operation.name must be non-empty".to_string()));
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{ActionType, TrustTier, VerificationMode};
    use serde_json::json;

    fn draft() -> CommandDraft {
        CommandDraft {
            source: None,
            target: CommandTarget {
                kind: TargetKind::Capability,
                reference: "actuator:mock:valve-1".to_string(),
            },
            operation: CommandOperation {
                name: "open".to_string(),
                params: Some(json!({"durationSec": 45})),
            },
            trust: TrustMetadata {
                action_type: ActionType::Actuation,
                evidence_trust_tier: TrustTier::T3VerifiedActionEvidence,
                minimum_trust_tier: TrustTier::T2OperationalObservation,
                verification_required: VerificationMode::Human,
                verification_satisfied: Some(true),
                evidence_sources: None,
                approved_by: None,
            },
            note: None,
        }
    }

    #[test]
    fn test_materialize_then_validate() {
        let envelope = draft().materialize("device-a", 1_700_000_000_000);
        assert_eq!(envelope.version, 1);
        assert_eq!(envelope.kind, "command");
        assert_eq!(envelope.source.node_id, "device-a");
        assert!(!envelope.command_id.is_empty());

        let raw = serde_json::to_value(&envelope).unwrap();
        let validated = validate_command_envelope(&raw).unwrap();
        assert_eq!(validated.command_id, envelope.command_id);
    }

    #[test]
    fn test_target_ref_serializes_as_ref() {
        let envelope = draft().materialize("device-a", 0);
        let raw = serde_json::to_value(&envelope).unwrap();
        assert_eq!(raw["target"]["ref"], "actuator:mock:valve-1");
        assert_eq!(raw["target"]["kind"], "capability");
        assert_eq!(raw["trust"]["action_type"], "actuation");
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut raw = serde_json::to_value(draft().materialize("d", 0)).unwrap();
        raw["version"] = json!(2);
        let err = validate_command_envelope(&raw).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCommandEnvelope);
    }

    #[test]
    fn test_unknown_target_kind_rejected() {
        let mut raw = serde_json::to_value(draft().materialize("d", 0)).unwrap();
        raw["target"]["kind"] = json!("galaxy");
        assert!(validate_command_envelope(&raw).is_err());
    }

    #[test]
    fn test_unknown_verification_rejected() {
        let mut raw = serde_json::to_value(draft().materialize("d", 0)).unwrap();
        raw["trust"]["verification_required"] = json!("majority_vote");
        assert!(validate_command_envelope(&raw).is_err());
    }

    #[test]
    fn test_empty_command_id_rejected() {
        let mut raw = serde_json::to_value(draft().materialize("d", 0)).unwrap();
        raw["commandId"] = json!("");
        assert!(validate_command_envelope(&raw).is_err());
    }

    #[test]
    fn test_missing_trust_rejected() {
        let mut raw = serde_json::to_value(draft().materialize("d", 0)).unwrap();
        raw.as_object_mut().unwrap().remove("trust");
        assert!(validate_command_envelope(&raw).is_err());
    }

    #[test]
    fn test_draft_keeps_explicit_source() {
        let mut d = draft();
        d.source = Some(CommandSource {
            node_id: "planner-node".to_string(),
            role: Some("planner".to_string()),
        });
        let envelope = d.materialize("device-a", 0);
        assert_eq!(envelope.source.node_id, "planner-node");
        assert_eq!(envelope.source.role.as_deref(), Some("planner"));
    }
}
