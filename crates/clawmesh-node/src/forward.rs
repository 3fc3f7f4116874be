//! One-hop command forwarding.
//!
//! The sender materializes the envelope, derives top-level trust, and
//! runs the trust gate before anything touches the network. The receiver
//! re-checks loop prevention, envelope consistency, and the same trust
//! gate before invoking the injected delivery sink. Both ends refuse
//! the same inputs for the same reasons.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use clawmesh_types::trust::{evaluate_forward_trust, resolve_forward_trust};
use clawmesh_types::{
    CommandDraft, CommandEnvelope, ErrorCode, ForwardPayload, MeshError, MeshResult,
};
use clawmesh_wire::SessionRegistry;

/// The RPC method forwards travel over.
pub const FORWARD_METHOD: &str = "mesh.message.forward";

/// How many idempotency keys the receiver remembers.
const REPLAY_CACHE_CAPACITY: usize = 1024;

/// Where an accepted forward lands. The host application injects this;
/// a failure inside it surfaces as `DELIVERY_FAILED`.
#[async_trait]
pub trait ForwardSink: Send + Sync {
    async fn deliver(&self, payload: &ForwardPayload) -> Result<(), String>;
}

/// Receiver acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAck {
    pub message_id: String,
    pub channel: String,
}

/// Caller-facing request for [`forward_message_to_peer`].
#[derive(Debug, Clone, Default)]
pub struct ForwardRequest {
    pub peer_device_id: String,
    pub channel: String,
    pub to: String,
    pub message: Option<String>,
    pub media_url: Option<String>,
    pub account_id: Option<String>,
    pub idempotency_key: Option<String>,
    /// Draft to materialize into a fresh envelope.
    pub command_draft: Option<CommandDraft>,
    /// A complete envelope to carry as-is. Wins over `command_draft`.
    pub command: Option<CommandEnvelope>,
    /// Explicit top-level trust; derived from the envelope when absent.
    pub trust: Option<Value>,
    pub timeout: Option<Duration>,
}

/// Forward a message to a peer over `mesh.message.forward`.
pub async fn forward_message_to_peer(
    sessions: &SessionRegistry,
    local_device_id: &str,
    request: ForwardRequest,
) -> MeshResult<ForwardAck> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let envelope = match (request.command, request.command_draft) {
        (Some(envelope), _) => Some(envelope),
        (None, Some(draft)) => Some(draft.materialize(local_device_id, now_ms)),
        (None, None) => None,
    };

    let command = envelope
        .map(|e| serde_json::to_value(&e))
        .transpose()
        .map_err(|e| MeshError::internal(format!("envelope serialization failed: {e}")))?;

    // Derive top-level trust from the envelope when the caller gave none.
    let trust = match (&request.trust, &command) {
        (Some(trust), _) => Some(trust.clone()),
        (None, Some(command)) => command.get("trust").cloned(),
        (None, None) => None,
    };

    let payload = ForwardPayload {
        channel: request.channel,
        to: request.to,
        message: request.message,
        media_url: request.media_url,
        account_id: request.account_id,
        origin_gateway_id: local_device_id.to_string(),
        idempotency_key: Some(
            request
                .idempotency_key
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        ),
        command,
        trust,
    };

    // Fail fast: the receiver will run the same checks, but a denial
    // here avoids the network round trip entirely.
    let effective_trust = resolve_forward_trust(&payload)?;
    evaluate_forward_trust(effective_trust.as_ref())?;

    let params = serde_json::to_value(&payload)
        .map_err(|e| MeshError::internal(format!("forward serialization failed: {e}")))?;
    let response = sessions
        .invoke(
            &request.peer_device_id,
            FORWARD_METHOD,
            params,
            request.timeout,
        )
        .await?;

    serde_json::from_value(response)
        .map_err(|e| MeshError::internal(format!("malformed forward ack: {e}")))
}

/// Bounded idempotency-key → message-id map, oldest evicted first.
struct ReplayCache {
    order: VecDeque<String>,
    by_key: HashMap<String, String>,
    capacity: usize,
}

impl ReplayCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            by_key: HashMap::new(),
            capacity,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.by_key.get(key).cloned()
    }

    fn insert(&mut self, key: String, message_id: String) {
        if self.by_key.insert(key.clone(), message_id).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.by_key.remove(&oldest);
            }
        }
    }
}

/// The `mesh.message.forward` receiver.
pub struct ForwardReceiver {
    local_device_id: String,
    sink: Arc<dyn ForwardSink>,
    replays: Mutex<ReplayCache>,
}

impl ForwardReceiver {
    pub fn new(local_device_id: impl Into<String>, sink: Arc<dyn ForwardSink>) -> Self {
        Self {
            local_device_id: local_device_id.into(),
            sink,
            replays: Mutex::new(ReplayCache::new(REPLAY_CACHE_CAPACITY)),
        }
    }

    /// Validate, gate, and deliver one inbound forward.
    pub async fn handle(&self, params: Value) -> MeshResult<Value> {
        let payload: ForwardPayload = serde_json::from_value(params)
            .map_err(|e| MeshError::invalid_params(format!("malformed forward payload: {e}")))?;

        if payload.channel.trim().is_empty()
            || payload.to.trim().is_empty()
            || payload.origin_gateway_id.trim().is_empty()
        {
            return Err(MeshError::invalid_params(
                "forward requires channel, to and originGatewayId",
            ));
        }

        if payload.origin_gateway_id == self.local_device_id {
            return Err(MeshError::new(
                ErrorCode::LoopDetected,
                "forward originated at this gateway",
            ));
        }

        let effective_trust = resolve_forward_trust(&payload)?;
        evaluate_forward_trust(effective_trust.as_ref())?;

        // A retried idempotency key replays the original ack without
        // re-invoking the sink.
        if let Some(key) = &payload.idempotency_key {
            let replays = self.replays.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(message_id) = replays.get(key) {
                debug!(key = %key, "replaying forward ack for retried key");
                return serde_json::to_value(ForwardAck {
                    message_id,
                    channel: payload.channel.clone(),
                })
                .map_err(|e| MeshError::internal(e.to_string()));
            }
        }

        self.sink
            .deliver(&payload)
            .await
            .map_err(|reason| MeshError::new(ErrorCode::DeliveryFailed, reason))?;

        let message_id = uuid::Uuid::new_v4().to_string();
        if let Some(key) = &payload.idempotency_key {
            self.replays
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key.clone(), message_id.clone());
        }
        info!(
            channel = %payload.channel,
            origin = %payload.origin_gateway_id,
            message_id = %message_id,
            "forward delivered"
        );
        serde_json::to_value(ForwardAck {
            message_id,
            channel: payload.channel,
        })
        .map_err(|e| MeshError::internal(e.to_string()))
    }
}
