//! Context propagator: hop-limited gossip of context frames.
//!
//! Outbound frames are stamped (fresh id, local source, current clock,
//! zero hops), remembered, and emitted to every session. Inbound frames
//! are deduplicated, ingested into the world model, and re-emitted to
//! every session except the one they arrived from while under the hop
//! limit. Emission is best-effort; transport errors are swallowed.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use clawmesh_types::{ContextFrame, ContextKind, FrameTrust};
use clawmesh_wire::SessionRegistry;

use crate::seen::SeenSet;
use crate::world::WorldModel;

/// Event name context frames travel under.
pub const CONTEXT_FRAME_EVENT: &str = "context.frame";

/// A frame is not re-broadcast once it has taken this many hops.
pub const MAX_GOSSIP_HOPS: u32 = 3;

/// A frame before stamping: what the caller controls.
#[derive(Debug, Clone)]
pub struct FrameDraft {
    pub kind: ContextKind,
    pub data: Value,
    pub trust: FrameTrust,
    pub note: Option<String>,
}

/// Gossip driver for one node.
pub struct ContextPropagator {
    device_id: String,
    display_name: Option<String>,
    sessions: Arc<SessionRegistry>,
    world: Arc<WorldModel>,
    seen: Mutex<SeenSet>,
}

impl ContextPropagator {
    pub fn new(
        device_id: impl Into<String>,
        display_name: Option<String>,
        sessions: Arc<SessionRegistry>,
        world: Arc<WorldModel>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            display_name,
            sessions,
            world,
            seen: Mutex::new(SeenSet::default()),
        }
    }

    /// Stamp and emit a locally originated frame to every session.
    pub fn broadcast(&self, draft: FrameDraft) -> ContextFrame {
        let frame = ContextFrame {
            kind: draft.kind,
            frame_id: uuid::Uuid::new_v4().to_string(),
            source_device_id: self.device_id.clone(),
            source_display_name: self.display_name.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            data: draft.data,
            trust: draft.trust,
            note: draft.note,
            hops: Some(0),
        };
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(frame.frame_id.clone());
        match serde_json::to_value(&frame) {
            Ok(payload) => self.sessions.broadcast_event(CONTEXT_FRAME_EVENT, payload),
            Err(e) => warn!(error = %e, "context frame failed to serialize"),
        }
        frame
    }

    /// Sensor observation with its conventional trust.
    pub fn broadcast_observation(&self, data: Value, note: Option<String>) -> ContextFrame {
        self.broadcast(FrameDraft {
            kind: ContextKind::Observation,
            data,
            trust: FrameTrust::observation(),
            note,
        })
    }

    /// Direct human input with its conventional trust.
    pub fn broadcast_human_input(&self, data: Value, note: Option<String>) -> ContextFrame {
        self.broadcast(FrameDraft {
            kind: ContextKind::HumanInput,
            data,
            trust: FrameTrust::human_input(),
            note,
        })
    }

    /// Model inference with its conventional trust.
    pub fn broadcast_inference(&self, data: Value, note: Option<String>) -> ContextFrame {
        self.broadcast(FrameDraft {
            kind: ContextKind::Inference,
            data,
            trust: FrameTrust::inference(),
            note,
        })
    }

    /// Process a frame received from a peer. Returns whether it was
    /// ingested (duplicates and own loops are dropped).
    pub fn handle_inbound(&self, frame: ContextFrame, from_device_id: &str) -> bool {
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if seen.contains(&frame.frame_id) {
                return false;
            }
            seen.insert(frame.frame_id.clone());
            if frame.source_device_id == self.device_id {
                // Our own frame came back around.
                return false;
            }
        }

        self.world.ingest(&frame);

        let hops = frame.hop_count();
        if hops < MAX_GOSSIP_HOPS {
            let mut relayed = frame;
            relayed.hops = Some(hops + 1);
            match serde_json::to_value(&relayed) {
                Ok(payload) => {
                    self.sessions
                        .broadcast_event_except(from_device_id, CONTEXT_FRAME_EVENT, payload)
                }
                Err(e) => warn!(error = %e, "context frame failed to serialize"),
            }
        } else {
            debug!(frame_id = %frame.frame_id, hops, "frame at hop limit, not relaying");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawmesh_wire::{Outbound, PeerSession};
    use clawmesh_types::WireFrame;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn attach_peer(
        sessions: &SessionRegistry,
        device: &str,
    ) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        sessions.register(PeerSession::new(
            device,
            format!("conn-{device}"),
            None,
            "ab".repeat(32),
            false,
            0,
            tx,
        ));
        rx
    }

    fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<ContextFrame> {
        match rx.try_recv().ok()? {
            Outbound::Frame(WireFrame::Event { event, payload }) => {
                assert_eq!(event, CONTEXT_FRAME_EVENT);
                Some(serde_json::from_value(payload).unwrap())
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    fn propagator(sessions: Arc<SessionRegistry>) -> (ContextPropagator, Arc<WorldModel>) {
        let world = Arc::new(WorldModel::new());
        (
            ContextPropagator::new("local-dev", None, sessions, Arc::clone(&world)),
            world,
        )
    }

    #[test]
    fn test_broadcast_stamps_and_emits() {
        let sessions = Arc::new(SessionRegistry::new());
        let mut rx = attach_peer(&sessions, "dev-b");
        let (propagator, _world) = propagator(Arc::clone(&sessions));

        let frame = propagator.broadcast_observation(
            json!({"zone": "paddock-3", "metric": "soil_moisture", "value": 0.31}),
            None,
        );
        assert_eq!(frame.source_device_id, "local-dev");
        assert_eq!(frame.hop_count(), 0);
        assert!(!frame.frame_id.is_empty());

        let emitted = recv_frame(&mut rx).unwrap();
        assert_eq!(emitted.frame_id, frame.frame_id);
    }

    #[test]
    fn test_inbound_ingests_once_and_relays_with_incremented_hops() {
        let sessions = Arc::new(SessionRegistry::new());
        let mut rx_b = attach_peer(&sessions, "dev-b");
        let mut rx_c = attach_peer(&sessions, "dev-c");
        let (propagator, world) = propagator(Arc::clone(&sessions));

        let frame = ContextFrame {
            kind: ContextKind::Observation,
            frame_id: "f-1".to_string(),
            source_device_id: "dev-b".to_string(),
            source_display_name: None,
            timestamp: 0,
            data: json!({"zone": "z", "metric": "m", "value": 1}),
            trust: FrameTrust::observation(),
            note: None,
            hops: Some(0),
        };

        assert!(propagator.handle_inbound(frame.clone(), "dev-b"));
        assert_eq!(world.size(), 1);

        // Relayed to dev-c with hops+1, not back to dev-b.
        assert!(recv_frame(&mut rx_b).is_none());
        let relayed = recv_frame(&mut rx_c).unwrap();
        assert_eq!(relayed.hop_count(), 1);
        assert_eq!(relayed.frame_id, "f-1");

        // Re-delivery is a no-op.
        assert!(!propagator.handle_inbound(frame, "dev-c"));
        assert_eq!(world.size(), 1);
        assert!(recv_frame(&mut rx_c).is_none());
    }

    #[test]
    fn test_own_frame_loop_dropped() {
        let sessions = Arc::new(SessionRegistry::new());
        let mut rx = attach_peer(&sessions, "dev-b");
        let (propagator, world) = propagator(Arc::clone(&sessions));

        let frame = ContextFrame {
            kind: ContextKind::Inference,
            frame_id: "f-loop".to_string(),
            source_device_id: "local-dev".to_string(),
            source_display_name: None,
            timestamp: 0,
            data: json!({"plan": "irrigate"}),
            trust: FrameTrust::inference(),
            note: None,
            hops: Some(1),
        };
        assert!(!propagator.handle_inbound(frame, "dev-b"));
        assert_eq!(world.size(), 0);
        assert!(recv_frame(&mut rx).is_none());
    }

    #[test]
    fn test_hop_limit_ingested_but_not_relayed() {
        let sessions = Arc::new(SessionRegistry::new());
        let mut rx_c = attach_peer(&sessions, "dev-c");
        let (propagator, world) = propagator(Arc::clone(&sessions));

        let frame = ContextFrame {
            kind: ContextKind::Event,
            frame_id: "f-max".to_string(),
            source_device_id: "dev-b".to_string(),
            source_display_name: None,
            timestamp: 0,
            data: json!({"event": "gate_opened"}),
            trust: FrameTrust::observation(),
            note: None,
            hops: Some(MAX_GOSSIP_HOPS),
        };
        assert!(propagator.handle_inbound(frame, "dev-b"));
        assert_eq!(world.size(), 1);
        assert!(recv_frame(&mut rx_c).is_none());
    }

    #[test]
    fn test_builders_fill_conventional_trust() {
        let sessions = Arc::new(SessionRegistry::new());
        let (propagator, _world) = propagator(sessions);

        let human = propagator.broadcast_human_input(json!({"text": "open the gate"}), None);
        assert_eq!(human.trust, FrameTrust::human_input());
        assert_eq!(human.kind, ContextKind::HumanInput);

        let inference = propagator.broadcast_inference(json!({"plan": "x"}), None);
        assert_eq!(inference.trust, FrameTrust::inference());
    }
}
