//! World model: convergent latest-wins store of gossiped context.
//!
//! Entries are keyed by `(sourceDeviceId, kind, data identity)`. For
//! observation frames carrying both `zone` and `metric` the identity is
//! that pair; otherwise it is the canonical JSON of the data. A bounded
//! ring buffer holds the most recent frames as the authoritative
//! "recent" log.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use serde_json::Value;

use clawmesh_types::canonical::canonicalize;
use clawmesh_types::{ContextFrame, ContextKind};

use crate::seen::SeenSet;

/// Default ring-buffer depth.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Composite key for latest-wins entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorldKey {
    pub source_device_id: String,
    pub kind: ContextKind,
    pub identity: String,
}

/// A latest-wins record.
#[derive(Debug, Clone)]
pub struct WorldEntry {
    pub last_frame: ContextFrame,
    pub last_updated_ms: i64,
    pub update_count: u64,
}

/// The stable identity of a frame's data.
fn data_identity(kind: ContextKind, data: &Value) -> String {
    if kind == ContextKind::Observation {
        if let (Some(Value::String(zone)), Some(Value::String(metric))) =
            (data.get("zone"), data.get("metric"))
        {
            return canonicalize(&serde_json::json!([zone, metric]));
        }
    }
    canonicalize(data)
}

/// Compute the world key for a frame.
pub fn key_for(frame: &ContextFrame) -> WorldKey {
    WorldKey {
        source_device_id: frame.source_device_id.clone(),
        kind: frame.kind,
        identity: data_identity(frame.kind, &frame.data),
    }
}

struct Recency {
    seen: SeenSet,
    history: VecDeque<ContextFrame>,
}

/// Latest-wins store plus ring buffer.
pub struct WorldModel {
    entries: DashMap<WorldKey, WorldEntry>,
    recency: Mutex<Recency>,
    max_history: usize,
}

impl WorldModel {
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            entries: DashMap::new(),
            recency: Mutex::new(Recency {
                seen: SeenSet::default(),
                history: VecDeque::with_capacity(max_history.min(1024)),
            }),
            max_history,
        }
    }

    /// Ingest a frame. Duplicate `frameId`s are no-ops; otherwise the
    /// keyed entry is upserted (incrementing `updateCount`) and the
    /// frame is appended to the ring buffer. Returns whether the frame
    /// was new.
    pub fn ingest(&self, frame: &ContextFrame) -> bool {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.ingest_at(frame, now_ms)
    }

    /// Ingest with an explicit clock.
    pub fn ingest_at(&self, frame: &ContextFrame, now_ms: i64) -> bool {
        {
            let mut recency = self.recency.lock().unwrap_or_else(|e| e.into_inner());
            if !recency.seen.insert(frame.frame_id.clone()) {
                return false;
            }
            if recency.history.len() >= self.max_history {
                recency.history.pop_front();
            }
            recency.history.push_back(frame.clone());
        }

        let key = key_for(frame);
        self.entries
            .entry(key)
            .and_modify(|entry| {
                entry.last_frame = frame.clone();
                entry.last_updated_ms = now_ms;
                entry.update_count += 1;
            })
            .or_insert_with(|| WorldEntry {
                last_frame: frame.clone(),
                last_updated_ms: now_ms,
                update_count: 1,
            });
        true
    }

    /// Latest entry for a key.
    pub fn get(&self, key: &WorldKey) -> Option<WorldEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// All entries of one kind.
    pub fn get_by_kind(&self, kind: ContextKind) -> Vec<(WorldKey, WorldEntry)> {
        self.entries
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Every entry.
    pub fn get_all(&self) -> Vec<(WorldKey, WorldEntry)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Most recent frames, newest first.
    pub fn recent_frames(&self, limit: usize) -> Vec<ContextFrame> {
        let recency = self.recency.lock().unwrap_or_else(|e| e.into_inner());
        recency.history.iter().rev().take(limit).cloned().collect()
    }

    /// Number of keyed entries.
    pub fn size(&self) -> usize {
        self.entries.len()
    }
}

impl Default for WorldModel {
    fn default() -> Self {
        Self::new()
    }
}
