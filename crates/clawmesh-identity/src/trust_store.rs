//! Trusted-peer store.
//!
//! A JSON file mapping `deviceId` to a trusted-peer record. Writes are
//! atomic (temp + rename) under an advisory file lock with bounded,
//! jittered retry, so concurrent processes cannot corrupt the store or
//! lose each other's entries. Only peers in this set may complete a
//! handshake.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::IdentityError;

const STORE_VERSION: u32 = 1;
const LOCK_ATTEMPTS: u32 = 8;
const LOCK_BACKOFF_BASE_MS: u64 = 25;

/// A peer allowed to complete a handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPeer {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub added_at_iso: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    peers: Vec<TrustedPeer>,
}

/// The process-wide trust set, backed by `mesh/trusted-peers.json`.
pub struct TrustStore {
    path: PathBuf,
    lock_path: PathBuf,
    peers: RwLock<HashMap<String, TrustedPeer>>,
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    // SAFETY: fd comes from an open File that outlives this call;
    // LOCK_EX | LOCK_NB is a valid flock operation.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_lock_exclusive(_: &File) -> std::io::Result<bool> {
    Ok(true)
}

/// Holds the advisory lock for the duration of a store mutation.
struct StoreLock {
    _file: File,
}

fn acquire_lock(lock_path: &Path) -> Result<StoreLock, IdentityError> {
    let file = File::create(lock_path)?;
    for attempt in 0..LOCK_ATTEMPTS {
        if try_lock_exclusive(&file)? {
            return Ok(StoreLock { _file: file });
        }
        let backoff = LOCK_BACKOFF_BASE_MS * (1 << attempt);
        let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
        std::thread::sleep(Duration::from_millis(backoff + jitter));
    }
    Err(IdentityError::LockUnavailable {
        path: lock_path.display().to_string(),
        reason: format!("still held after {LOCK_ATTEMPTS} attempts"),
    })
}

impl TrustStore {
    /// Open the store at `path`, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("json.lock");
        let store = Self {
            peers: RwLock::new(Self::read_file(&path)?),
            path,
            lock_path,
        };
        Ok(store)
    }

    fn read_file(path: &Path) -> Result<HashMap<String, TrustedPeer>, IdentityError> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(path)?;
        let file: StoreFile = serde_json::from_str(&contents)?;
        Ok(file
            .peers
            .into_iter()
            .map(|p| (p.device_id.clone(), p))
            .collect())
    }

    fn write_file(path: &Path, peers: &HashMap<String, TrustedPeer>) -> Result<(), IdentityError> {
        let mut entries: Vec<TrustedPeer> = peers.values().cloned().collect();
        entries.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        let file = StoreFile {
            version: STORE_VERSION,
            peers: entries,
        };
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

    /// Run a mutation under the file lock, merged against the on-disk
    /// state so concurrent processes do not lose entries.
    fn mutate<R>(
        &self,
        apply: impl FnOnce(&mut HashMap<String, TrustedPeer>) -> R,
    ) -> Result<R, IdentityError> {
        let _lock = acquire_lock(&self.lock_path)?;
        let mut on_disk = Self::read_file(&self.path)?;
        let result = apply(&mut on_disk);
        Self::write_file(&self.path, &on_disk)?;
        let mut cache = self.peers.write().unwrap_or_else(|e| e.into_inner());
        *cache = on_disk;
        Ok(result)
    }

    /// Add a peer to the trust set. Idempotent by `deviceId`: a re-add
    /// updates the name and key but keeps the original `addedAtIso`.
    /// Returns `true` when the peer was not previously present.
    pub fn add(
        &self,
        device_id: impl Into<String>,
        display_name: Option<String>,
        public_key: Option<String>,
    ) -> Result<bool, IdentityError> {
        let device_id = device_id.into();
        let added = self.mutate(|peers| match peers.get_mut(&device_id) {
            Some(existing) => {
                if display_name.is_some() {
                    existing.display_name = display_name.clone();
                }
                if public_key.is_some() {
                    existing.public_key = public_key.clone();
                }
                false
            }
            None => {
                peers.insert(
                    device_id.clone(),
                    TrustedPeer {
                        device_id: device_id.clone(),
                        display_name: display_name.clone(),
                        public_key: public_key.clone(),
                        added_at_iso: Utc::now(),
                    },
                );
                true
            }
        })?;
        debug!(device_id = %device_id, added, "trust store add");
        Ok(added)
    }

    /// Remove a peer. Returns `false` when it was not present.
    pub fn remove(&self, device_id: &str) -> Result<bool, IdentityError> {
        let removed = self.mutate(|peers| peers.remove(device_id).is_some())?;
        debug!(device_id, removed, "trust store remove");
        Ok(removed)
    }

    /// Whether a peer may complete a handshake right now.
    pub fn contains(&self, device_id: &str) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(device_id)
    }

    /// Snapshot of a single entry.
    pub fn get(&self, device_id: &str) -> Option<TrustedPeer> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    /// Snapshot of all entries, sorted by `deviceId`.
    pub fn list(&self) -> Vec<TrustedPeer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<TrustedPeer> = peers.values().cloned().collect();
        entries.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> TrustStore {
        TrustStore::open(dir.path().join("mesh").join("trusted-peers.json")).unwrap()
    }

    #[test]
    fn test_add_contains_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(store.add("dev-a", Some("barn".into()), None).unwrap());
        assert!(store.contains("dev-a"));
        assert_eq!(store.get("dev-a").unwrap().display_name.as_deref(), Some("barn"));

        assert!(store.remove("dev-a").unwrap());
        assert!(!store.contains("dev-a"));
        assert!(!store.remove("dev-a").unwrap());
    }

    #[test]
    fn test_re_add_is_idempotent_and_keeps_added_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.add("dev-a", None, None).unwrap();
        let first = store.get("dev-a").unwrap().added_at_iso;
        assert!(!store.add("dev-a", Some("renamed".into()), None).unwrap());
        let entry = store.get("dev-a").unwrap();
        assert_eq!(entry.added_at_iso, first);
        assert_eq!(entry.display_name.as_deref(), Some("renamed"));
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trusted-peers.json");

        let store = TrustStore::open(&path).unwrap();
        store.add("dev-a", None, Some("aabb".into())).unwrap();
        drop(store);

        let reopened = TrustStore::open(&path).unwrap();
        assert!(reopened.contains("dev-a"));
        assert_eq!(reopened.get("dev-a").unwrap().public_key.as_deref(), Some("aabb"));
    }

    #[test]
    fn test_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trusted-peers.json");
        let store = TrustStore::open(&path).unwrap();
        store.add("dev-b", None, None).unwrap();
        store.add("dev-a", None, None).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["peers"][0]["deviceId"], "dev-a");
        assert_eq!(raw["peers"][1]["deviceId"], "dev-b");
    }

    #[test]
    fn test_concurrent_adds_do_not_lose_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trusted-peers.json");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = TrustStore::open(&path).unwrap();
                    store.add(format!("dev-{i}"), None, None).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = TrustStore::open(&path).unwrap();
        assert_eq!(store.list().len(), 8);
    }
}
