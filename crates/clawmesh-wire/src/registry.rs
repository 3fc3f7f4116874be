//! Capability registry.
//!
//! Maps `deviceId` to the set of capability strings that peer currently
//! advertises. Updates replace the set wholesale; a session ending
//! removes it. Lookups are literal string matches.

use std::collections::BTreeSet;

use dashmap::DashMap;

use clawmesh_types::capability::{channel_capability, skill_capability};

/// Per-peer advertised capabilities.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    peers: DashMap<String, BTreeSet<String>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a peer's capability set wholesale.
    pub fn update_peer(&self, device_id: impl Into<String>, capabilities: Vec<String>) {
        self.peers
            .insert(device_id.into(), capabilities.into_iter().collect());
    }

    /// Drop a peer's capabilities (session ended).
    pub fn remove_peer(&self, device_id: &str) {
        self.peers.remove(device_id);
    }

    /// Snapshot of one peer's capabilities.
    pub fn capabilities_of(&self, device_id: &str) -> Vec<String> {
        self.peers
            .get(device_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All peers advertising `capability`, ascending by `deviceId`.
    pub fn find_peers_with_capability(&self, capability: &str) -> Vec<String> {
        let mut matches: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| entry.value().contains(capability))
            .map(|entry| entry.key().clone())
            .collect();
        matches.sort();
        matches
    }

    /// The first peer (ascending `deviceId`) serving a named channel.
    pub fn find_peer_with_channel(&self, name: &str) -> Option<String> {
        self.find_peers_with_capability(&channel_capability(name))
            .into_iter()
            .next()
    }

    /// The first peer (ascending `deviceId`) serving a named skill.
    pub fn find_peer_with_skill(&self, name: &str) -> Option<String> {
        self.find_peers_with_capability(&skill_capability(name))
            .into_iter()
            .next()
    }

    /// Number of peers with a registered set.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_replaces_wholesale() {
        let registry = CapabilityRegistry::new();
        registry.update_peer("dev-a", vec!["channel:telegram".into(), "skill:sum".into()]);
        registry.update_peer("dev-a", vec!["sensor:soil".into()]);
        assert_eq!(registry.capabilities_of("dev-a"), vec!["sensor:soil"]);
    }

    #[test]
    fn test_remove_clears() {
        let registry = CapabilityRegistry::new();
        registry.update_peer("dev-a", vec!["channel:telegram".into()]);
        registry.remove_peer("dev-a");
        assert!(registry.capabilities_of("dev-a").is_empty());
        assert!(registry.find_peer_with_channel("telegram").is_none());
    }

    #[test]
    fn test_literal_match_no_type_coercion() {
        let registry = CapabilityRegistry::new();
        registry.update_peer("dev-a", vec!["skill:telegram".into()]);
        assert!(registry.find_peer_with_channel("telegram").is_none());
        assert_eq!(registry.find_peer_with_skill("telegram").as_deref(), Some("dev-a"));
    }

    #[test]
    fn test_lookup_orders_by_device_id() {
        let registry = CapabilityRegistry::new();
        registry.update_peer("dev-b", vec!["channel:telegram".into()]);
        registry.update_peer("dev-a", vec!["channel:telegram".into()]);
        registry.update_peer("dev-c", vec!["channel:telegram".into()]);

        assert_eq!(
            registry.find_peers_with_capability("channel:telegram"),
            vec!["dev-a", "dev-b", "dev-c"]
        );
        assert_eq!(registry.find_peer_with_channel("telegram").as_deref(), Some("dev-a"));
    }
}
