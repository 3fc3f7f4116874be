//! Channel routing: local-first, peer-fallback.

use clawmesh_types::capability::channel_capability;

use crate::registry::CapabilityRegistry;

/// Where a channel dispatch should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The local node serves this channel itself.
    Local,
    /// Forward to the named peer.
    Mesh(String),
    /// Nobody connected serves it.
    Unavailable,
}

/// Resolve where to send traffic for a named channel.
///
/// Local availability always wins over mesh. Among peers, the tie-break
/// is ascending `deviceId`, which is stable across identical registry
/// snapshots.
pub fn resolve_route(channel: &str, registry: &CapabilityRegistry, local_caps: &[String]) -> Route {
    let wanted = channel_capability(channel);
    if local_caps.iter().any(|cap| cap == &wanted) {
        return Route::Local;
    }
    match registry.find_peer_with_channel(channel) {
        Some(device_id) => Route::Mesh(device_id),
        None => Route::Unavailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_first_beats_mesh() {
        let registry = CapabilityRegistry::new();
        registry.update_peer("dev-a", vec!["channel:telegram".into()]);
        let local = vec!["channel:telegram".to_string()];
        assert_eq!(resolve_route("telegram", &registry, &local), Route::Local);
    }

    #[test]
    fn test_mesh_fallback_stable_tiebreak() {
        let registry = CapabilityRegistry::new();
        registry.update_peer("dev-b", vec!["channel:telegram".into()]);
        registry.update_peer("dev-a", vec!["channel:telegram".into()]);
        assert_eq!(
            resolve_route("telegram", &registry, &[]),
            Route::Mesh("dev-a".to_string())
        );
        // Same snapshot, same answer.
        assert_eq!(
            resolve_route("telegram", &registry, &[]),
            Route::Mesh("dev-a".to_string())
        );
    }

    #[test]
    fn test_unavailable() {
        let registry = CapabilityRegistry::new();
        assert_eq!(resolve_route("telegram", &registry, &[]), Route::Unavailable);
    }

    #[test]
    fn test_skill_does_not_satisfy_channel() {
        let registry = CapabilityRegistry::new();
        registry.update_peer("dev-a", vec!["skill:telegram".into()]);
        let local = vec!["skill:telegram".to_string()];
        assert_eq!(resolve_route("telegram", &registry, &local), Route::Unavailable);
    }
}
