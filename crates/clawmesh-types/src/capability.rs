//! Capability strings.
//!
//! A capability is an opaque string of the form `type:name[:scope]`
//! advertised by a node. Routing matches capabilities literally, with
//! no wildcards and no type coercion: `skill:telegram` never satisfies
//! a `channel:telegram` lookup.

use serde::{Deserialize, Serialize};

/// Capability types with reserved meaning in the fabric.
pub const RESERVED_TYPES: &[&str] = &[
    "channel", "skill", "sensor", "actuator", "vision", "planner", "task",
];

/// A parsed capability: `type:name[:scope]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub kind: String,
    pub name: String,
    pub scope: Option<String>,
}

impl Capability {
    /// Parse a capability string. Returns `None` when the type or name
    /// segment is empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let kind = parts.next()?.to_string();
        let name = parts.next()?.to_string();
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        let scope = parts.next().filter(|s| !s.is_empty()).map(String::from);
        Some(Self { kind, name, scope })
    }

    /// Whether the type segment is one of the reserved types.
    pub fn is_reserved_type(&self) -> bool {
        RESERVED_TYPES.contains(&self.kind.as_str())
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}:{}", self.kind, self.name, scope),
            None => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

/// The capability string a node must advertise to serve a named channel.
pub fn channel_capability(name: &str) -> String {
    format!("channel:{name}")
}

/// The capability string a node must advertise to serve a named skill.
pub fn skill_capability(name: &str) -> String {
    format!("skill:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_segments() {
        let cap = Capability::parse("channel:telegram").unwrap();
        assert_eq!(cap.kind, "channel");
        assert_eq!(cap.name, "telegram");
        assert!(cap.scope.is_none());
        assert!(cap.is_reserved_type());
    }

    #[test]
    fn test_parse_with_scope() {
        let cap = Capability::parse("actuator:mock:valve-1").unwrap();
        assert_eq!(cap.scope.as_deref(), Some("valve-1"));
        assert_eq!(cap.to_string(), "actuator:mock:valve-1");
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(Capability::parse("channel:").is_none());
        assert!(Capability::parse(":telegram").is_none());
        assert!(Capability::parse("bare").is_none());
    }

    #[test]
    fn test_unreserved_type_parses() {
        let cap = Capability::parse("custom:thing").unwrap();
        assert!(!cap.is_reserved_type());
    }

    #[test]
    fn test_builders() {
        assert_eq!(channel_capability("telegram"), "channel:telegram");
        assert_eq!(skill_capability("summarize"), "skill:summarize");
    }
}
