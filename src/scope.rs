use crate::error::ContextError;
use std::collections::HashSet;

pub const GLOBAL_SCOPE: &str = "global";
const NODE_SEPARATOR: char = ':';
const MAX_IDENTIFIER_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Global,
    /// Shared by every node of one flow.
    Flow,
    /// Private to one node instance, named `<nodeId>:<flowId>`.
    Node,
}

/// A validated scope name within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeName {
    name: String,
    kind: ScopeKind,
}

impl ScopeName {
    pub fn parse(raw: &str) -> Result<Self, ContextError> {
        if raw == GLOBAL_SCOPE {
            return Ok(Self::global());
        }
        let kind = match raw.split_once(NODE_SEPARATOR) {
            Some((node_id, flow_id)) => {
                validate_identifier(raw, node_id, "node id")?;
                validate_identifier(raw, flow_id, "flow id")?;
                ScopeKind::Node
            }
            None => {
                validate_identifier(raw, raw, "flow id")?;
                ScopeKind::Flow
            }
        };
        Ok(Self {
            name: raw.to_string(),
            kind,
        })
    }

    pub fn global() -> Self {
        Self {
            name: GLOBAL_SCOPE.to_string(),
            kind: ScopeKind::Global,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn is_global(&self) -> bool {
        self.kind == ScopeKind::Global
    }

    pub fn node_id(&self) -> Option<&str> {
        match self.kind {
            ScopeKind::Node => self.name.split_once(NODE_SEPARATOR).map(|(node, _)| node),
            _ => None,
        }
    }

    pub fn flow_id(&self) -> Option<&str> {
        match self.kind {
            ScopeKind::Global => None,
            ScopeKind::Flow => Some(&self.name),
            ScopeKind::Node => self.name.split_once(NODE_SEPARATOR).map(|(_, flow)| flow),
        }
    }

    /// Identifier that keeps this scope alive across a clean sweep. `global`
    /// has none because it is never swept.
    pub fn liveness_key(&self) -> Option<&str> {
        match self.kind {
            ScopeKind::Global => None,
            ScopeKind::Flow => Some(&self.name),
            ScopeKind::Node => self.node_id(),
        }
    }

    pub fn is_stale(&self, live_ids: &HashSet<&str>) -> bool {
        match self.liveness_key() {
            Some(key) => !live_ids.contains(key),
            None => false,
        }
    }
}

impl std::fmt::Display for ScopeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

fn validate_identifier(scope: &str, value: &str, name: &str) -> Result<(), ContextError> {
    let invalid = |reason: String| ContextError::InvalidScope {
        scope: scope.to_string(),
        reason,
    };
    if value.is_empty() {
        return Err(invalid(format!("{name} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid(format!("{name} must be <= {MAX_IDENTIFIER_LEN} bytes")));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(invalid(format!("{name} must contain only [A-Za-z0-9_.-]")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ScopeKind, ScopeName};
    use std::collections::HashSet;

    #[test]
    fn parses_three_scope_shapes() {
        let global = ScopeName::parse("global").expect("global");
        assert_eq!(global.kind(), ScopeKind::Global);
        assert_eq!(global.liveness_key(), None);

        let flow = ScopeName::parse("flow-1").expect("flow");
        assert_eq!(flow.kind(), ScopeKind::Flow);
        assert_eq!(flow.flow_id(), Some("flow-1"));
        assert_eq!(flow.liveness_key(), Some("flow-1"));

        let node = ScopeName::parse("node-1:flow-1").expect("node");
        assert_eq!(node.kind(), ScopeKind::Node);
        assert_eq!(node.node_id(), Some("node-1"));
        assert_eq!(node.flow_id(), Some("flow-1"));
        assert_eq!(node.liveness_key(), Some("node-1"));
    }

    #[test]
    fn rejects_malformed_names() {
        for raw in ["", ":flow", "node:", "a:b:c", "has space", "slash/flow", "q?"] {
            let err = ScopeName::parse(raw).expect_err(raw);
            assert_eq!(err.code_str(), "invalid_scope", "{raw}");
        }
        let long = "f".repeat(129);
        assert!(ScopeName::parse(&long).is_err());
    }

    #[test]
    fn staleness_follows_liveness_key() {
        let live: HashSet<&str> = ["node-3"].into_iter().collect();
        assert!(!ScopeName::global().is_stale(&live));
        assert!(ScopeName::parse("flow-2").expect("flow").is_stale(&live));
        assert!(ScopeName::parse("node-1:flow-1").expect("node").is_stale(&live));
        assert!(!ScopeName::parse("node-3:flow-2").expect("node").is_stale(&live));

        let with_flow: HashSet<&str> = ["flow-2"].into_iter().collect();
        assert!(!ScopeName::parse("flow-2").expect("flow").is_stale(&with_flow));
        assert!(!ScopeName::global().is_stale(&HashSet::new()));
    }
}
