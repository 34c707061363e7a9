use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Per-conversation record of which (server, tool) pairs the user has
/// pre-authorized.
///
/// Grants only grow — there is no revoke — and disappear when the
/// conversation's scope is cleared. Nothing is ever persisted across
/// process restarts. Interior locking keeps concurrent conversations from
/// interfering; calls for a single conversation are serialized by the
/// caller (one active completion per conversation).
#[derive(Default)]
pub struct PermissionGate {
    scopes: RwLock<HashMap<String, HashSet<(String, String)>>>,
}

impl PermissionGate {
    pub fn is_allowed(&self, conversation_id: &str, server_name: &str, tool_name: &str) -> bool {
        let scopes = self
            .scopes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scopes
            .get(conversation_id)
            .is_some_and(|granted| {
                granted.contains(&(server_name.to_string(), tool_name.to_string()))
            })
    }

    /// Idempotent: granting an already-granted pair is a no-op.
    pub fn grant(&self, conversation_id: &str, server_name: &str, tool_name: &str) {
        let mut scopes = self
            .scopes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scopes
            .entry(conversation_id.to_string())
            .or_default()
            .insert((server_name.to_string(), tool_name.to_string()));
    }

    pub fn clear_conversation(&self, conversation_id: &str) {
        let mut scopes = self
            .scopes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scopes.remove(conversation_id);
    }
}
