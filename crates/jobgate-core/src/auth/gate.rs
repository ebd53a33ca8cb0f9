//! AuthGate - allow/deny for (role, node, action).
//!
//! The lookup is the exact node only. There is no walk to ancestors, so the
//! check is a single map read, and every node a role may touch needs its own
//! binding.

use tracing::debug;

use super::permission_store::PermissionStore;
use crate::domain::{Action, ActionSet, NodeId, PermissionDenied, RoleId};

#[derive(Default)]
pub struct AuthGate {
    store: PermissionStore,
}

impl AuthGate {
    pub fn new(store: PermissionStore) -> Self {
        Self { store }
    }

    pub fn check(&self, role_id: RoleId, node_id: NodeId, action: Action) -> bool {
        self.store.actions_for(role_id, node_id).contains(action)
    }

    /// The primitive every API boundary calls before doing work.
    pub fn require(&self, role_id: RoleId, node_id: NodeId, action: Action) -> Result<(), PermissionDenied> {
        if self.check(role_id, node_id, action) {
            return Ok(());
        }
        debug!(role_id = %role_id, node_id = %node_id, %action, "permission denied");
        Err(PermissionDenied {
            role_id,
            node_id,
            action,
        })
    }

    pub fn grant(&self, role_id: RoleId, node_id: NodeId, actions: ActionSet) -> ActionSet {
        self.store.grant(role_id, node_id, actions)
    }

    pub fn revoke(&self, role_id: RoleId, node_id: NodeId) -> ActionSet {
        self.store.revoke(role_id, node_id)
    }

    pub fn actions_for(&self, role_id: RoleId, node_id: NodeId) -> ActionSet {
        self.store.actions_for(role_id, node_id)
    }

    /// Nodes on which `role_id` holds `action` (e.g. the menu it may view).
    pub fn nodes_with(&self, role_id: RoleId, action: Action) -> Vec<NodeId> {
        self.store
            .bindings_for_role(role_id)
            .into_iter()
            .filter(|(_, actions)| actions.contains(action))
            .map(|(node, _)| node)
            .collect()
    }

    pub fn references_node(&self, node_id: NodeId) -> bool {
        self.store.references_node(node_id)
    }

    pub fn references_role(&self, role_id: RoleId) -> bool {
        self.store.references_role(role_id)
    }

    pub fn binding_count(&self) -> usize {
        self.store.len()
    }
}
