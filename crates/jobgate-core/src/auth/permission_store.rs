//! PermissionStore - (role, node) -> action set.
//!
//! At most one binding per pair: `grant` overwrites. Absence of a binding is
//! "no access", never "inherit from parent".

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::domain::{ActionSet, NodeId, RoleId};

#[derive(Default)]
pub struct PermissionStore {
    bindings: RwLock<HashMap<(RoleId, NodeId), ActionSet>>,
}

impl PermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the binding for `(role, node)`. An empty set removes it.
    /// Returns the previous action set.
    pub fn grant(&self, role_id: RoleId, node_id: NodeId, actions: ActionSet) -> ActionSet {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        let previous = if actions.is_empty() {
            bindings.remove(&(role_id, node_id))
        } else {
            bindings.insert((role_id, node_id), actions)
        };
        previous.unwrap_or_default()
    }

    pub fn revoke(&self, role_id: RoleId, node_id: NodeId) -> ActionSet {
        self.grant(role_id, node_id, ActionSet::empty())
    }

    pub fn actions_for(&self, role_id: RoleId, node_id: NodeId) -> ActionSet {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(role_id, node_id))
            .copied()
            .unwrap_or_default()
    }

    /// Every binding a role holds, ordered by node.
    pub fn bindings_for_role(&self, role_id: RoleId) -> Vec<(NodeId, ActionSet)> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(NodeId, ActionSet)> = bindings
            .iter()
            .filter(|((role, _), _)| *role == role_id)
            .map(|((_, node), actions)| (*node, *actions))
            .collect();
        out.sort_by_key(|(node, _)| *node);
        out
    }

    pub fn references_node(&self, node_id: NodeId) -> bool {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|(_, node)| *node == node_id)
    }

    pub fn references_role(&self, role_id: RoleId) -> bool {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|(role, _)| *role == role_id)
    }

    pub fn len(&self) -> usize {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
