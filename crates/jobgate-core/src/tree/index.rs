//! TreeIndex - arena of nodes with parent ids and ordered child lists.
//!
//! Design:
//! - `slots[id]` holds the node; deleted ids stay `None` forever (no reuse).
//! - Each slot keeps its children sorted by `(sort_order, id)`. Ids grow with
//!   insertion, so ties fall back to insertion order.
//! - Invariant: `parent_id` and the parent's child list are kept in sync, and
//!   the parent graph is acyclic.
//! - One `RwLock` around the arena: every mutation happens under the write
//!   lock, so readers never see a half-moved node.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use super::node::{NewNode, TreeNode};
use crate::domain::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("{0} not found")]
    NodeNotFound(NodeId),

    #[error("parent {0} not found")]
    ParentNotFound(NodeId),

    #[error("{node} still has dependents (children={children}, referenced={referenced})")]
    HasDependents {
        node: NodeId,
        children: usize,
        referenced: bool,
    },

    #[error("moving {node} under {new_parent} would create a cycle")]
    CycleDetected { node: NodeId, new_parent: NodeId },

    #[error("path of {0} does not terminate")]
    PathDoesNotTerminate(NodeId),

    #[error("node arena exhausted")]
    CapacityExhausted,
}

struct Slot<P> {
    node: TreeNode<P>,
    children: Vec<NodeId>,
}

struct Arena<P> {
    slots: Vec<Option<Slot<P>>>,
    roots: Vec<NodeId>,
    live: usize,
}

impl<P> Arena<P> {
    fn slot(&self, id: NodeId) -> Option<&Slot<P>> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut Slot<P>> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn sort_key(&self, id: NodeId) -> (i32, NodeId) {
        let order = self.slot(id).map(|s| s.node.sort_order).unwrap_or(i32::MAX);
        (order, id)
    }

    /// Mutable sibling list that `id` lives in (or would live in).
    fn siblings_mut(&mut self, parent: Option<NodeId>) -> Option<&mut Vec<NodeId>> {
        match parent {
            None => Some(&mut self.roots),
            Some(p) => self.slot_mut(p).map(|s| &mut s.children),
        }
    }

    fn attach(&mut self, parent: Option<NodeId>, id: NodeId) {
        let key = self.sort_key(id);
        let keys: Vec<(i32, NodeId)> = match parent {
            None => self.roots.iter().map(|c| self.sort_key(*c)).collect(),
            Some(p) => self
                .slot(p)
                .map(|s| s.children.iter().map(|c| self.sort_key(*c)).collect())
                .unwrap_or_default(),
        };
        let at = keys.partition_point(|k| *k < key);
        if let Some(list) = self.siblings_mut(parent) {
            list.insert(at, id);
        }
    }

    fn detach(&mut self, parent: Option<NodeId>, id: NodeId) {
        if let Some(list) = self.siblings_mut(parent) {
            list.retain(|c| *c != id);
        }
    }

    /// Pre-order walk of everything below `id` (excluding `id`).
    fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = match self.slot(id) {
            Some(slot) => slot.children.iter().rev().copied().collect(),
            None => return out,
        };
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(slot) = self.slot(next) {
                stack.extend(slot.children.iter().rev().copied());
            }
        }
        out
    }
}

pub struct TreeIndex<P> {
    arena: RwLock<Arena<P>>,
}

impl<P> Default for TreeIndex<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> TreeIndex<P> {
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Arena {
                slots: Vec::new(),
                roots: Vec::new(),
                live: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Arena<P>> {
        self.arena.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arena<P>> {
        self.arena.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.read().slot(id).is_some()
    }

    /// Insert under `parent` (or as a root when `None`).
    pub fn insert(&self, parent: Option<NodeId>, new: NewNode<P>) -> Result<NodeId, TreeError> {
        let mut arena = self.write();
        if let Some(p) = parent
            && arena.slot(p).is_none()
        {
            return Err(TreeError::ParentNotFound(p));
        }

        let index = u32::try_from(arena.slots.len()).map_err(|_| TreeError::CapacityExhausted)?;
        let id = NodeId::new(index);
        arena.slots.push(Some(Slot {
            node: TreeNode {
                id,
                parent_id: parent,
                name: new.name,
                sort_order: new.sort_order,
                data: new.data,
            },
            children: Vec::new(),
        }));
        arena.live += 1;
        arena.attach(parent, id);
        Ok(id)
    }

    pub fn roots(&self) -> Vec<NodeId> {
        self.read().roots.clone()
    }

    /// Children ordered by `sort_order`, ties by insertion order.
    pub fn children_of(&self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        self.read()
            .slot(id)
            .map(|s| s.children.clone())
            .ok_or(TreeError::NodeNotFound(id))
    }

    pub fn descendants_of(&self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        let arena = self.read();
        if arena.slot(id).is_none() {
            return Err(TreeError::NodeNotFound(id));
        }
        Ok(arena.descendants(id))
    }

    /// Root-to-node path, `id` last.
    ///
    /// The walk is bounded by the live node count, so even a corrupted parent
    /// graph cannot make it spin.
    pub fn path_of(&self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        let arena = self.read();
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            if path.len() > arena.live {
                return Err(TreeError::PathDoesNotTerminate(id));
            }
            let slot = arena.slot(node_id).ok_or(TreeError::NodeNotFound(node_id))?;
            path.push(node_id);
            current = slot.node.parent_id;
        }
        path.reverse();
        Ok(path)
    }

    /// Re-parent `id` under `new_parent` (`None` makes it a root).
    ///
    /// Fails with `CycleDetected` when `new_parent` is `id` or sits anywhere in
    /// its subtree.
    pub fn move_node(&self, id: NodeId, new_parent: Option<NodeId>) -> Result<(), TreeError> {
        let mut arena = self.write();
        let old_parent = arena
            .slot(id)
            .map(|s| s.node.parent_id)
            .ok_or(TreeError::NodeNotFound(id))?;

        if let Some(p) = new_parent {
            if arena.slot(p).is_none() {
                return Err(TreeError::ParentNotFound(p));
            }
            if p == id || arena.descendants(id).contains(&p) {
                return Err(TreeError::CycleDetected {
                    node: id,
                    new_parent: p,
                });
            }
        }

        if old_parent == new_parent {
            return Ok(());
        }

        arena.detach(old_parent, id);
        if let Some(slot) = arena.slot_mut(id) {
            slot.node.parent_id = new_parent;
        }
        arena.attach(new_parent, id);
        Ok(())
    }

    /// Delete a leaf that nothing else references.
    ///
    /// `is_referenced` is the external owner check (e.g. permission bindings).
    /// It runs under the tree's write lock.
    pub fn delete(
        &self,
        id: NodeId,
        is_referenced: impl Fn(NodeId) -> bool,
    ) -> Result<TreeNode<P>, TreeError> {
        let mut arena = self.write();
        let slot = arena.slot(id).ok_or(TreeError::NodeNotFound(id))?;
        let children = slot.children.len();
        let referenced = is_referenced(id);
        if children > 0 || referenced {
            return Err(TreeError::HasDependents {
                node: id,
                children,
                referenced,
            });
        }

        let parent = slot.node.parent_id;
        arena.detach(parent, id);
        arena.live -= 1;
        arena.slots[id.index()]
            .take()
            .map(|s| s.node)
            .ok_or(TreeError::NodeNotFound(id))
    }

    pub fn rename(&self, id: NodeId, name: impl Into<String>) -> Result<(), TreeError> {
        let mut arena = self.write();
        let slot = arena.slot_mut(id).ok_or(TreeError::NodeNotFound(id))?;
        slot.node.name = name.into();
        Ok(())
    }

    pub fn set_sort_order(&self, id: NodeId, sort_order: i32) -> Result<(), TreeError> {
        let mut arena = self.write();
        let slot = arena.slot_mut(id).ok_or(TreeError::NodeNotFound(id))?;
        slot.node.sort_order = sort_order;
        let parent = slot.node.parent_id;
        arena.detach(parent, id);
        arena.attach(parent, id);
        Ok(())
    }

    /// Run `f` while holding the read lock with `id` known to exist.
    ///
    /// Used to make "node exists, then bind to it" atomic against `delete`.
    pub fn guarded<R>(&self, id: NodeId, f: impl FnOnce() -> R) -> Result<R, TreeError> {
        let arena = self.read();
        if arena.slot(id).is_none() {
            return Err(TreeError::NodeNotFound(id));
        }
        let out = f();
        drop(arena);
        Ok(out)
    }

    /// Sanity check used by tests: every path terminates without repeats and
    /// every child list agrees with its children's `parent_id`.
    pub fn check_invariants(&self) -> Result<(), TreeError> {
        let ids: Vec<NodeId> = {
            let arena = self.read();
            arena.slots.iter().flatten().map(|s| s.node.id).collect()
        };
        for id in ids {
            let path = self.path_of(id)?;
            let unique: HashSet<_> = path.iter().collect();
            if unique.len() != path.len() {
                return Err(TreeError::PathDoesNotTerminate(id));
            }
        }
        Ok(())
    }
}

impl<P: Clone> TreeIndex<P> {
    pub fn get(&self, id: NodeId) -> Option<TreeNode<P>> {
        self.read().slot(id).map(|s| s.node.clone())
    }
}
