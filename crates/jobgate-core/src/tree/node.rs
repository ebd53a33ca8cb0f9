//! Tree node records and the two payloads the runtime ships with.

use serde::{Deserialize, Serialize};

use crate::domain::NodeId;

/// A node as seen by readers. Children are not stored here; ask the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode<P> {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub sort_order: i32,
    pub data: P,
}

/// Insert payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode<P> {
    pub name: String,
    pub sort_order: i32,
    pub data: P,
}

impl<P> NewNode<P> {
    pub fn new(name: impl Into<String>, sort_order: i32, data: P) -> Self {
        Self {
            name: name.into(),
            sort_order,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuKind {
    Directory,
    Page,
    Button,
}

/// Menu tree payload. Permission bindings point at menu nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub route: String,
    pub kind: MenuKind,
}

impl MenuEntry {
    pub fn new(route: impl Into<String>, kind: MenuKind) -> Self {
        Self {
            route: route.into(),
            kind,
        }
    }
}

/// Org-chart payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub code: String,
}

impl Position {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}
