//! Tree - arena-indexed hierarchy (menu tree, org chart)
//!
//! Nodes refer to each other by [`NodeId`](crate::domain::NodeId) only.
//! There are no object back-pointers anywhere in the crate.

pub mod index;
pub mod node;

pub use self::index::{TreeError, TreeIndex};
pub use self::node::{MenuEntry, MenuKind, NewNode, Position, TreeNode};

pub type MenuTree = TreeIndex<MenuEntry>;
pub type OrgChart = TreeIndex<Position>;
