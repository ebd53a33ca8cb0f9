//! Auth - roles, per-node permission bindings and the gate every API call
//! goes through.
//!
//! Bindings are exact: a grant on a parent menu node says nothing about its
//! children. `AuthGate` never walks the tree.

pub mod gate;
pub mod permission_store;
pub mod role;

pub use self::gate::AuthGate;
pub use self::permission_store::PermissionStore;
pub use self::role::{RoleError, RoleRegistry};
