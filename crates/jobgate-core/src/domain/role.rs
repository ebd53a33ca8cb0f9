//! Roles and the actors that act under them.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::RoleId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    /// Unique across the registry (e.g. `sales_admin`).
    pub code: String,
}

/// Opaque caller identity supplied by the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An actor holds exactly one role. Multi-role semantics are undecided and
/// deliberately not modelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub role_id: RoleId,
}

impl Actor {
    pub fn new(id: impl Into<String>, role_id: RoleId) -> Self {
        Self {
            id: ActorId::new(id),
            role_id,
        }
    }
}
