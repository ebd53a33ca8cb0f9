//! RoleRegistry - role rows with a unique `code`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::domain::{Role, RoleId};
use crate::ports::IdGenerator;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoleError {
    #[error("role code '{0}' is already taken")]
    DuplicateCode(String),

    #[error("{0} not found")]
    RoleNotFound(RoleId),

    #[error("{0} is still referenced by permission bindings")]
    HasDependents(RoleId),
}

#[derive(Default)]
struct Roles {
    by_id: HashMap<RoleId, Role>,
    by_code: HashMap<String, RoleId>,
}

pub struct RoleRegistry {
    ids: Arc<dyn IdGenerator>,
    roles: RwLock<Roles>,
}

impl RoleRegistry {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            ids,
            roles: RwLock::new(Roles::default()),
        }
    }

    pub fn create(&self, name: impl Into<String>, code: impl Into<String>) -> Result<RoleId, RoleError> {
        let code = code.into();
        let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
        if roles.by_code.contains_key(&code) {
            return Err(RoleError::DuplicateCode(code));
        }

        let id = self.ids.generate_role_id();
        roles.by_code.insert(code.clone(), id);
        roles.by_id.insert(
            id,
            Role {
                id,
                name: name.into(),
                code,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: RoleId) -> Option<Role> {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: RoleId) -> bool {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .contains_key(&id)
    }

    pub fn find_by_code(&self, code: &str) -> Option<Role> {
        let roles = self.roles.read().unwrap_or_else(PoisonError::into_inner);
        roles.by_code.get(code).and_then(|id| roles.by_id.get(id)).cloned()
    }

    /// All roles ordered by code.
    pub fn list(&self) -> Vec<Role> {
        let roles = self.roles.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Role> = roles.by_id.values().cloned().collect();
        out.sort_by(|a, b| a.code.cmp(&b.code));
        out
    }

    /// Run `f` under the read lock with `id` known to exist, so a concurrent
    /// `remove` cannot slip between the check and the bind.
    pub fn guarded<R>(&self, id: RoleId, f: impl FnOnce() -> R) -> Result<R, RoleError> {
        let roles = self.roles.read().unwrap_or_else(PoisonError::into_inner);
        if !roles.by_id.contains_key(&id) {
            return Err(RoleError::RoleNotFound(id));
        }
        let out = f();
        drop(roles);
        Ok(out)
    }

    /// Remove a role nothing references. `is_referenced` runs under the
    /// registry's write lock.
    pub fn remove(&self, id: RoleId, is_referenced: impl Fn(RoleId) -> bool) -> Result<Role, RoleError> {
        let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
        if !roles.by_id.contains_key(&id) {
            return Err(RoleError::RoleNotFound(id));
        }
        if is_referenced(id) {
            return Err(RoleError::HasDependents(id));
        }
        let role = roles.by_id.remove(&id).ok_or(RoleError::RoleNotFound(id))?;
        roles.by_code.remove(&role.code);
        Ok(role)
    }
}
