//! Domain model (IDs, actions, roles, job specs, task states, artifacts).

pub mod action;
pub mod artifact;
pub mod errors;
pub mod ids;
pub mod job;
pub mod role;
pub mod state;

pub use self::action::{Action, ActionSet};
pub use self::artifact::{Artifact, ArtifactMeta, ArtifactOutput, ArtifactRef};
pub use self::errors::{PermissionDenied, WorkerFailure};
pub use self::ids::{ArtifactId, IdParseError, NodeId, RoleId, TaskId, WorkerId};
pub use self::job::JobSpec;
pub use self::role::{Actor, ActorId, Role};
pub use self::state::TaskStatus;
