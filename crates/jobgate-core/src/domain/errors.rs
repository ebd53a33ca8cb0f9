//! Errors - 複数のコンポーネントで共有するエラー値
//!
//! Component-specific errors live next to their component (`TreeError` in
//! `tree`, `TransitionError` in `registry`, ...). This module only holds the
//! values that cross component boundaries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::action::Action;
use super::ids::{NodeId, RoleId};

/// The caller's role lacks the exact (node, action) binding.
///
/// Always surfaced to the caller, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("permission denied: {role_id} may not {action} on {node_id}")]
pub struct PermissionDenied {
    pub role_id: RoleId,
    pub node_id: NodeId,
    pub action: Action,
}

/// Job-specific failure recorded in `Task.error`.
///
/// `code` is short and machine-readable (`orphaned`, `job_panicked`, ...),
/// `message` is for humans. Terminal: a new submit is needed to retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct WorkerFailure {
    pub code: String,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Failure codes produced by the runtime itself (handlers choose their own).
pub mod codes {
    pub const ORPHANED: &str = "orphaned";
    pub const JOB_PANICKED: &str = "job_panicked";
    pub const UNKNOWN_JOB_TYPE: &str = "unknown_job_type";
    pub const INVALID_PARAMS: &str = "invalid_params";
    pub const ARTIFACT_WRITE: &str = "artifact_write";
    pub const INVALID_PROGRESS: &str = "invalid_progress";
}
