//! Job request as submitted by a caller.

use serde::{Deserialize, Serialize};

use super::action::Action;
use super::ids::NodeId;

/// What to run and which permission gates it.
///
/// `target` + `action` is the binding the submitting role must hold.
/// `params` is opaque to the core and decoded by the job's handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    pub target: NodeId,
    pub action: Action,
    pub params: serde_json::Value,
}

impl JobSpec {
    pub fn new(
        job_type: impl Into<String>,
        target: NodeId,
        action: Action,
        params: serde_json::Value,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            target,
            action,
            params,
        }
    }
}
