//! Task record: the row the registry keeps per task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ActorId, ArtifactRef, JobSpec, TaskId, TaskStatus, WorkerFailure, WorkerId};

/// Design:
/// - This is the "single source of truth" for task state.
/// - The work queue holds TaskId only.
/// - All state transitions go through `transition`, which rejects anything
///   `TaskStatus::can_transition_to` does not allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub spec: JobSpec,
    pub submitted_by: ActorId,
    pub status: TaskStatus,

    /// 0..=100, never decreases while Processing.
    pub progress: u8,

    /// Set only when Completed.
    pub result: Option<ArtifactRef>,

    /// Set only when Failed.
    pub error: Option<WorkerFailure>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,

    /// Last liveness signal from the claiming worker.
    pub heartbeat_at: Option<DateTime<Utc>>,

    pub claimed_by: Option<WorkerId>,

    /// Bumped on every claim; a worker's writes must present the epoch it
    /// claimed under.
    pub epoch: u64,

    /// Number of claims so far (including the current one if Processing).
    pub attempts: u32,

    pub cancel_requested: bool,

    /// Set by the artifact sweep. The row is kept so callers can still be
    /// told the download expired.
    pub purged_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: TaskId, spec: JobSpec, submitted_by: ActorId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            spec,
            submitted_by,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            expires_at: None,
            heartbeat_at: None,
            claimed_by: None,
            epoch: 0,
            attempts: 0,
            cancel_requested: false,
            purged_at: None,
        }
    }

    /// Validate and apply a status change. Returns the previous status.
    pub(super) fn transition(&mut self, to: TaskStatus) -> Result<TaskStatus, (TaskStatus, TaskStatus)> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err((from, to));
        }
        self.status = to;
        Ok(from)
    }

    /// Pending -> Processing for `worker`.
    pub(super) fn start_claim(&mut self, worker: WorkerId, now: DateTime<Utc>) {
        self.claimed_by = Some(worker);
        self.epoch += 1;
        self.attempts += 1;
        self.started_at = Some(now);
        self.heartbeat_at = Some(now);
    }

    /// Processing -> Pending after the claiming worker went silent.
    pub(super) fn release_claim(&mut self) {
        self.claimed_by = None;
        self.started_at = None;
        self.heartbeat_at = None;
        self.progress = 0;
    }

    pub(super) fn finish(&mut self, now: DateTime<Utc>) {
        self.claimed_by = None;
        self.finished_at = Some(now);
    }

    /// Time the reaper measures staleness from.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.heartbeat_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }
}
