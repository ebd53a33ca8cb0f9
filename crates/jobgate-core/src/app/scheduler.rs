//! TaskScheduler - 受付・取消・状態参照
//!
//! # 設計原則
//! - submit / cancel / get_status は同期関数。worker の空きを待たない
//! - 権限チェックは行を作る前に行う。拒否された submit は何も残さない
//! - キュー容量は先に確保する。飽和していたら行を作らずに `QueueSaturated`

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::status::TaskStatusView;
use crate::auth::AuthGate;
use crate::domain::{Actor, JobSpec, PermissionDenied, TaskId};
use crate::ports::{Clock, IdGenerator};
use crate::queue::{QueueFull, WorkQueue};
use crate::registry::{CancelOutcome, TaskRegistry, TransitionError};
use crate::typed::HandlerRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),

    #[error("no handler registered for job type '{0}'")]
    UnknownJobType(String),

    #[error("work queue is saturated (capacity {capacity}); retry later")]
    QueueSaturated { capacity: usize },

    #[error("{0} not found")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl SchedulerError {
    /// Only backpressure is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::QueueSaturated { .. })
    }
}

impl From<QueueFull> for SchedulerError {
    fn from(full: QueueFull) -> Self {
        SchedulerError::QueueSaturated {
            capacity: full.capacity,
        }
    }
}

pub struct TaskScheduler {
    gate: Arc<AuthGate>,
    registry: Arc<TaskRegistry>,
    queue: Arc<WorkQueue>,
    handlers: Arc<HandlerRegistry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl TaskScheduler {
    pub fn new(
        gate: Arc<AuthGate>,
        registry: Arc<TaskRegistry>,
        queue: Arc<WorkQueue>,
        handlers: Arc<HandlerRegistry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gate,
            registry,
            queue,
            handlers,
            ids,
            clock,
        }
    }

    /// Accept a job and return its id without waiting for execution.
    pub fn submit(&self, actor: &Actor, spec: JobSpec) -> Result<TaskId, SchedulerError> {
        self.gate.require(actor.role_id, spec.target, spec.action)?;
        if !self.handlers.contains(&spec.job_type) {
            return Err(SchedulerError::UnknownJobType(spec.job_type));
        }
        let permit = self.queue.try_reserve()?;

        let task_id = self.ids.generate_task_id();
        let job_type = spec.job_type.clone();
        self.registry
            .create(task_id, actor.id.clone(), spec, self.clock.now());
        permit.push(task_id);

        info!(task_id = %task_id, actor = %actor.id, %job_type, "task submitted");
        Ok(task_id)
    }

    /// Cancel on behalf of `actor`, who must hold the binding the task was
    /// submitted under.
    pub fn cancel(&self, actor: &Actor, task_id: TaskId) -> Result<CancelOutcome, SchedulerError> {
        let record = self
            .registry
            .get(task_id)
            .ok_or(SchedulerError::TaskNotFound(task_id))?;
        self.gate
            .require(actor.role_id, record.spec.target, record.spec.action)?;

        let outcome = self.registry.request_cancel(task_id, self.clock.now())?;
        if outcome == CancelOutcome::Cancelled {
            // A worker that already popped the id will lose the claim.
            let removed = self.queue.remove(task_id);
            debug!(task_id = %task_id, removed, "pending task dropped from queue");
        }
        info!(task_id = %task_id, actor = %actor.id, ?outcome, "cancel handled");
        Ok(outcome)
    }

    /// Pure read.
    pub fn get_status(&self, task_id: TaskId) -> Result<TaskStatusView, SchedulerError> {
        self.registry
            .get(task_id)
            .map(TaskStatusView::from)
            .ok_or(SchedulerError::TaskNotFound(task_id))
    }
}
