//! What a running job can see and do.

use std::sync::Arc;

use thiserror::Error;

use crate::domain::errors::codes;
use crate::domain::{TaskId, WorkerFailure};
use crate::ports::Clock;
use crate::registry::{CancelToken, ClaimTicket, TaskRegistry, TransitionError};

/// How a job ends when it does not produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job stopped because cancellation was requested.
    #[error("job cancelled")]
    Cancelled,

    /// The job cannot succeed; recorded in `Task.error`.
    #[error(transparent)]
    Failed(WorkerFailure),

    /// The task was taken back from this worker. Nothing more may be written.
    #[error("claim lost: {0}")]
    ClaimLost(TransitionError),
}

impl JobError {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        JobError::Failed(WorkerFailure::new(code, message))
    }
}

impl From<WorkerFailure> for JobError {
    fn from(failure: WorkerFailure) -> Self {
        JobError::Failed(failure)
    }
}

impl From<TransitionError> for JobError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::ProgressRegressed { .. } | TransitionError::ProgressOutOfRange { .. } => {
                JobError::failed(codes::INVALID_PROGRESS, err.to_string())
            }
            other => JobError::ClaimLost(other),
        }
    }
}

/// Handle given to a job for the duration of one claim.
#[derive(Clone)]
pub struct JobContext {
    ticket: ClaimTicket,
    cancel: CancelToken,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
}

impl JobContext {
    pub(crate) fn new(
        ticket: ClaimTicket,
        cancel: CancelToken,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ticket,
            cancel,
            registry,
            clock,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.ticket.task_id
    }

    /// Record progress (0..=100, never decreasing). Also refreshes the
    /// heartbeat.
    pub fn report_progress(&self, progress: u8) -> Result<(), JobError> {
        self.registry
            .report_progress(&self.ticket, progress, self.clock.now())?;
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point: `Err(JobError::Cancelled)` once cancellation was requested.
    ///
    /// ```ignore
    /// for chunk in rows.chunks(500) {
    ///     ctx.checkpoint()?;
    ///     write(chunk);
    /// }
    /// ```
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }
}
