//! Claim tickets and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};

use crate::domain::{JobSpec, TaskId, WorkerId};

/// Proof that a worker holds a task. Every worker write presents one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimTicket {
    pub task_id: TaskId,
    pub worker: WorkerId,
    pub epoch: u64,
}

/// Shared cancellation flag. Setting it is a request; the worker decides when
/// it is safe to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// What a successful claim hands to the worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub ticket: ClaimTicket,
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
    pub cancel: CancelToken,
}

impl ClaimedTask {
    /// Artifacts expire `ttl` after the task was created. Saturates at the
    /// latest representable instant.
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
