//! TaskRegistry - process-wide table of task records.
//!
//! # ロック設計
//! - 外側の map は `RwLock<HashMap<TaskId, Arc<TaskSlot>>>`。slot を探す間だけ持つ
//! - 各 task は自分の `RwLock<TaskRecord>` を持つ。無関係な task 同士は直列化しない
//! - status のポーリングは read lock だけで完結する
//!
//! Worker writes (heartbeat / progress / complete / fail / cancel-ack) must
//! present the [`ClaimTicket`] they claimed under. Once the reaper takes a
//! task back, the old ticket is stale and every write with it is rejected.

mod claim;
mod record;

pub use self::claim::{CancelToken, ClaimTicket, ClaimedTask};
pub use self::record::TaskRecord;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::errors::codes;
use crate::domain::{ActorId, ArtifactRef, JobSpec, TaskId, TaskStatus, WorkerFailure, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{0} not found")]
    TaskNotFound(TaskId),

    #[error("illegal transition for {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("claim epoch {epoch} on {task_id} is no longer current")]
    StaleClaim { task_id: TaskId, epoch: u64 },

    #[error("{task_id} is {status}, not Processing")]
    NotProcessing { task_id: TaskId, status: TaskStatus },

    #[error("progress of {task_id} cannot go from {current} down to {requested}")]
    ProgressRegressed {
        task_id: TaskId,
        current: u8,
        requested: u8,
    },

    #[error("progress {requested} of {task_id} is outside 0..=100")]
    ProgressOutOfRange { task_id: TaskId, requested: u8 },
}

/// Result of `request_cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// Was Pending; now Cancelled and will never run.
    Cancelled,
    /// Was Processing; the worker has been asked to stop.
    CancellationRequested,
    /// Was already terminal; nothing changed.
    AlreadyTerminal(TaskStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapAction {
    Requeued,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapOutcome {
    pub task_id: TaskId,
    pub previous_worker: Option<WorkerId>,
    pub action: ReapAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct TaskSlot {
    record: RwLock<TaskRecord>,
    cancel: CancelToken,
}

impl TaskSlot {
    fn write(&self) -> RwLockWriteGuard<'_, TaskRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> TaskRecord {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Created once at startup and shared by `Arc`; never reset implicitly.
#[derive(Default)]
pub struct TaskRegistry {
    slots: RwLock<HashMap<TaskId, Arc<TaskSlot>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, task_id: TaskId) -> Result<Arc<TaskSlot>, TransitionError> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .cloned()
            .ok_or(TransitionError::TaskNotFound(task_id))
    }

    fn all_slots(&self) -> Vec<Arc<TaskSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Insert a new Pending row.
    pub fn create(
        &self,
        task_id: TaskId,
        submitted_by: ActorId,
        spec: JobSpec,
        now: DateTime<Utc>,
    ) -> TaskRecord {
        let record = TaskRecord::new(task_id, spec, submitted_by, now);
        let slot = Arc::new(TaskSlot {
            record: RwLock::new(record.clone()),
            cancel: CancelToken::new(),
        });
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id, slot);
        record
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.slot(task_id).ok().map(|slot| slot.snapshot())
    }

    pub fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.get(task_id).map(|r| r.status)
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for slot in self.all_slots() {
            match slot.snapshot().status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Compare-and-set Pending -> Processing.
    ///
    /// Exactly one caller wins for a given Pending task; everyone else gets
    /// `IllegalTransition` and must not run the job.
    pub fn claim(
        &self,
        task_id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<ClaimedTask, TransitionError> {
        let slot = self.slot(task_id)?;
        let mut record = slot.write();
        if record.status != TaskStatus::Pending {
            return Err(TransitionError::IllegalTransition {
                task_id,
                from: record.status,
                to: TaskStatus::Processing,
            });
        }
        record
            .transition(TaskStatus::Processing)
            .map_err(|(from, to)| TransitionError::IllegalTransition { task_id, from, to })?;
        record.start_claim(worker, now);

        debug!(task_id = %task_id, worker = %worker, epoch = record.epoch, "task claimed");
        Ok(ClaimedTask {
            ticket: ClaimTicket {
                task_id,
                worker,
                epoch: record.epoch,
            },
            spec: record.spec.clone(),
            created_at: record.created_at,
            cancel: slot.cancel.clone(),
        })
    }

    /// Lock the slot and check that `ticket` still owns it.
    fn with_claim<R>(
        &self,
        ticket: &ClaimTicket,
        f: impl FnOnce(&mut TaskRecord) -> Result<R, TransitionError>,
    ) -> Result<R, TransitionError> {
        let slot = self.slot(ticket.task_id)?;
        let mut record = slot.write();
        if record.epoch != ticket.epoch
            || (record.status == TaskStatus::Processing && record.claimed_by != Some(ticket.worker))
            || record.status == TaskStatus::Pending
        {
            return Err(TransitionError::StaleClaim {
                task_id: ticket.task_id,
                epoch: ticket.epoch,
            });
        }
        f(&mut *record)
    }

    fn require_processing(record: &TaskRecord) -> Result<(), TransitionError> {
        if record.status != TaskStatus::Processing {
            return Err(TransitionError::NotProcessing {
                task_id: record.id,
                status: record.status,
            });
        }
        Ok(())
    }

    /// Ok while `ticket` still holds the task in Processing. Nothing is written.
    pub fn verify_claim(&self, ticket: &ClaimTicket) -> Result<(), TransitionError> {
        self.with_claim(ticket, |record| Self::require_processing(record))
    }

    pub fn heartbeat(&self, ticket: &ClaimTicket, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.with_claim(ticket, |record| {
            Self::require_processing(record)?;
            record.heartbeat_at = Some(now);
            Ok(())
        })
    }

    /// Monotonic progress update; also counts as a heartbeat.
    pub fn report_progress(
        &self,
        ticket: &ClaimTicket,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.with_claim(ticket, |record| {
            Self::require_processing(record)?;
            if progress > 100 {
                return Err(TransitionError::ProgressOutOfRange {
                    task_id: record.id,
                    requested: progress,
                });
            }
            if progress < record.progress {
                return Err(TransitionError::ProgressRegressed {
                    task_id: record.id,
                    current: record.progress,
                    requested: progress,
                });
            }
            record.progress = progress;
            record.heartbeat_at = Some(now);
            Ok(())
        })
    }

    fn finish_with(
        record: &mut TaskRecord,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let task_id = record.id;
        record
            .transition(to)
            .map_err(|(from, to)| TransitionError::IllegalTransition { task_id, from, to })?;
        record.finish(now);
        Ok(())
    }

    /// Processing -> Completed. `expires_at` is taken from the artifact.
    pub fn complete(
        &self,
        ticket: &ClaimTicket,
        artifact: ArtifactRef,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, TransitionError> {
        self.with_claim(ticket, |record| {
            Self::finish_with(record, TaskStatus::Completed, now)?;
            record.progress = 100;
            record.expires_at = Some(artifact.expires_at);
            record.result = Some(artifact);
            info!(task_id = %record.id, "task completed");
            Ok(record.clone())
        })
    }

    /// Processing -> Failed.
    pub fn fail(
        &self,
        ticket: &ClaimTicket,
        failure: WorkerFailure,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, TransitionError> {
        self.with_claim(ticket, |record| {
            Self::finish_with(record, TaskStatus::Failed, now)?;
            warn!(task_id = %record.id, code = %failure.code, message = %failure.message, "task failed");
            record.error = Some(failure);
            Ok(record.clone())
        })
    }

    /// Processing -> Cancelled, reported by the worker once it stopped.
    pub fn acknowledge_cancel(
        &self,
        ticket: &ClaimTicket,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, TransitionError> {
        self.with_claim(ticket, |record| {
            Self::finish_with(record, TaskStatus::Cancelled, now)?;
            info!(task_id = %record.id, "task cancelled by worker");
            Ok(record.clone())
        })
    }

    /// Cancel a Pending task outright, flag a Processing one, and leave a
    /// terminal one untouched.
    pub fn request_cancel(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, TransitionError> {
        let slot = self.slot(task_id)?;
        let mut record = slot.write();
        let outcome = match record.status {
            TaskStatus::Pending => {
                Self::finish_with(&mut record, TaskStatus::Cancelled, now)?;
                record.cancel_requested = true;
                slot.cancel.cancel();
                CancelOutcome::Cancelled
            }
            TaskStatus::Processing => {
                record.cancel_requested = true;
                slot.cancel.cancel();
                CancelOutcome::CancellationRequested
            }
            terminal => CancelOutcome::AlreadyTerminal(terminal),
        };
        debug!(task_id = %task_id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    /// Take back every Processing task whose worker has been silent for
    /// longer than `timeout`.
    ///
    /// - cancel requested -> Cancelled
    /// - `attempts >= max_claims` -> Failed (`orphaned`)
    /// - otherwise -> Pending; the caller requeues it
    pub fn reap_stale(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
        max_claims: u32,
    ) -> Vec<ReapOutcome> {
        let mut outcomes = Vec::new();
        for slot in self.all_slots() {
            let mut record = slot.write();
            if record.status != TaskStatus::Processing || now - record.last_seen() <= timeout {
                continue;
            }

            let task_id = record.id;
            let previous_worker = record.claimed_by;
            let last_seen = record.last_seen();
            let action = if slot.cancel.is_cancelled() {
                if Self::finish_with(&mut record, TaskStatus::Cancelled, now).is_err() {
                    continue;
                }
                ReapAction::Cancelled
            } else if record.attempts >= max_claims {
                if Self::finish_with(&mut record, TaskStatus::Failed, now).is_err() {
                    continue;
                }
                record.error = Some(WorkerFailure::new(
                    codes::ORPHANED,
                    format!(
                        "no heartbeat since {last_seen} after {} claim(s)",
                        record.attempts
                    ),
                ));
                ReapAction::Failed
            } else {
                if record.transition(TaskStatus::Pending).is_err() {
                    continue;
                }
                record.release_claim();
                ReapAction::Requeued
            };

            warn!(
                task_id = %task_id,
                worker = ?previous_worker,
                %last_seen,
                ?action,
                "reaped stale task"
            );
            outcomes.push(ReapOutcome {
                task_id,
                previous_worker,
                action,
            });
        }
        outcomes
    }

    /// Record that the sweep removed this task's artifact.
    pub fn mark_purged(&self, task_id: TaskId, now: DateTime<Utc>) -> bool {
        let Ok(slot) = self.slot(task_id) else {
            return false;
        };
        let mut record = slot.write();
        if record.status != TaskStatus::Completed || record.purged_at.is_some() {
            return false;
        }
        record.purged_at = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, ArtifactId, ArtifactMeta, NodeId};
    use chrono::TimeZone;
    use std::sync::Barrier;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn spec() -> JobSpec {
        JobSpec::new(
            "crm.customers.export.v1",
            NodeId::new(1),
            Action::View,
            serde_json::json!({}),
        )
    }

    fn new_task(registry: &TaskRegistry) -> TaskId {
        let id = TaskId::from_ulid(Ulid::new());
        registry.create(id, ActorId::new("alice"), spec(), t0());
        id
    }

    fn artifact(task_id: TaskId) -> ArtifactRef {
        ArtifactRef {
            artifact_id: ArtifactId::from_ulid(Ulid::new()),
            task_id,
            meta: ArtifactMeta {
                size: 3,
                content_type: "text/csv".into(),
                filename: "x.csv".into(),
            },
            expires_at: t0() + Duration::hours(24),
        }
    }

    #[test]
    fn create_starts_pending_with_nothing_set() {
        let registry = TaskRegistry::new();
        let id = new_task(&registry);

        let record = registry.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.progress, 0);
        assert!(record.result.is_none());
        assert!(record.error.is_none());
        assert!(record.started_at.is_none());
    }

    #[test]
    fn only_one_concurrent_claim_wins() {
        let registry = Arc::new(TaskRegistry::new());
        let id = new_task(&registry);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.claim(id, WorkerId(n), t0()).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.get(id).unwrap().attempts, 1);
    }

    #[test]
    fn terminal_transitions_happen_once() {
        let registry = TaskRegistry::new();
        let id = new_task(&registry);
        let claimed = registry.claim(id, WorkerId(1), t0()).unwrap();

        registry.complete(&claimed.ticket, artifact(id), t0()).unwrap();
        let err = registry
            .fail(&claimed.ticket, WorkerFailure::new("late", "too late"), t0())
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::IllegalTransition {
                task_id: id,
                from: TaskStatus::Completed,
                to: TaskStatus::Failed
            }
        );
        let err = registry
            .complete(&claimed.ticket, artifact(id), t0())
            .unwrap_err();
        assert!(matches!(err, TransitionError::IllegalTransition { .. }));

        let record = registry.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.error.is_none());
        assert_eq!(record.expires_at, Some(t0() + Duration::hours(24)));
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let registry = TaskRegistry::new();
        let id = new_task(&registry);
        let ticket = registry.claim(id, WorkerId(1), t0()).unwrap().ticket;

        registry.report_progress(&ticket, 25, t0()).unwrap();
        registry.report_progress(&ticket, 25, t0()).unwrap();
        registry.report_progress(&ticket, 60, t0()).unwrap();
        assert_eq!(
            registry.report_progress(&ticket, 40, t0()).unwrap_err(),
            TransitionError::ProgressRegressed {
                task_id: id,
                current: 60,
                requested: 40
            }
        );
        assert!(matches!(
            registry.report_progress(&ticket, 101, t0()),
            Err(TransitionError::ProgressOutOfRange { .. })
        ));
        assert_eq!(registry.get(id).unwrap().progress, 60);
    }

    #[test]
    fn cancel_pending_is_immediate_and_claim_then_fails() {
        let registry = TaskRegistry::new();
        let id = new_task(&registry);

        assert_eq!(registry.request_cancel(id, t0()).unwrap(), CancelOutcome::Cancelled);
        assert!(matches!(
            registry.claim(id, WorkerId(1), t0()),
            Err(TransitionError::IllegalTransition {
                from: TaskStatus::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn cancel_processing_only_sets_the_flag() {
        let registry = TaskRegistry::new();
        let id = new_task(&registry);
        let claimed = registry.claim(id, WorkerId(1), t0()).unwrap();

        assert_eq!(
            registry.request_cancel(id, t0()).unwrap(),
            CancelOutcome::CancellationRequested
        );
        assert!(claimed.cancel.is_cancelled());
        assert_eq!(registry.status(id), Some(TaskStatus::Processing));

        registry.acknowledge_cancel(&claimed.ticket, t0()).unwrap();
        assert_eq!(registry.status(id), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn cancel_terminal_reports_existing_status() {
        let registry = TaskRegistry::new();
        let id = new_task(&registry);
        let claimed = registry.claim(id, WorkerId(1), t0()).unwrap();
        registry.complete(&claimed.ticket, artifact(id), t0()).unwrap();

        assert_eq!(
            registry.request_cancel(id, t0()).unwrap(),
            CancelOutcome::AlreadyTerminal(TaskStatus::Completed)
        );
        assert_eq!(registry.status(id), Some(TaskStatus::Completed));
    }

    #[test]
    fn reaper_requeues_silent_task_and_stales_old_ticket() {
        let registry = TaskRegistry::new();
        let id = new_task(&registry);
        let old = registry.claim(id, WorkerId(1), t0()).unwrap();
        registry.report_progress(&old.ticket, 30, t0()).unwrap();

        // still fresh
        let now = t0() + Duration::seconds(5);
        assert!(registry.reap_stale(now, Duration::seconds(10), 3).is_empty());

        let now = t0() + Duration::seconds(11);
        let reaped = registry.reap_stale(now, Duration::seconds(10), 3);
        assert_eq!(
            reaped,
            vec![ReapOutcome {
                task_id: id,
                previous_worker: Some(WorkerId(1)),
                action: ReapAction::Requeued
            }]
        );
        let record = registry.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.progress, 0);

        assert!(matches!(
            registry.heartbeat(&old.ticket, now),
            Err(TransitionError::StaleClaim { .. })
        ));

        // same worker id reclaiming still gets a new epoch
        let fresh = registry.claim(id, WorkerId(1), now).unwrap();
        assert_ne!(fresh.ticket.epoch, old.ticket.epoch);
        assert!(registry.verify_claim(&fresh.ticket).is_ok());
        assert!(matches!(
            registry.verify_claim(&old.ticket),
            Err(TransitionError::StaleClaim { .. })
        ));
        assert!(matches!(
            registry.complete(&old.ticket, artifact(id), now),
            Err(TransitionError::StaleClaim { .. })
        ));
        registry.complete(&fresh.ticket, artifact(id), now).unwrap();
        // a finished task no longer has a live claim
        assert!(matches!(
            registry.verify_claim(&fresh.ticket),
            Err(TransitionError::NotProcessing { .. })
        ));
    }

    #[test]
    fn reaper_fails_task_after_max_claims() {
        let registry = TaskRegistry::new();
        let id = new_task(&registry);
        let mut now = t0();
        for _ in 0..2 {
            registry.claim(id, WorkerId(1), now).unwrap();
            now += Duration::seconds(20);
            registry.reap_stale(now, Duration::seconds(10), 2);
        }

        let record = registry.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.unwrap().code, codes::ORPHANED);
    }

    #[test]
    fn reaper_honours_pending_cancel_request() {
        let registry = TaskRegistry::new();
        let id = new_task(&registry);
        registry.claim(id, WorkerId(1), t0()).unwrap();
        registry.request_cancel(id, t0()).unwrap();

        let reaped = registry.reap_stale(t0() + Duration::minutes(1), Duration::seconds(10), 3);
        assert_eq!(reaped[0].action, ReapAction::Cancelled);
        assert_eq!(registry.status(id), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn mark_purged_only_touches_completed_rows_once() {
        let registry = TaskRegistry::new();
        let pending = new_task(&registry);
        let done = new_task(&registry);
        let claimed = registry.claim(done, WorkerId(1), t0()).unwrap();
        registry.complete(&claimed.ticket, artifact(done), t0()).unwrap();

        assert!(!registry.mark_purged(pending, t0()));
        assert!(registry.mark_purged(done, t0()));
        assert!(!registry.mark_purged(done, t0()));
        assert!(!registry.mark_purged(TaskId::from_ulid(Ulid::new()), t0()));
    }

    #[test]
    fn counts_by_status() {
        let registry = TaskRegistry::new();
        let a = new_task(&registry);
        let _b = new_task(&registry);
        registry.claim(a, WorkerId(1), t0()).unwrap();

        let counts = registry.counts();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.completed, 0);
    }
}
