//! ReaperLoop - heartbeat の途絶えた task の回収
//!
//! # フロー
//! 1. `TaskRegistry::reap_stale()` で heartbeat が `timeout` より古い Processing を回収
//! 2. Pending に戻ったものだけ `WorkQueue::requeue()`（容量は無視）
//! 3. 取消要求済みは Cancelled、claim 回数を使い切ったものは Failed(`orphaned`)

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::background::LoopHandle;
use crate::ports::Clock;
use crate::queue::WorkQueue;
use crate::registry::{ReapAction, ReapOutcome, TaskRegistry};

#[derive(Clone)]
pub struct ReaperLoop {
    registry: Arc<TaskRegistry>,
    queue: Arc<WorkQueue>,
    clock: Arc<dyn Clock>,
    timeout: chrono::Duration,
    max_claims: u32,
}

impl ReaperLoop {
    pub fn new(
        registry: Arc<TaskRegistry>,
        queue: Arc<WorkQueue>,
        clock: Arc<dyn Clock>,
        timeout: chrono::Duration,
        max_claims: u32,
    ) -> Self {
        Self {
            registry,
            queue,
            clock,
            timeout,
            max_claims,
        }
    }

    /// One pass.
    pub fn tick(&self) -> Vec<ReapOutcome> {
        let outcomes = self
            .registry
            .reap_stale(self.clock.now(), self.timeout, self.max_claims);
        for outcome in &outcomes {
            if outcome.action == ReapAction::Requeued {
                self.queue.requeue(outcome.task_id);
            }
        }
        if !outcomes.is_empty() {
            info!(reaped = outcomes.len(), "reaper pass");
        }
        outcomes
    }

    pub fn spawn(self, interval: Duration) -> LoopHandle {
        LoopHandle::spawn("reaper", interval, move || {
            let reaper = self.clone();
            async move {
                reaper.tick();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, ActorId, JobSpec, NodeId, TaskId, TaskStatus, WorkerId};
    use crate::ports::FixedClock;
    use chrono::Utc;
    use ulid::Ulid;

    fn pending_task(registry: &TaskRegistry, clock: &FixedClock) -> TaskId {
        let id = TaskId::from_ulid(Ulid::new());
        registry.create(
            id,
            ActorId::new("a"),
            JobSpec::new("x.v1", NodeId::new(0), Action::View, serde_json::json!({})),
            clock.now(),
        );
        id
    }

    #[test]
    fn requeues_only_what_went_back_to_pending() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let registry = Arc::new(TaskRegistry::new());
        let queue = Arc::new(WorkQueue::new(4));
        let reaper = ReaperLoop::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            clock.clone(),
            chrono::Duration::seconds(10),
            2,
        );

        let silent = pending_task(&registry, &clock);
        let cancelled = pending_task(&registry, &clock);
        let fresh = pending_task(&registry, &clock);
        registry.claim(silent, WorkerId(0), clock.now()).unwrap();
        registry.claim(cancelled, WorkerId(1), clock.now()).unwrap();
        registry.request_cancel(cancelled, clock.now()).unwrap();

        clock.advance(chrono::Duration::seconds(11));
        registry.claim(fresh, WorkerId(2), clock.now()).unwrap();

        let mut outcomes = reaper.tick();
        outcomes.sort_by_key(|o| o.task_id == cancelled);
        assert_eq!(outcomes.len(), 2);
        assert_eq!((outcomes[0].task_id, outcomes[0].action), (silent, ReapAction::Requeued));
        assert_eq!((outcomes[1].task_id, outcomes[1].action), (cancelled, ReapAction::Cancelled));

        assert_eq!(queue.try_pop(), Some(silent));
        assert!(queue.is_empty());
        assert_eq!(registry.status(fresh), Some(TaskStatus::Processing));
    }

    #[test]
    fn requeue_bypasses_full_queue() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let registry = Arc::new(TaskRegistry::new());
        let queue = Arc::new(WorkQueue::new(1));
        let reaper = ReaperLoop::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            clock.clone(),
            chrono::Duration::seconds(10),
            3,
        );

        let stuck = pending_task(&registry, &clock);
        registry.claim(stuck, WorkerId(0), clock.now()).unwrap();
        queue.try_reserve().unwrap().push(TaskId::from_ulid(Ulid::new()));

        clock.advance(chrono::Duration::seconds(30));
        let outcomes = reaper.tick();
        assert_eq!(outcomes[0].action, ReapAction::Requeued);
        assert_eq!(queue.len(), 2);
    }
}
