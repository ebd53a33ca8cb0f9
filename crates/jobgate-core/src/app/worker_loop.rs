//! WorkerPool - タスク実行ループ
//!
//! # フロー
//! 1. `WorkQueue::pop()` で task_id 取得
//! 2. `TaskRegistry::claim()` で Pending -> Processing（CAS、負けたら捨てる）
//! 3. job_type から handler を引き、別 task として実行
//! 4. 実行中は heartbeat を送る。claim を失ったら job を abort
//! 5. 成功: artifact を保存してから Completed。失敗: Failed。取消: Cancelled
//!    保存と完了の書き込みが終わるまで heartbeat は止めない
//!
//! Shutdown は新しい仕事を取らなくなるだけで、実行中の job は止めない。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::errors::codes;
use crate::domain::{ArtifactOutput, WorkerFailure, WorkerId};
use crate::ports::{ArtifactStore, Clock, IdGenerator, StoreRequest};
use crate::queue::WorkQueue;
use crate::registry::{ClaimTicket, ClaimedTask, TaskRegistry};
use crate::typed::{HandlerRegistry, JobContext, JobError};

/// Everything a worker needs, shared by all workers of a pool.
#[derive(Clone)]
pub struct WorkerDeps {
    pub registry: Arc<TaskRegistry>,
    pub queue: Arc<WorkQueue>,
    pub handlers: Arc<HandlerRegistry>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub artifact_ttl: chrono::Duration,
    pub heartbeat_interval: Duration,
}

/// Worker pool handle.
/// - `request_shutdown` で全 worker が新しい task を取らなくなる
/// - `shutdown_and_join` で全 worker の終了を待てる
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, deps: WorkerDeps) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for index in 0..n {
            let worker = WorkerId(u32::try_from(index).unwrap_or(u32::MAX));
            let deps = deps.clone();
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker, deps, &mut rx).await;
            });
            joins.push(join);
        }

        info!(workers = n, "worker pool started");
        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(worker: WorkerId, deps: WorkerDeps, shutdown_rx: &mut watch::Receiver<bool>) {
    debug!(worker = %worker, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // pop は待つ可能性があるので select で shutdown と競合させる
        let task_id = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            task_id = deps.queue.pop() => task_id,
        };

        let claimed = match deps.registry.claim(task_id, worker, deps.clock.now()) {
            Ok(claimed) => claimed,
            Err(err) => {
                // cancelled while queued, or another worker won
                debug!(worker = %worker, task_id = %task_id, error = %err, "claim lost");
                continue;
            }
        };

        run_claimed(worker, claimed, &deps).await;
    }
    debug!(worker = %worker, "worker stopped");
}

/// Run one claimed task to a terminal write (or until the claim is lost).
async fn run_claimed(worker: WorkerId, claimed: ClaimedTask, deps: &WorkerDeps) {
    let ticket = claimed.ticket;
    let job_type = claimed.spec.job_type.clone();
    info!(worker = %worker, task_id = %ticket.task_id, %job_type, epoch = ticket.epoch, "job started");

    let Some(handler) = deps.handlers.get(&job_type) else {
        let failure = WorkerFailure::new(
            codes::UNKNOWN_JOB_TYPE,
            format!("no handler for job type '{job_type}'"),
        );
        record_failure(deps, &ticket, failure);
        return;
    };

    let ctx = JobContext::new(
        ticket,
        claimed.cancel.clone(),
        Arc::clone(&deps.registry),
        Arc::clone(&deps.clock),
    );
    let params = claimed.spec.params.clone();
    let mut job = tokio::spawn(async move { handler.run_dyn(params, ctx).await });

    let mut heartbeat = tokio::time::interval(deps.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; the claim itself was the first beat
    heartbeat.tick().await;

    let Some(joined) = beating(worker, &ticket, deps, &mut heartbeat, &mut job).await else {
        job.abort();
        return;
    };

    match joined {
        Ok(Ok(output)) => {
            let finish = store_and_complete(deps, &claimed, output);
            if beating(worker, &ticket, deps, &mut heartbeat, finish).await.is_none() {
                // upload abandoned mid-way; drop whatever this claim managed to write
                deps.artifacts.discard(ticket.task_id, ticket.epoch).await;
            }
        }
        Ok(Err(JobError::Cancelled)) => {
            if let Err(err) = deps.registry.acknowledge_cancel(&ticket, deps.clock.now()) {
                warn!(task_id = %ticket.task_id, error = %err, "cancel acknowledgement rejected");
            }
        }
        Ok(Err(JobError::Failed(failure))) => record_failure(deps, &ticket, failure),
        Ok(Err(JobError::ClaimLost(err))) => {
            warn!(worker = %worker, task_id = %ticket.task_id, error = %err, "job stopped after losing its claim");
        }
        Err(join_err) => {
            let failure = WorkerFailure::new(codes::JOB_PANICKED, join_err.to_string());
            record_failure(deps, &ticket, failure);
        }
    }
}

/// Drive `fut` while heartbeating the claim. `None` once a heartbeat is
/// rejected; `fut` is dropped at that point.
async fn beating<F: Future>(
    worker: WorkerId,
    ticket: &ClaimTicket,
    deps: &WorkerDeps,
    heartbeat: &mut Interval,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            _ = heartbeat.tick() => {
                if let Err(err) = deps.registry.heartbeat(ticket, deps.clock.now()) {
                    warn!(worker = %worker, task_id = %ticket.task_id, error = %err, "heartbeat rejected; abandoning job");
                    return None;
                }
            }
        }
    }
}

async fn store_and_complete(deps: &WorkerDeps, claimed: &ClaimedTask, output: ArtifactOutput) {
    let ticket = claimed.ticket;
    // a reclaimed worker must not upload over the live claim
    if let Err(err) = deps.registry.verify_claim(&ticket) {
        warn!(task_id = %ticket.task_id, epoch = ticket.epoch, error = %err, "claim lost before storing; output dropped");
        return;
    }

    let request = StoreRequest {
        task_id: ticket.task_id,
        epoch: ticket.epoch,
        artifact_id: deps.ids.generate_artifact_id(),
        meta: output.meta(),
        expires_at: claimed.expires_at(deps.artifact_ttl),
    };

    let artifact = match deps.artifacts.store(request, output.bytes).await {
        Ok(artifact) => artifact,
        Err(err) => {
            let failure = WorkerFailure::new(codes::ARTIFACT_WRITE, err.to_string());
            record_failure(deps, &ticket, failure);
            return;
        }
    };

    if let Err(err) = deps.registry.complete(&ticket, artifact, deps.clock.now()) {
        // keep "owned by exactly one completed task"
        deps.artifacts.discard(ticket.task_id, ticket.epoch).await;
        warn!(task_id = %ticket.task_id, error = %err, "completion rejected; artifact discarded");
    }
}

fn record_failure(deps: &WorkerDeps, ticket: &ClaimTicket, failure: WorkerFailure) {
    if let Err(err) = deps.registry.fail(ticket, failure, deps.clock.now()) {
        warn!(task_id = %ticket.task_id, error = %err, "failure report rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ReaperLoop;
    use crate::domain::{Action, ActorId, Artifact, ArtifactRef, JobSpec, NodeId, TaskId, TaskStatus};
    use crate::impls::InMemoryArtifactStore;
    use crate::ports::{ArtifactError, FixedClock, SystemClock, UlidGenerator};
    use crate::registry::ReapAction;
    use crate::typed::{Job, JobHandler};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Boom {}

    impl Job for Boom {
        const TYPE: &'static str = "test.boom.v1";
    }

    struct BoomHandler;

    #[async_trait]
    impl JobHandler<Boom> for BoomHandler {
        async fn run(&self, _job: Boom, _ctx: JobContext) -> Result<ArtifactOutput, JobError> {
            panic!("handler blew up");
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Count {}

    impl Job for Count {
        const TYPE: &'static str = "test.count.v1";
    }

    struct CountHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler<Count> for CountHandler {
        async fn run(&self, _job: Count, ctx: JobContext) -> Result<ArtifactOutput, JobError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.report_progress(100)?;
            Ok(ArtifactOutput::new(b"done".to_vec(), "text/plain", "count.txt"))
        }
    }

    /// Sleeps `millis`, then reports 50% and returns a small artifact.
    #[derive(Debug, Serialize, Deserialize)]
    struct Slow {
        millis: u64,
    }

    impl Job for Slow {
        const TYPE: &'static str = "test.slow.v1";
    }

    struct SlowHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler<Slow> for SlowHandler {
        async fn run(&self, job: Slow, ctx: JobContext) -> Result<ArtifactOutput, JobError> {
            tokio::time::sleep(Duration::from_millis(job.millis)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.report_progress(50)?;
            Ok(ArtifactOutput::new(b"slow".to_vec(), "text/plain", "slow.txt"))
        }
    }

    /// Artifact store whose uploads take `delay`.
    struct SlowStore {
        inner: InMemoryArtifactStore,
        delay: Duration,
    }

    #[async_trait]
    impl ArtifactStore for SlowStore {
        async fn store(&self, request: StoreRequest, bytes: Vec<u8>) -> Result<ArtifactRef, ArtifactError> {
            tokio::time::sleep(self.delay).await;
            self.inner.store(request, bytes).await
        }

        async fn fetch(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<Artifact, ArtifactError> {
            self.inner.fetch(task_id, now).await
        }

        async fn discard(&self, task_id: TaskId, epoch: u64) -> bool {
            self.inner.discard(task_id, epoch).await
        }

        async fn sweep(&self, now: DateTime<Utc>) -> Vec<TaskId> {
            self.inner.sweep(now).await
        }
    }

    fn deps_with(handlers: HandlerRegistry, clock: Arc<dyn Clock>, heartbeat_interval: Duration) -> WorkerDeps {
        WorkerDeps {
            registry: Arc::new(TaskRegistry::new()),
            queue: Arc::new(WorkQueue::new(16)),
            handlers: Arc::new(handlers),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            artifact_ttl: chrono::Duration::hours(1),
            heartbeat_interval,
        }
    }

    fn deps(handlers: HandlerRegistry) -> WorkerDeps {
        deps_with(handlers, Arc::new(SystemClock), Duration::from_millis(10))
    }

    fn create_task(deps: &WorkerDeps, job_type: &str, params: serde_json::Value) -> TaskId {
        let id = deps.ids.generate_task_id();
        deps.registry.create(
            id,
            ActorId::new("tester"),
            JobSpec::new(job_type, NodeId::new(0), Action::View, params),
            deps.clock.now(),
        );
        id
    }

    fn enqueue(deps: &WorkerDeps, job_type: &str) -> TaskId {
        let id = create_task(deps, job_type, serde_json::json!({}));
        deps.queue.try_reserve().unwrap().push(id);
        id
    }

    fn reaper(deps: &WorkerDeps) -> ReaperLoop {
        ReaperLoop::new(
            Arc::clone(&deps.registry),
            Arc::clone(&deps.queue),
            Arc::clone(&deps.clock),
            chrono::Duration::seconds(30),
            3,
        )
    }

    fn slow_handlers(finished: &Arc<AtomicUsize>) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register::<Slow, _>(SlowHandler(Arc::clone(finished)))
            .unwrap();
        handlers
    }

    async fn wait_terminal(deps: &WorkerDeps, id: TaskId) -> TaskStatus {
        for _ in 0..200 {
            if let Some(status) = deps.registry.status(id)
                && status.is_terminal()
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{id} never reached a terminal state");
    }

    #[tokio::test]
    async fn panicking_job_is_recorded_as_failed() {
        let mut handlers = HandlerRegistry::new();
        handlers.register::<Boom, _>(BoomHandler).unwrap();
        let deps = deps(handlers);
        let id = enqueue(&deps, Boom::TYPE);

        let pool = WorkerPool::spawn(1, deps.clone());
        assert_eq!(wait_terminal(&deps, id).await, TaskStatus::Failed);
        pool.shutdown_and_join().await;

        let record = deps.registry.get(id).unwrap();
        assert_eq!(record.error.unwrap().code, codes::JOB_PANICKED);
    }

    #[tokio::test]
    async fn unknown_job_type_fails_without_running_anything() {
        let deps = deps(HandlerRegistry::new());
        let id = enqueue(&deps, "test.missing.v1");

        let pool = WorkerPool::spawn(1, deps.clone());
        assert_eq!(wait_terminal(&deps, id).await, TaskStatus::Failed);
        pool.shutdown_and_join().await;

        let record = deps.registry.get(id).unwrap();
        assert_eq!(record.error.unwrap().code, codes::UNKNOWN_JOB_TYPE);
    }

    #[tokio::test]
    async fn duplicated_queue_entry_runs_the_job_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers
            .register::<Count, _>(CountHandler(Arc::clone(&runs)))
            .unwrap();
        let deps = deps(handlers);
        let id = enqueue(&deps, Count::TYPE);
        // same id visible to several workers at once
        deps.queue.requeue(id);
        deps.queue.requeue(id);

        let pool = WorkerPool::spawn(3, deps.clone());
        assert_eq!(wait_terminal(&deps, id).await, TaskStatus::Completed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.shutdown_and_join().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(deps.queue.len(), 0);
        let artifact = deps.artifacts.fetch(id, deps.clock.now()).await.unwrap();
        assert_eq!(artifact.bytes, b"done");
        assert_eq!(artifact.artifact_ref.meta.size, 4);
    }

    #[tokio::test]
    async fn heartbeats_keep_a_long_job_from_being_reaped() {
        let finished = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let deps = deps_with(slow_handlers(&finished), clock.clone(), Duration::from_millis(10));
        let reaper = reaper(&deps);
        let id = create_task(&deps, Slow::TYPE, serde_json::json!({ "millis": 400 }));
        let claimed = deps.registry.claim(id, WorkerId(1), clock.now()).unwrap();

        let run = tokio::spawn({
            let deps = deps.clone();
            async move { run_claimed(WorkerId(1), claimed, &deps).await }
        });

        // the job outlives the timeout on the task clock but keeps beating
        tokio::time::sleep(Duration::from_millis(20)).await;
        clock.advance(chrono::Duration::minutes(5));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reaper.tick().is_empty());
        assert_eq!(deps.registry.status(id), Some(TaskStatus::Processing));

        run.await.unwrap();
        assert_eq!(deps.registry.status(id), Some(TaskStatus::Completed));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(
            deps.artifacts.fetch(id, clock.now()).await.unwrap().bytes,
            b"slow"
        );
    }

    #[tokio::test]
    async fn reclaimed_job_is_aborted_and_writes_nothing() {
        let finished = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(FixedClock::new(Utc::now()));
        // heartbeat slower than the test steps, so the reaper wins the race
        let deps = deps_with(slow_handlers(&finished), clock.clone(), Duration::from_millis(100));
        let reaper = reaper(&deps);
        let id = create_task(&deps, Slow::TYPE, serde_json::json!({ "millis": 2_000 }));
        let claimed = deps.registry.claim(id, WorkerId(1), clock.now()).unwrap();

        let run = tokio::spawn({
            let deps = deps.clone();
            async move { run_claimed(WorkerId(1), claimed, &deps).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        clock.advance(chrono::Duration::minutes(5));
        let reaped = reaper.tick();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].action, ReapAction::Requeued);

        // the next heartbeat is rejected and the worker gives up long before the job would finish
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 0);
        let record = deps.registry.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.progress, 0);
        assert!(record.result.is_none());
        assert!(record.error.is_none());
        assert_eq!(
            deps.artifacts.fetch(id, clock.now()).await.unwrap_err(),
            ArtifactError::NotFound(id)
        );
        assert_eq!(deps.queue.try_pop(), Some(id));
    }

    #[tokio::test]
    async fn heartbeats_continue_while_the_artifact_uploads() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers
            .register::<Count, _>(CountHandler(Arc::clone(&runs)))
            .unwrap();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mut deps = deps_with(handlers, clock.clone(), Duration::from_millis(10));
        deps.artifacts = Arc::new(SlowStore {
            inner: InMemoryArtifactStore::new(),
            delay: Duration::from_millis(400),
        });
        let reaper = reaper(&deps);
        let id = create_task(&deps, Count::TYPE, serde_json::json!({}));
        let claimed = deps.registry.claim(id, WorkerId(1), clock.now()).unwrap();

        let run = tokio::spawn({
            let deps = deps.clone();
            async move { run_claimed(WorkerId(1), claimed, &deps).await }
        });

        // the job itself is instant; the upload is what outlives the timeout
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        clock.advance(chrono::Duration::minutes(5));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reaper.tick().is_empty());
        assert_eq!(deps.registry.status(id), Some(TaskStatus::Processing));

        run.await.unwrap();
        assert_eq!(deps.registry.status(id), Some(TaskStatus::Completed));
        assert_eq!(
            deps.artifacts.fetch(id, clock.now()).await.unwrap().bytes,
            b"done"
        );
    }

    #[tokio::test]
    async fn leftover_upload_from_a_reclaimed_claim_does_not_fail_the_live_one() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let deps = deps_with(HandlerRegistry::new(), clock.clone(), Duration::from_millis(10));
        let id = create_task(&deps, Count::TYPE, serde_json::json!({}));

        let stale = deps.registry.claim(id, WorkerId(1), clock.now()).unwrap();
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(reaper(&deps).tick()[0].action, ReapAction::Requeued);
        let live = deps.registry.claim(id, WorkerId(2), clock.now()).unwrap();

        // the old worker's upload lands after the task was reclaimed
        let leftover = ArtifactOutput::new(b"stale".to_vec(), "text/plain", "stale.txt");
        deps.artifacts
            .store(
                StoreRequest {
                    task_id: id,
                    epoch: stale.ticket.epoch,
                    artifact_id: deps.ids.generate_artifact_id(),
                    meta: leftover.meta(),
                    expires_at: stale.expires_at(deps.artifact_ttl),
                },
                leftover.bytes,
            )
            .await
            .unwrap();

        let output = ArtifactOutput::new(b"live".to_vec(), "text/plain", "live.txt");
        store_and_complete(&deps, &live, output).await;

        let record = deps.registry.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.error.is_none());

        // the old worker finishing afterwards neither uploads nor cleans up the live artifact
        let late = ArtifactOutput::new(b"stale".to_vec(), "text/plain", "stale.txt");
        store_and_complete(&deps, &stale, late).await;
        assert!(!deps.artifacts.discard(id, stale.ticket.epoch).await);

        let artifact = deps.artifacts.fetch(id, clock.now()).await.unwrap();
        assert_eq!(artifact.bytes, b"live");
        assert_eq!(
            record.result.unwrap().artifact_id,
            artifact.artifact_ref.artifact_id
        );
        assert_eq!(deps.registry.status(id), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let deps = deps(HandlerRegistry::new());
        let pool = WorkerPool::spawn(2, deps);
        assert_eq!(pool.len(), 2);
        tokio::time::timeout(Duration::from_secs(1), pool.shutdown_and_join())
            .await
            .unwrap();
    }
}
