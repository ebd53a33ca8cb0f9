//! Runtime - API 層から見た唯一の入口
//!
//! submit / get_status / cancel / fetch と、木・ロール・権限の管理操作を
//! まとめます。すべての部品は起動時に一度だけ作られ、`Arc` で共有されます。
//!
//! # ロック順序
//! roles -> tree -> permissions。逆順に取るコードはない。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use super::background::BackgroundTasks;
use super::gc_loop::GcLoop;
use super::reaper_loop::ReaperLoop;
use super::retry::RetryPolicy;
use super::scheduler::{SchedulerError, TaskScheduler};
use super::status::TaskStatusView;
use super::worker_loop::{WorkerDeps, WorkerPool};
use crate::auth::{AuthGate, RoleError, RoleRegistry};
use crate::config::RuntimeConfig;
use crate::domain::{
    Action, ActionSet, Actor, Artifact, JobSpec, NodeId, PermissionDenied, Role, RoleId, TaskId,
    TaskStatus,
};
use crate::ports::{ArtifactError, ArtifactStore, Clock, IdGenerator};
use crate::queue::WorkQueue;
use crate::registry::{CancelOutcome, ReapOutcome, TaskCounts, TaskRegistry};
use crate::tree::{MenuEntry, MenuTree, OrgChart, TreeError, TreeNode};
use crate::typed::HandlerRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("{0} not found")]
    NotFound(TaskId),

    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),

    #[error("{task_id} is {status}; nothing to download yet")]
    NotReady { task_id: TaskId, status: TaskStatus },

    #[error("download for {task_id} expired at {expired_at}")]
    Expired {
        task_id: TaskId,
        expired_at: DateTime<Utc>,
    },
}

/// Rejected tree / role / binding mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Role(#[from] RoleError),
}

pub struct Runtime {
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    menu: Arc<MenuTree>,
    positions: Arc<OrgChart>,
    roles: Arc<RoleRegistry>,
    gate: Arc<AuthGate>,
    registry: Arc<TaskRegistry>,
    queue: Arc<WorkQueue>,
    handlers: Arc<HandlerRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    scheduler: TaskScheduler,
}

impl Runtime {
    pub(super) fn assemble(
        config: RuntimeConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        artifacts: Arc<dyn ArtifactStore>,
        handlers: HandlerRegistry,
    ) -> Self {
        let gate = Arc::new(AuthGate::default());
        let registry = Arc::new(TaskRegistry::new());
        let queue = Arc::new(WorkQueue::new(config.queue_capacity));
        let handlers = Arc::new(handlers);
        let scheduler = TaskScheduler::new(
            Arc::clone(&gate),
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&handlers),
            Arc::clone(&ids),
            Arc::clone(&clock),
        );

        Self {
            roles: Arc::new(RoleRegistry::new(Arc::clone(&ids))),
            menu: Arc::new(MenuTree::new()),
            positions: Arc::new(OrgChart::new()),
            config,
            clock,
            ids,
            gate,
            registry,
            queue,
            handlers,
            artifacts,
            scheduler,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn menu(&self) -> &MenuTree {
        &self.menu
    }

    pub fn positions(&self) -> &OrgChart {
        &self.positions
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn counts(&self) -> TaskCounts {
        self.registry.counts()
    }

    /// Spawn the worker pool, the reaper and the artifact sweep.
    /// Must be called from inside a tokio runtime.
    pub fn start(&self) -> BackgroundTasks {
        let deps = WorkerDeps {
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
            handlers: Arc::clone(&self.handlers),
            artifacts: Arc::clone(&self.artifacts),
            ids: Arc::clone(&self.ids),
            clock: Arc::clone(&self.clock),
            artifact_ttl: self.config.artifact_ttl(),
            heartbeat_interval: self.config.heartbeat_interval(),
        };

        BackgroundTasks {
            workers: WorkerPool::spawn(self.config.workers, deps),
            reaper: self.reaper().spawn(self.config.reaper_interval()),
            sweeper: self.sweeper().spawn(self.config.sweep_interval()),
        }
    }

    fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
            Arc::clone(&self.clock),
            self.config.heartbeat_timeout(),
            self.config.max_claims,
        )
    }

    fn sweeper(&self) -> GcLoop {
        GcLoop::new(
            Arc::clone(&self.artifacts),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
        )
    }

    /// One reaper pass outside the background loop.
    pub fn reap_once(&self) -> Vec<ReapOutcome> {
        self.reaper().tick()
    }

    /// One artifact sweep outside the background loop.
    pub async fn sweep_once(&self) -> Vec<TaskId> {
        self.sweeper().tick().await
    }

    // ----- tasks -----

    pub fn submit(&self, actor: &Actor, spec: JobSpec) -> Result<TaskId, SchedulerError> {
        self.scheduler.submit(actor, spec)
    }

    /// `submit`, retrying with backoff while the queue is saturated.
    /// Any other error is returned on the first attempt.
    pub async fn submit_with_retry(
        &self,
        actor: &Actor,
        spec: JobSpec,
        policy: &RetryPolicy,
    ) -> Result<TaskId, SchedulerError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.scheduler.submit(actor, spec.clone()) {
                Err(err) if err.is_retryable() && policy.allows_retry(attempts) => {
                    let delay = policy.next_delay(attempts);
                    debug!(attempts, ?delay, "queue saturated; backing off");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    pub fn get_status(&self, task_id: TaskId) -> Result<TaskStatusView, SchedulerError> {
        self.scheduler.get_status(task_id)
    }

    pub fn cancel(&self, actor: &Actor, task_id: TaskId) -> Result<CancelOutcome, SchedulerError> {
        self.scheduler.cancel(actor, task_id)
    }

    /// Download a completed task's artifact. Needs `View` on the task's
    /// target node.
    pub async fn fetch(&self, actor: &Actor, task_id: TaskId) -> Result<Artifact, FetchError> {
        let record = self
            .registry
            .get(task_id)
            .ok_or(FetchError::NotFound(task_id))?;
        self.gate
            .require(actor.role_id, record.spec.target, Action::View)?;
        if record.status != TaskStatus::Completed {
            return Err(FetchError::NotReady {
                task_id,
                status: record.status,
            });
        }

        match self.artifacts.fetch(task_id, self.clock.now()).await {
            Ok(artifact) => Ok(artifact),
            Err(ArtifactError::Expired {
                task_id,
                expired_at,
            }) => Err(FetchError::Expired {
                task_id,
                expired_at,
            }),
            Err(ArtifactError::NotFound(id) | ArtifactError::AlreadyStored(id)) => {
                Err(FetchError::NotFound(id))
            }
        }
    }

    // ----- administration -----

    /// Replace the binding for (role, menu node). Both must exist; the check
    /// and the write are atomic against `remove_role` / `delete_menu_node`.
    pub fn grant(
        &self,
        role_id: RoleId,
        node_id: NodeId,
        actions: ActionSet,
    ) -> Result<ActionSet, AdminError> {
        let previous = self.roles.guarded(role_id, || {
            self.menu
                .guarded(node_id, || self.gate.grant(role_id, node_id, actions))
        })??;
        debug!(role_id = %role_id, node_id = %node_id, ?actions, ?previous, "binding replaced");
        Ok(previous)
    }

    pub fn revoke(&self, role_id: RoleId, node_id: NodeId) -> ActionSet {
        self.gate.revoke(role_id, node_id)
    }

    /// Delete a menu leaf that no binding references.
    pub fn delete_menu_node(&self, node_id: NodeId) -> Result<TreeNode<MenuEntry>, AdminError> {
        let node = self
            .menu
            .delete(node_id, |id| self.gate.references_node(id))?;
        Ok(node)
    }

    /// Delete a role that no binding references.
    pub fn remove_role(&self, role_id: RoleId) -> Result<Role, AdminError> {
        let role = self
            .roles
            .remove(role_id, |id| self.gate.references_role(id))?;
        Ok(role)
    }

    /// Menu entries the actor's role may view.
    pub fn visible_menu(&self, actor: &Actor) -> Vec<TreeNode<MenuEntry>> {
        self.gate
            .nodes_with(actor.role_id, Action::View)
            .into_iter()
            .filter_map(|id| self.menu.get(id))
            .collect()
    }
}
