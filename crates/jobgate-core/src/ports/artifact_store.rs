//! ArtifactStore port - 完了したタスクの成果物（export ファイルなど）
//!
//! # 設計原則
//! - artifact はちょうど 1 つの task が所有する（共有・差し替えなし）
//! - 書き込みは claim の epoch 付き。回収された古い claim の残骸は新しい claim が上書きし、
//!   古い worker の `discard` は自分の epoch の分しか消さない
//! - TTL（expires_at）をサポート
//! - 期限切れは `sweep` で明示的に消す。消した後も `Expired` と答える
//! - fetch と sweep は同じ task の entry ロックを取るので破壊的に競合しない

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Artifact, ArtifactId, ArtifactMeta, ArtifactRef, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    /// Never stored for this task.
    #[error("no artifact for {0}")]
    NotFound(TaskId),

    /// Stored once, gone now. Distinct from `NotFound` on purpose.
    #[error("artifact for {task_id} expired at {expired_at}")]
    Expired {
        task_id: TaskId,
        expired_at: DateTime<Utc>,
    },

    #[error("artifact for {0} already stored")]
    AlreadyStored(TaskId),
}

/// Everything `store` needs besides the bytes.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub task_id: TaskId,
    /// Claim epoch of the worker that produced the bytes.
    pub epoch: u64,
    pub artifact_id: ArtifactId,
    pub meta: ArtifactMeta,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// `AlreadyStored` when the task holds an artifact from the same or a
    /// newer claim. A leftover from an older (reclaimed) claim is replaced.
    async fn store(
        &self,
        request: StoreRequest,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, ArtifactError>;

    /// Returns `Expired` once `now > expires_at`, whether or not a sweep ran.
    async fn fetch(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<Artifact, ArtifactError>;

    /// Drop the artifact stored under claim `epoch` when its completion was
    /// rejected. An artifact stored by any other epoch is left alone.
    /// Returns whether anything was removed.
    async fn discard(&self, task_id: TaskId, epoch: u64) -> bool;

    /// Delete the bytes of every artifact with `expires_at < now`.
    /// Returns the owning task ids that were purged by this call.
    async fn sweep(&self, now: DateTime<Utc>) -> Vec<TaskId>;
}
