//! InMemoryArtifactStore - プロセス内の成果物ストア
//!
//! # 実装詳細
//! - `RwLock<HashMap<TaskId, Arc<Mutex<Entry>>>>` で task ごとに entry ロック
//! - map のロックは entry を探す間だけ持つ（task をまたいで直列化しない）
//! - sweep は bytes を捨てて tombstone を残す。fetch は tombstone を `Expired` と答える
//! - Live entry は書いた claim の epoch を持つ。古い epoch の残骸は新しい store で置き換わる

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{Artifact, ArtifactRef, TaskId};
use crate::ports::{ArtifactError, ArtifactStore, StoreRequest};

enum Entry {
    Live {
        artifact_ref: ArtifactRef,
        bytes: Vec<u8>,
        epoch: u64,
    },
    Purged { expired_at: DateTime<Utc> },
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    entries: RwLock<HashMap<TaskId, Arc<Mutex<Entry>>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, task_id: TaskId) -> Option<Arc<Mutex<Entry>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .cloned()
    }

    /// Number of artifacts still holding bytes.
    pub fn live_count(&self) -> usize {
        let entries: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries
            .iter()
            .filter(|e| {
                matches!(
                    *e.lock().unwrap_or_else(PoisonError::into_inner),
                    Entry::Live { .. }
                )
            })
            .count()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn store(
        &self,
        request: StoreRequest,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, ArtifactError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&request.task_id) {
            let superseded = matches!(
                *existing.lock().unwrap_or_else(PoisonError::into_inner),
                Entry::Live { epoch, .. } if epoch < request.epoch
            );
            if !superseded {
                return Err(ArtifactError::AlreadyStored(request.task_id));
            }
            debug!(task_id = %request.task_id, epoch = request.epoch, "replacing artifact left by a reclaimed claim");
        }

        let artifact_ref = ArtifactRef {
            artifact_id: request.artifact_id,
            task_id: request.task_id,
            meta: request.meta,
            expires_at: request.expires_at,
        };
        entries.insert(
            request.task_id,
            Arc::new(Mutex::new(Entry::Live {
                artifact_ref: artifact_ref.clone(),
                bytes,
                epoch: request.epoch,
            })),
        );
        Ok(artifact_ref)
    }

    async fn fetch(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<Artifact, ArtifactError> {
        let entry = self.entry(task_id).ok_or(ArtifactError::NotFound(task_id))?;
        let guard = entry.lock().unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Entry::Live { artifact_ref, .. } if now > artifact_ref.expires_at => {
                Err(ArtifactError::Expired {
                    task_id,
                    expired_at: artifact_ref.expires_at,
                })
            }
            Entry::Live {
                artifact_ref,
                bytes,
                ..
            } => Ok(Artifact {
                artifact_ref: artifact_ref.clone(),
                bytes: bytes.clone(),
            }),
            Entry::Purged { expired_at } => Err(ArtifactError::Expired {
                task_id,
                expired_at: *expired_at,
            }),
        }
    }

    async fn discard(&self, task_id: TaskId, epoch: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let owned = entries.get(&task_id).is_some_and(|entry| {
            matches!(
                *entry.lock().unwrap_or_else(PoisonError::into_inner),
                Entry::Live { epoch: stored, .. } if stored == epoch
            )
        });
        if owned {
            entries.remove(&task_id);
        }
        owned
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let snapshot: Vec<(TaskId, Arc<Mutex<Entry>>)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        let mut purged = Vec::new();
        for (task_id, entry) in snapshot {
            let mut guard = entry.lock().unwrap_or_else(PoisonError::into_inner);
            let expired_at = match &*guard {
                Entry::Live { artifact_ref, .. } if artifact_ref.expires_at < now => {
                    artifact_ref.expires_at
                }
                _ => continue,
            };
            *guard = Entry::Purged { expired_at };
            debug!(task_id = %task_id, %expired_at, "artifact purged");
            purged.push(task_id);
        }
        purged
    }
}
