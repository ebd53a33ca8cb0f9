//! GcLoop - 期限切れ artifact の掃除
//!
//! # フロー
//! 1. 定期的に `ArtifactStore::sweep(now)` で expires_at < now の bytes を削除
//! 2. 消えた task を `TaskRegistry::mark_purged()` で記録（行は残す）

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::background::LoopHandle;
use crate::domain::TaskId;
use crate::ports::{ArtifactStore, Clock};
use crate::registry::TaskRegistry;

#[derive(Clone)]
pub struct GcLoop {
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
}

impl GcLoop {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            artifacts,
            registry,
            clock,
        }
    }

    /// One sweep. Returns the tasks whose artifacts were purged.
    pub async fn tick(&self) -> Vec<TaskId> {
        let now = self.clock.now();
        let purged = self.artifacts.sweep(now).await;
        for task_id in &purged {
            self.registry.mark_purged(*task_id, now);
        }
        if !purged.is_empty() {
            info!(purged = purged.len(), "artifact sweep");
        }
        purged
    }

    pub fn spawn(self, interval: Duration) -> LoopHandle {
        LoopHandle::spawn("artifact-sweep", interval, move || {
            let gc = self.clone();
            async move {
                gc.tick().await;
            }
        })
    }
}
