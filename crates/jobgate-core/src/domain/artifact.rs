//! Artifact metadata and payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ArtifactId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub size: u64,
    pub content_type: String,
    pub filename: String,
}

/// Reference stored in `Task.result` once the task is Completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub artifact_id: ArtifactId,
    pub task_id: TaskId,
    pub meta: ArtifactMeta,
    pub expires_at: DateTime<Utc>,
}

/// A fetched artifact: bytes plus the metadata they were stored with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub artifact_ref: ArtifactRef,
    pub bytes: Vec<u8>,
}

/// What a job handler hands back on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOutput {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub filename: String,
}

impl ArtifactOutput {
    pub fn new(
        bytes: impl Into<Vec<u8>>,
        content_type: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
            filename: filename.into(),
        }
    }

    pub fn meta(&self) -> ArtifactMeta {
        ArtifactMeta {
            size: self.bytes.len() as u64,
            content_type: self.content_type.clone(),
            filename: self.filename.clone(),
        }
    }
}
