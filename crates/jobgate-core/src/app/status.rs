//! Status - ポーリング用の状態ビュー
//!
//! Wire shape:
//! ```json
//! {"task_id": "...", "status": "Processing", "progress": 42, "error": null}
//! {"task_id": "...", "status": "Completed", "progress": 100, "error": null,
//!  "download_ref": "...", "expires_at": "2024-01-02T09:00:00Z"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactId, TaskId, TaskStatus, WorkerFailure};
use crate::registry::TaskRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<WorkerFailure>,

    /// Present while the artifact can still be fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_ref: Option<ArtifactId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&TaskRecord> for TaskStatusView {
    fn from(record: &TaskRecord) -> Self {
        let download_ref = match (&record.result, record.purged_at) {
            (Some(artifact), None) => Some(artifact.artifact_id),
            _ => None,
        };
        Self {
            task_id: record.id,
            status: record.status,
            progress: record.progress,
            error: record.error.clone(),
            download_ref,
            expires_at: record.expires_at,
        }
    }
}

impl From<TaskRecord> for TaskStatusView {
    fn from(record: TaskRecord) -> Self {
        Self::from(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, ActorId, ArtifactMeta, ArtifactRef, JobSpec, NodeId};
    use chrono::TimeZone;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            JobSpec::new("x.v1", NodeId::new(0), Action::View, serde_json::json!({})),
            ActorId::new("alice"),
            now,
        )
    }

    #[test]
    fn pending_view_has_no_download_fields() {
        let record = record();
        let json = serde_json::to_value(TaskStatusView::from(&record)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "task_id": record.id.as_ulid().to_string(),
                "status": "Pending",
                "progress": 0,
                "error": null,
            })
        );
    }

    #[test]
    fn completed_view_exposes_download_until_purged() {
        let mut record = record();
        let expires_at = record.created_at + chrono::Duration::hours(24);
        let artifact_id = ArtifactId::from_ulid(Ulid::new());
        record.status = TaskStatus::Completed;
        record.progress = 100;
        record.expires_at = Some(expires_at);
        record.result = Some(ArtifactRef {
            artifact_id,
            task_id: record.id,
            meta: ArtifactMeta {
                size: 10,
                content_type: "text/csv".into(),
                filename: "a.csv".into(),
            },
            expires_at,
        });

        let json = serde_json::to_value(TaskStatusView::from(&record)).unwrap();
        assert_eq!(json["status"], "Completed");
        assert_eq!(json["download_ref"], artifact_id.as_ulid().to_string());
        assert_eq!(json["expires_at"], "2024-01-02T09:00:00Z");

        record.purged_at = Some(expires_at);
        let view = TaskStatusView::from(&record);
        assert!(view.download_ref.is_none());
        assert_eq!(view.expires_at, Some(expires_at));
    }
}
