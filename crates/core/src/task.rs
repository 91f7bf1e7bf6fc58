use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadStatus {
    #[default]
    Pending,
    Hashing,
    Negotiating,
    Uploading,
    Completing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

/// Point-in-time view of one transfer, shaped for status rendering.
/// Written only by the task's own worker; shared read-only with callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub task_id: String,
    pub source_path: PathBuf,
    pub parent_id: u64,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub fingerprint: Option<String>,
    pub progress: u8,
    pub status: UploadStatus,
    pub remote_file_id: Option<u64>,
    pub error: Option<String>,
}

impl UploadTask {
    pub fn new(task_id: String, source_path: PathBuf, parent_id: u64) -> Self {
        Self {
            task_id,
            source_path,
            parent_id,
            file_name: None,
            file_size: None,
            fingerprint: None,
            progress: 0,
            status: UploadStatus::Pending,
            remote_file_id: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(UploadStatus::Completed.is_terminal());
        assert!(UploadStatus::Failed.is_terminal());
        for status in [
            UploadStatus::Pending,
            UploadStatus::Hashing,
            UploadStatus::Negotiating,
            UploadStatus::Uploading,
            UploadStatus::Completing,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn status_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::Negotiating).unwrap(),
            "\"negotiating\""
        );
        assert_eq!(
            serde_json::from_str::<UploadStatus>("\"completed\"").unwrap(),
            UploadStatus::Completed
        );
    }
}
