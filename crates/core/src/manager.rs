use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::api::{DuplicatePolicy, UploadService};
use crate::progress::{ProgressSink, TaskUpdate};
use crate::task::{UploadStatus, UploadTask};
use crate::uploader::{RetryPolicy, UploadOptions, UploadRequest, run_upload_with};

struct TaskEntry {
    snapshot: UploadTask,
    cancel: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<String, TaskEntry>>>;

/// Shared registry of upload tasks plus the workers that drive them.
/// Each submitted task gets one worker running its whole state machine;
/// the worker is the only writer of that task's snapshot. List-level
/// add/remove/iterate are serialized by the registry lock.
pub struct UploadManager {
    service: Arc<dyn UploadService>,
    policy: RetryPolicy,
    sink: Option<Arc<dyn ProgressSink>>,
    registry: Registry,
}

impl UploadManager {
    pub fn new(service: Arc<dyn UploadService>, policy: RetryPolicy) -> Self {
        Self {
            service,
            policy,
            sink: None,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Notification sink receiving every task's updates.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn submit(
        &self,
        source_path: PathBuf,
        parent_id: u64,
        duplicate: Option<DuplicatePolicy>,
    ) -> String {
        let task_id = format!("tsk_{}", uuid::Uuid::new_v4());
        let cancel = CancellationToken::new();
        let task = UploadTask::new(task_id.clone(), source_path.clone(), parent_id);

        lock(&self.registry).insert(
            task_id.clone(),
            TaskEntry {
                snapshot: task,
                cancel: cancel.clone(),
            },
        );
        let sink = RegistrySink {
            registry: Arc::clone(&self.registry),
            forward: self.sink.clone(),
        };
        sink.forward_only(TaskUpdate {
            task_id: task_id.clone(),
            status: UploadStatus::Pending,
            ..TaskUpdate::default()
        });
        debug!(
            event = "task.submitted",
            task_id = %task_id,
            path = %source_path.display(),
            "task.submitted"
        );

        let service = Arc::clone(&self.service);
        let policy = self.policy.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            let request = UploadRequest {
                task_id: id.clone(),
                source_path,
                parent_id,
                duplicate,
            };
            let options = UploadOptions {
                cancel: Some(&cancel),
                sink: Some(&sink),
            };
            if let Err(e) = run_upload_with(service.as_ref(), request, &policy, options).await {
                error!(event = "task.failed", task_id = %id, error = %e, "task.failed");
            }
        });

        task_id
    }

    pub fn task(&self, task_id: &str) -> Option<UploadTask> {
        lock(&self.registry).get(task_id).map(|e| e.snapshot.clone())
    }

    pub fn status(&self, task_id: &str) -> Option<UploadStatus> {
        lock(&self.registry).get(task_id).map(|e| e.snapshot.status)
    }

    pub fn tasks(&self) -> Vec<UploadTask> {
        lock(&self.registry)
            .values()
            .map(|e| e.snapshot.clone())
            .collect()
    }

    /// Requests cancellation; the worker stops at its next check between
    /// slices or retry attempts.
    pub fn cancel(&self, task_id: &str) -> bool {
        if let Some(entry) = lock(&self.registry).get(task_id) {
            entry.cancel.cancel();
            return true;
        }
        false
    }

    /// Removes a terminal task from the list. Running tasks stay; cancel
    /// them first.
    pub fn remove(&self, task_id: &str) -> bool {
        let mut registry = lock(&self.registry);
        match registry.get(task_id) {
            Some(entry) if entry.snapshot.status.is_terminal() => {
                registry.remove(task_id);
                true
            }
            _ => false,
        }
    }
}

struct RegistrySink {
    registry: Registry,
    forward: Option<Arc<dyn ProgressSink>>,
}

impl RegistrySink {
    fn forward_only(&self, update: TaskUpdate) {
        if let Some(sink) = &self.forward {
            sink.on_update(update);
        }
    }
}

impl ProgressSink for RegistrySink {
    fn on_update(&self, update: TaskUpdate) {
        if let Some(entry) = lock(&self.registry).get_mut(&update.task_id) {
            let snapshot = &mut entry.snapshot;
            snapshot.status = update.status;
            snapshot.progress = update.progress;
            if update.file_name.is_some() {
                snapshot.file_name = update.file_name.clone();
            }
            if update.file_size.is_some() {
                snapshot.file_size = update.file_size;
            }
            if update.fingerprint.is_some() {
                snapshot.fingerprint = update.fingerprint.clone();
            }
            if update.remote_file_id.is_some() {
                snapshot.remote_file_id = update.remote_file_id;
            }
            snapshot.error = update.error.clone();
        }
        self.forward_only(update);
    }
}

fn lock(registry: &Mutex<HashMap<String, TaskEntry>>) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}
