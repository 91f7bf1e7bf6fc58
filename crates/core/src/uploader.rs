use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{
    CompletionProbe, DuplicatePolicy, SessionGrant, SessionRequest, SlicePush, SliceOutcome,
    UploadService,
};
use crate::fingerprint::{fingerprint_bytes, fingerprint_file};
use crate::progress::{ProgressSink, TaskUpdate};
use crate::slice::{SlicePlan, SliceSpec, read_slice};
use crate::task::UploadStatus;
use crate::{Error, Result};

const HASH_DONE_PROGRESS: u8 = 5;

/// Retry behaviour for the two transient-failure loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: Duration,
    pub slice_attempts: u32,
    pub completion_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            slice_attempts: 60,
            completion_attempts: 180,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.slice_attempts == 0 || self.completion_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "retry attempt bounds must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub task_id: String,
    pub source_path: PathBuf,
    pub parent_id: u64,
    pub duplicate: Option<DuplicatePolicy>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOutcome {
    pub file_id: Option<u64>,
    pub reused: bool,
    pub slices_sent: u32,
    pub bytes_sent: u64,
    /// False only when the completion poll bound was exhausted and the
    /// upload was assumed complete without server confirmation.
    pub confirmed: bool,
}

#[derive(Default)]
pub struct UploadOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub sink: Option<&'a dyn ProgressSink>,
}

/// Drives one task's full state machine. Every terminal outcome, error
/// included, is also emitted through the sink.
pub async fn run_upload_with<S: UploadService + ?Sized>(
    service: &S,
    request: UploadRequest,
    policy: &RetryPolicy,
    options: UploadOptions<'_>,
) -> Result<UploadOutcome> {
    policy.validate()?;
    let mut tracker = ProgressTracker {
        task_id: &request.task_id,
        sink: options.sink,
        progress: 0,
    };
    match drive(service, &request, policy, options.cancel, &mut tracker).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            tracker.emit_error(e.to_string());
            Err(e)
        }
    }
}

async fn drive<S: UploadService + ?Sized>(
    service: &S,
    request: &UploadRequest,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    tracker: &mut ProgressTracker<'_>,
) -> Result<UploadOutcome> {
    debug!(
        event = "upload.start",
        task_id = %request.task_id,
        path = %request.source_path.display(),
        parent_id = request.parent_id,
        "upload.start"
    );
    tracker.emit(UploadStatus::Hashing);

    let file_name = request
        .source_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Validation {
            message: format!(
                "source path has no usable file name: {}",
                request.source_path.display()
            ),
        })?;
    let file_size = std::fs::metadata(&request.source_path)?.len();
    let fingerprint = fingerprint_file(&request.source_path)?;

    tracker.bump(HASH_DONE_PROGRESS);
    let session_request = SessionRequest {
        parent_id: request.parent_id,
        file_name,
        file_size,
        fingerprint,
        duplicate: request.duplicate,
    };
    tracker.emit_derived(UploadStatus::Negotiating, &session_request);

    // Checked here so an illegal request never reaches the wire.
    session_request.validate()?;

    let session = match service.create_session(&session_request).await? {
        SessionGrant::Reused { file_id } => {
            debug!(
                event = "upload.deduped",
                task_id = %request.task_id,
                file_id,
                "upload.deduped"
            );
            tracker.bump(100);
            tracker.emit_completed(Some(file_id));
            return Ok(UploadOutcome {
                file_id: Some(file_id),
                reused: true,
                confirmed: true,
                ..UploadOutcome::default()
            });
        }
        SessionGrant::Pending(session) => session,
    };

    tracker.emit(UploadStatus::Uploading);

    let plan = SlicePlan::new(session.slice_size, file_size)?;
    let total = plan.total();
    let server = session.servers.first().ok_or_else(|| Error::Transport {
        message: "no upload endpoints negotiated".to_string(),
    })?;

    debug!(
        event = "upload.session",
        task_id = %request.task_id,
        slice_size = session.slice_size,
        slices = total,
        servers = session.servers.len(),
        "upload.session"
    );

    let mut file = File::open(&request.source_path)?;
    let mut outcome = UploadOutcome::default();

    for spec in plan.iter() {
        check_cancelled(cancel)?;
        let bytes = read_slice(&mut file, &spec)?;
        let slice_fingerprint = fingerprint_bytes(&bytes);
        push_slice_with_retry(
            service,
            policy,
            cancel,
            &request.task_id,
            &session.preupload_id,
            &spec,
            &bytes,
            &slice_fingerprint,
            server,
        )
        .await?;
        outcome.slices_sent += 1;
        outcome.bytes_sent += spec.len;
        tracker.bump(slice_progress(spec.seq, total));
        tracker.emit(UploadStatus::Uploading);
    }

    tracker.emit(UploadStatus::Completing);

    for attempt in 1..=policy.completion_attempts {
        check_cancelled(cancel)?;
        match service.check_complete(&session.preupload_id).await? {
            CompletionProbe::Done { file_id } => {
                debug!(
                    event = "upload.completed",
                    task_id = %request.task_id,
                    file_id,
                    slices = outcome.slices_sent,
                    bytes = outcome.bytes_sent,
                    "upload.completed"
                );
                tracker.bump(100);
                tracker.emit_completed(Some(file_id));
                outcome.file_id = Some(file_id);
                outcome.confirmed = true;
                return Ok(outcome);
            }
            CompletionProbe::Verifying { message } => {
                debug!(
                    event = "upload.poll_retry",
                    task_id = %request.task_id,
                    attempt,
                    message = %message,
                    "upload.poll_retry"
                );
                tracker.bump(synthetic_poll_progress(attempt));
                tracker.emit(UploadStatus::Completing);
                if attempt < policy.completion_attempts {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }

    // Poll bound exhausted without a definitive failure: every slice was
    // accepted, so the session is assumed complete without a confirmed
    // file id.
    warn!(
        event = "upload.assumed_complete",
        task_id = %request.task_id,
        attempts = policy.completion_attempts,
        "upload.assumed_complete"
    );
    tracker.bump(100);
    tracker.emit_completed(None);
    Ok(outcome)
}

async fn push_slice_with_retry<S: UploadService + ?Sized>(
    service: &S,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    task_id: &str,
    preupload_id: &str,
    spec: &SliceSpec,
    bytes: &[u8],
    slice_fingerprint: &str,
    server: &str,
) -> Result<()> {
    for attempt in 1..=policy.slice_attempts {
        check_cancelled(cancel)?;
        let outcome = service
            .push_slice(SlicePush {
                preupload_id,
                seq: spec.seq,
                fingerprint: slice_fingerprint,
                bytes,
                server,
            })
            .await?;
        match outcome {
            SliceOutcome::Accepted => return Ok(()),
            SliceOutcome::Verifying { message } => {
                debug!(
                    event = "upload.slice_retry",
                    task_id,
                    seq = spec.seq,
                    attempt,
                    message = %message,
                    "upload.slice_retry"
                );
                if attempt < policy.slice_attempts {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }
    Err(Error::Timeout {
        what: "slice upload",
        attempts: policy.slice_attempts,
    })
}

fn slice_progress(seq: u32, total: u32) -> u8 {
    (f64::from(HASH_DONE_PROGRESS) + f64::from(seq) / f64::from(total) * 95.0).round() as u8
}

// Keeps the bar moving while the server verifies; advances toward but
// never reaches 99 and is never authoritative.
fn synthetic_poll_progress(attempt: u32) -> u8 {
    90 + attempt.min(8) as u8
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    if let Some(token) = cancel
        && token.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

struct ProgressTracker<'a> {
    task_id: &'a str,
    sink: Option<&'a dyn ProgressSink>,
    progress: u8,
}

impl ProgressTracker<'_> {
    // Monotonic clamp: recorded progress never decreases within a task.
    fn bump(&mut self, candidate: u8) {
        self.progress = self.progress.max(candidate.min(100));
    }

    fn emit(&self, status: UploadStatus) {
        self.send(TaskUpdate {
            task_id: self.task_id.to_string(),
            status,
            progress: self.progress,
            ..TaskUpdate::default()
        });
    }

    fn emit_derived(&self, status: UploadStatus, request: &SessionRequest) {
        self.send(TaskUpdate {
            task_id: self.task_id.to_string(),
            status,
            progress: self.progress,
            file_name: Some(request.file_name.clone()),
            file_size: Some(request.file_size),
            fingerprint: Some(request.fingerprint.clone()),
            ..TaskUpdate::default()
        });
    }

    fn emit_completed(&self, remote_file_id: Option<u64>) {
        self.send(TaskUpdate {
            task_id: self.task_id.to_string(),
            status: UploadStatus::Completed,
            progress: self.progress,
            remote_file_id,
            ..TaskUpdate::default()
        });
    }

    fn emit_error(&self, message: String) {
        self.send(TaskUpdate {
            task_id: self.task_id.to_string(),
            status: UploadStatus::Failed,
            progress: self.progress,
            error: Some(message),
            ..TaskUpdate::default()
        });
    }

    fn send(&self, update: TaskUpdate) {
        if let Some(sink) = self.sink {
            sink.on_update(update);
        }
    }
}
