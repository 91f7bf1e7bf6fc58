mod api;
mod config;
mod error;
mod fingerprint;
mod manager;
mod progress;
mod slice;
mod task;
mod uploader;

pub const APP_NAME: &str = "PanDrive";

pub use api::{
    CompletionProbe, CredentialProvider, DuplicatePolicy, FILE_NAME_MAX_CHARS,
    ILLEGAL_NAME_CHARS, InMemoryUploadService, OpenApiClient, OpenApiConfig, SessionGrant,
    SessionRequest, SlicePush, SliceOutcome, StaticToken, UploadService, UploadSession,
};
pub use config::{ApiSettings, SETTINGS_SCHEMA_VERSION, Settings, TransferSettings};
pub use error::{Error, Result};
pub use fingerprint::{DIGEST_HEX_LEN, Fingerprinter, fingerprint_bytes, fingerprint_file};
pub use manager::UploadManager;
pub use progress::{ProgressSink, TaskUpdate};
pub use slice::{SlicePlan, SlicePlanIter, SliceSpec, read_slice};
pub use task::{UploadStatus, UploadTask};
pub use uploader::{
    RetryPolicy, UploadOptions, UploadOutcome, UploadRequest, run_upload_with,
};
