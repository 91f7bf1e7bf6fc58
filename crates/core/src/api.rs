use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::fingerprint::{DIGEST_HEX_LEN, fingerprint_bytes};
use crate::{Error, Result};

/// Characters the remote service refuses in file names.
pub const ILLEGAL_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '|', '"', '<', '>'];

pub const FILE_NAME_MAX_CHARS: usize = 255;

// Non-zero wire codes the service uses for try-again-later responses.
const TRANSIENT_CODES: &[i64] = &[5066];

const CREATE_TIMEOUT: Duration = Duration::from_secs(15);
const SLICE_TIMEOUT: Duration = Duration::from_secs(30);
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    KeepBoth,
    Overwrite,
}

impl DuplicatePolicy {
    fn wire_value(self) -> u8 {
        match self {
            DuplicatePolicy::KeepBoth => 1,
            DuplicatePolicy::Overwrite => 2,
        }
    }
}

/// Everything session negotiation needs; checked locally before any
/// network call is made.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub parent_id: u64,
    pub file_name: String,
    pub file_size: u64,
    pub fingerprint: String,
    pub duplicate: Option<DuplicatePolicy>,
}

impl SessionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.file_name.trim().is_empty() {
            return Err(Error::Validation {
                message: "file name must not be empty".to_string(),
            });
        }
        if self.file_name.chars().count() > FILE_NAME_MAX_CHARS {
            return Err(Error::Validation {
                message: format!("file name exceeds {FILE_NAME_MAX_CHARS} characters"),
            });
        }
        if let Some(c) = self.file_name.chars().find(|c| ILLEGAL_NAME_CHARS.contains(c)) {
            return Err(Error::Validation {
                message: format!("file name contains illegal character {c:?}"),
            });
        }
        if self.fingerprint.len() != DIGEST_HEX_LEN
            || !self.fingerprint.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::Validation {
                message: format!("fingerprint is not a {DIGEST_HEX_LEN}-char hex digest"),
            });
        }
        if self.file_size == 0 {
            return Err(Error::Validation {
                message: "file size must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub preupload_id: String,
    pub slice_size: u64,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum SessionGrant {
    Reused { file_id: u64 },
    Pending(UploadSession),
}

#[derive(Debug, Clone)]
pub enum SliceOutcome {
    Accepted,
    Verifying { message: String },
}

#[derive(Debug, Clone)]
pub enum CompletionProbe {
    Done { file_id: u64 },
    Verifying { message: String },
}

pub struct SlicePush<'a> {
    pub preupload_id: &'a str,
    pub seq: u32,
    pub fingerprint: &'a str,
    pub bytes: &'a [u8],
    pub server: &'a str,
}

pub trait UploadService: Send + Sync {
    fn create_session<'a>(
        &'a self,
        request: &'a SessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SessionGrant>> + Send + 'a>>;

    fn push_slice<'a>(
        &'a self,
        push: SlicePush<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<SliceOutcome>> + Send + 'a>>;

    fn check_complete<'a>(
        &'a self,
        preupload_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionProbe>> + Send + 'a>>;
}

/// Produces the bearer credential attached to every wire call.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Result<String>;
}

pub struct StaticToken(pub String);

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub struct OpenApiConfig {
    pub base_url: String,
}

pub struct OpenApiClient {
    config: OpenApiConfig,
    credentials: Arc<dyn CredentialProvider>,
    client: reqwest::Client,
}

impl OpenApiClient {
    pub fn new(config: OpenApiConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            config,
            credentials,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
        timeout: Duration,
    ) -> Result<ApiEnvelope<T>> {
        let token = self.credentials.bearer_token()?;
        let res = self
            .client
            .post(url)
            .bearer_auth(token)
            .header("Platform", "open_platform")
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::Transport {
                message: format!("request failed: {e}"),
            })?;
        Self::read_envelope(res).await
    }

    async fn read_envelope<T: DeserializeOwned>(res: reqwest::Response) -> Result<ApiEnvelope<T>> {
        let status = res.status();
        let body = res.text().await.map_err(|e| Error::Transport {
            message: format!("read response failed: {e}"),
        })?;
        if !status.is_success() {
            return Err(Error::Transport {
                message: format!("http {status}: {body}"),
            });
        }
        serde_json::from_str(&body).map_err(|e| Error::Transport {
            message: format!("invalid json: {e}; body={body}"),
        })
    }
}

impl UploadService for OpenApiClient {
    fn create_session<'a>(
        &'a self,
        request: &'a SessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SessionGrant>> + Send + 'a>> {
        Box::pin(async move {
            request.validate()?;

            let body = CreateFileBody {
                parent_file_id: request.parent_id,
                filename: &request.file_name,
                etag: &request.fingerprint,
                size: request.file_size,
                duplicate: request.duplicate.map(DuplicatePolicy::wire_value),
            };
            let envelope: ApiEnvelope<CreateFileData> = self
                .post_json(self.endpoint("/upload/v2/file/create"), &body, CREATE_TIMEOUT)
                .await?;

            if envelope.code != 0 {
                return Err(Error::Protocol {
                    code: envelope.code,
                    message: envelope.message_or("create file failed"),
                });
            }
            let data = envelope.data.ok_or_else(|| Error::Transport {
                message: "create response carried no data".to_string(),
            })?;

            if data.reuse {
                return Ok(SessionGrant::Reused {
                    file_id: data.file_id,
                });
            }
            if data.preupload_id.is_empty() || data.slice_size == 0 || data.servers.is_empty() {
                return Err(Error::Transport {
                    message: "create response missing session fields".to_string(),
                });
            }
            Ok(SessionGrant::Pending(UploadSession {
                preupload_id: data.preupload_id,
                slice_size: data.slice_size,
                servers: data.servers,
            }))
        })
    }

    fn push_slice<'a>(
        &'a self,
        push: SlicePush<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<SliceOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let token = self.credentials.bearer_token()?;
            let url = format!("{}/upload/v2/file/slice", push.server.trim_end_matches('/'));

            let part = reqwest::multipart::Part::bytes(push.bytes.to_vec())
                .file_name(format!("part{}.bin", push.seq))
                .mime_str("application/octet-stream")
                .map_err(|e| Error::Transport {
                    message: format!("slice part encode failed: {e}"),
                })?;
            let form = reqwest::multipart::Form::new()
                .text("preuploadID", push.preupload_id.to_string())
                .text("sliceNo", push.seq.to_string())
                .text("sliceMD5", push.fingerprint.to_string())
                .part("slice", part);

            let res = self
                .client
                .post(url)
                .bearer_auth(token)
                .header("Platform", "open_platform")
                .multipart(form)
                .timeout(SLICE_TIMEOUT)
                .send()
                .await
                .map_err(|e| Error::Transport {
                    message: format!("request failed: {e}"),
                })?;
            let envelope: ApiEnvelope<serde_json::Value> = Self::read_envelope(res).await?;

            match envelope.code {
                0 => Ok(SliceOutcome::Accepted),
                code if TRANSIENT_CODES.contains(&code) => Ok(SliceOutcome::Verifying {
                    message: envelope.message_or("slice is being verified"),
                }),
                code => Err(Error::Protocol {
                    code,
                    message: envelope.message_or("slice upload failed"),
                }),
            }
        })
    }

    fn check_complete<'a>(
        &'a self,
        preupload_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionProbe>> + Send + 'a>> {
        Box::pin(async move {
            let body = CompleteBody { preupload_id };
            let envelope: ApiEnvelope<CompleteData> = self
                .post_json(
                    self.endpoint("/upload/v2/file/upload_complete"),
                    &body,
                    COMPLETE_TIMEOUT,
                )
                .await?;

            if envelope.code != 0 {
                if TRANSIENT_CODES.contains(&envelope.code) {
                    return Ok(CompletionProbe::Verifying {
                        message: envelope.message_or("file is being verified"),
                    });
                }
                return Err(Error::Protocol {
                    code: envelope.code,
                    message: envelope.message_or("upload completion failed"),
                });
            }
            let data = envelope.data.clone().ok_or_else(|| Error::Transport {
                message: "complete response carried no data".to_string(),
            })?;

            if data.completed && data.file_id != 0 {
                Ok(CompletionProbe::Done {
                    file_id: data.file_id,
                })
            } else if !data.completed {
                Ok(CompletionProbe::Verifying {
                    message: envelope.message_or("file is being verified"),
                })
            } else {
                Err(Error::Protocol {
                    code: 0,
                    message: "completion reported without a file id".to_string(),
                })
            }
        })
    }
}

/// In-process stand-in for the remote service: grants sessions, stores
/// received slices, dedups by fingerprint and completes after a
/// configurable number of verification probes.
pub struct InMemoryUploadService {
    pub create_calls: AtomicUsize,
    pub slice_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    slice_size: u64,
    verify_probes: u32,
    next_file_id: AtomicU64,
    known: Mutex<HashMap<String, u64>>,
    sessions: Mutex<HashMap<String, MemSession>>,
}

struct MemSession {
    fingerprint: String,
    file_size: u64,
    received: HashMap<u32, u64>,
    polls: u32,
    file_id: u64,
}

impl InMemoryUploadService {
    pub fn new(slice_size: u64) -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            slice_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            slice_size,
            verify_probes: 0,
            next_file_id: AtomicU64::new(1),
            known: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of "still verifying" completion probes before a session
    /// reports done.
    pub fn with_verify_probes(mut self, probes: u32) -> Self {
        self.verify_probes = probes;
        self
    }

    pub async fn knows_fingerprint(&self, fingerprint: &str) -> bool {
        self.known.lock().await.contains_key(fingerprint)
    }
}

impl UploadService for InMemoryUploadService {
    fn create_session<'a>(
        &'a self,
        request: &'a SessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SessionGrant>> + Send + 'a>> {
        Box::pin(async move {
            self.create_calls.fetch_add(1, Ordering::Relaxed);
            request.validate()?;

            if let Some(file_id) = self.known.lock().await.get(&request.fingerprint) {
                return Ok(SessionGrant::Reused { file_id: *file_id });
            }

            let preupload_id = format!("pre_{}", uuid::Uuid::new_v4());
            self.sessions.lock().await.insert(
                preupload_id.clone(),
                MemSession {
                    fingerprint: request.fingerprint.clone(),
                    file_size: request.file_size,
                    received: HashMap::new(),
                    polls: 0,
                    file_id: 0,
                },
            );
            Ok(SessionGrant::Pending(UploadSession {
                preupload_id,
                slice_size: self.slice_size,
                servers: vec!["http://upload.mem.local".to_string()],
            }))
        })
    }

    fn push_slice<'a>(
        &'a self,
        push: SlicePush<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<SliceOutcome>> + Send + 'a>> {
        Box::pin(async move {
            self.slice_calls.fetch_add(1, Ordering::Relaxed);

            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(push.preupload_id).ok_or_else(|| Error::Protocol {
                code: 1,
                message: format!("unknown preuploadID: {}", push.preupload_id),
            })?;

            if fingerprint_bytes(push.bytes) != push.fingerprint {
                return Err(Error::Protocol {
                    code: 2,
                    message: format!("slice {} digest mismatch", push.seq),
                });
            }
            session.received.insert(push.seq, push.bytes.len() as u64);
            Ok(SliceOutcome::Accepted)
        })
    }

    fn check_complete<'a>(
        &'a self,
        preupload_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionProbe>> + Send + 'a>> {
        Box::pin(async move {
            self.complete_calls.fetch_add(1, Ordering::Relaxed);

            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(preupload_id).ok_or_else(|| Error::Protocol {
                code: 1,
                message: format!("unknown preuploadID: {preupload_id}"),
            })?;

            session.polls += 1;
            let received: u64 = session.received.values().sum();
            if session.polls <= self.verify_probes || received != session.file_size {
                return Ok(CompletionProbe::Verifying {
                    message: "file is being verified, retry shortly".to_string(),
                });
            }

            if session.file_id == 0 {
                session.file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                self.known
                    .lock()
                    .await
                    .insert(session.fingerprint.clone(), session.file_id);
            }
            Ok(CompletionProbe::Done {
                file_id: session.file_id,
            })
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    fn message_or(&self, fallback: &str) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}

#[derive(Debug, Serialize)]
struct CreateFileBody<'a> {
    #[serde(rename = "parentFileID")]
    parent_file_id: u64,
    filename: &'a str,
    etag: &'a str,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct CreateFileData {
    #[serde(default)]
    reuse: bool,
    #[serde(rename = "fileID", default)]
    file_id: u64,
    #[serde(rename = "sliceSize", default)]
    slice_size: u64,
    #[serde(rename = "preuploadID", default)]
    preupload_id: String,
    #[serde(default)]
    servers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CompleteBody<'a> {
    #[serde(rename = "preuploadID")]
    preupload_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct CompleteData {
    #[serde(default)]
    completed: bool,
    #[serde(rename = "fileID", default)]
    file_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SessionRequest {
        SessionRequest {
            parent_id: 0,
            file_name: "report.pdf".to_string(),
            file_size: 1024,
            fingerprint: "a".repeat(DIGEST_HEX_LEN),
            duplicate: None,
        }
    }

    #[test]
    fn accepts_a_legal_request() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn rejects_empty_and_blank_names() {
        for name in ["", "   "] {
            let mut req = request();
            req.file_name = name.to_string();
            assert!(matches!(req.validate(), Err(Error::Validation { .. })));
        }
    }

    #[test]
    fn rejects_overlong_name() {
        let mut req = request();
        req.file_name = "x".repeat(FILE_NAME_MAX_CHARS + 1);
        assert!(matches!(req.validate(), Err(Error::Validation { .. })));

        req.file_name = "x".repeat(FILE_NAME_MAX_CHARS);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn rejects_every_illegal_character() {
        for c in ILLEGAL_NAME_CHARS {
            let mut req = request();
            req.file_name = format!("bad{c}name");
            assert!(
                matches!(req.validate(), Err(Error::Validation { .. })),
                "expected {c:?} to be rejected"
            );
        }
    }

    #[test]
    fn rejects_malformed_fingerprints() {
        let too_long = "a".repeat(DIGEST_HEX_LEN + 2);
        let non_hex = "z".repeat(DIGEST_HEX_LEN);
        for fp in ["", "abc123", too_long.as_str(), non_hex.as_str()] {
            let mut req = request();
            req.fingerprint = fp.to_string();
            assert!(matches!(req.validate(), Err(Error::Validation { .. })));
        }
    }

    #[test]
    fn rejects_zero_size() {
        let mut req = request();
        req.file_size = 0;
        assert!(matches!(req.validate(), Err(Error::Validation { .. })));
    }

    #[test]
    fn create_response_parses_both_shapes() {
        let reused: ApiEnvelope<CreateFileData> = serde_json::from_str(
            r#"{"code":0,"message":"ok","data":{"reuse":true,"fileID":991}}"#,
        )
        .unwrap();
        let data = reused.data.unwrap();
        assert!(data.reuse);
        assert_eq!(data.file_id, 991);

        let pending: ApiEnvelope<CreateFileData> = serde_json::from_str(
            r#"{"code":0,"data":{"reuse":false,"preuploadID":"pre_1","sliceSize":4194304,
                "servers":["http://openapi-upload.example.com"]}}"#,
        )
        .unwrap();
        let data = pending.data.unwrap();
        assert_eq!(data.slice_size, 4 * 1024 * 1024);
        assert_eq!(data.preupload_id, "pre_1");
        assert_eq!(data.servers.len(), 1);
    }

    #[test]
    fn create_body_uses_exact_wire_names() {
        let body = CreateFileBody {
            parent_file_id: 7,
            filename: "a.bin",
            etag: "00ff",
            size: 9,
            duplicate: Some(2),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["parentFileID"], 7);
        assert_eq!(json["filename"], "a.bin");
        assert_eq!(json["etag"], "00ff");
        assert_eq!(json["size"], 9);
        assert_eq!(json["duplicate"], 2);
    }

    #[test]
    fn duplicate_is_omitted_when_unset() {
        let body = CreateFileBody {
            parent_file_id: 0,
            filename: "a.bin",
            etag: "00ff",
            size: 9,
            duplicate: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("duplicate").is_none());
    }
}
