//! In-memory object store with failure and latency injection.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use objstore_core::storage::constants::DEFAULT_CHECKSUM_HEADER;
use objstore_core::storage::{
    Body, ByteRange, ObjectRequest, ObjectResponse, Operation, RequestExecutor, TransferError,
};
use objstore_core::ClientConfig;
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};

/// Which requests a fault or delay applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Any request of this operation.
    Operation(&'static str),
    /// UploadPart with this part number.
    Part(u32),
    /// Ranged GetObject starting at this offset.
    RangeStart(u64),
}

impl Target {
    fn matches(&self, request: &ObjectRequest) -> bool {
        match (self, &request.operation) {
            (Self::Operation(name), operation) => operation.name() == *name,
            (Self::Part(number), Operation::UploadPart { part_number, .. }) => {
                number == part_number
            }
            (
                Self::RangeStart(start),
                Operation::GetObject {
                    range: Some(range),
                },
            ) => range.start == *start,
            _ => false,
        }
    }
}

/// Injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Respond with this status.
    Status(u16),
    /// Fail with a transport error.
    Transport,
}

#[derive(Debug)]
struct Injected<T> {
    target: Target,
    value: T,
    remaining: u32,
}

/// One executed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: &'static str,
    pub key: String,
    pub part_number: Option<u32>,
    pub range: Option<ByteRange>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, Bytes>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    calls: Vec<Call>,
    part_finish_order: Vec<u32>,
    completed: Vec<Vec<u32>>,
    aborted: Vec<String>,
    faults: Vec<Injected<Fault>>,
    delays: Vec<Injected<Duration>>,
    head_lengths: HashMap<String, u64>,
    omit_checksum: bool,
}

/// Object store kept in memory.
///
/// HEAD reports `Content-Length`, an ETag and the SHA-256 of the content in
/// the default checksum header.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

#[allow(dead_code)]
impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, content: impl Into<Bytes>) {
        self.lock().objects.insert(key.to_string(), content.into());
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).cloned()
    }

    /// Fails the next `times` matching requests.
    pub fn fail(&self, target: Target, fault: Fault, times: u32) {
        self.lock().faults.push(Injected {
            target,
            value: fault,
            remaining: times,
        });
    }

    /// Delays every matching request.
    pub fn delay(&self, target: Target, delay: Duration) {
        self.lock().delays.push(Injected {
            target,
            value: delay,
            remaining: u32::MAX,
        });
    }

    /// Removes every injected delay.
    pub fn clear_delays(&self) {
        self.lock().delays.clear();
    }

    /// Makes HEAD on `key` report `length` instead of the real length.
    pub fn misreport_length(&self, key: &str, length: u64) {
        self.lock().head_lengths.insert(key.to_string(), length);
    }

    /// Stops sending the checksum header.
    pub fn omit_checksum(&self) {
        self.lock().omit_checksum = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// Part numbers in the order their UploadPart finished.
    pub fn part_finish_order(&self) -> Vec<u32> {
        self.lock().part_finish_order.clone()
    }

    /// Part lists sent with each CompleteMultipartUpload.
    pub fn completed(&self) -> Vec<Vec<u32>> {
        self.lock().completed.clone()
    }

    /// Upload ids that were aborted.
    pub fn aborted(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn admit(&self, request: &ObjectRequest) -> (Option<Duration>, Option<Fault>) {
        let mut state = self.lock();
        let (part_number, range) = match &request.operation {
            Operation::UploadPart { part_number, .. } => (Some(*part_number), None),
            Operation::GetObject { range } => (None, *range),
            _ => (None, None),
        };
        state.calls.push(Call {
            operation: request.operation.name(),
            key: request.key.clone(),
            part_number,
            range,
        });

        let delay = take_match(&mut state.delays, request);
        let fault = take_match(&mut state.faults, request);
        (delay, fault)
    }

    fn respond(&self, request: ObjectRequest, content: Bytes) -> ObjectResponse {
        let mut state = self.lock();
        let key = request.key;
        match request.operation {
            Operation::HeadObject => match state.objects.get(&key) {
                Some(object) => {
                    let length = state
                        .head_lengths
                        .get(&key)
                        .copied()
                        .unwrap_or(object.len() as u64);
                    let mut headers = etag_headers(object);
                    insert(&mut headers, CONTENT_LENGTH.as_str(), &length.to_string());
                    if !state.omit_checksum {
                        insert(&mut headers, DEFAULT_CHECKSUM_HEADER, &checksum(object));
                    }
                    response(200, headers, Body::Empty)
                }
                None => not_found(),
            },
            Operation::CheckObjectExist => match state.objects.get(&key) {
                Some(_) => response(200, HeaderMap::new(), Body::Empty),
                None => not_found(),
            },
            Operation::GetObject { range } => match state.objects.get(&key) {
                Some(object) => {
                    let slice = match range {
                        Some(range) => {
                            let start = usize::try_from(range.start).unwrap_or(usize::MAX);
                            let end = usize::try_from(range.end)
                                .unwrap_or(usize::MAX)
                                .saturating_add(1)
                                .min(object.len());
                            if start >= object.len() {
                                return response(416, HeaderMap::new(), Body::Empty);
                            }
                            object.slice(start..end)
                        }
                        None => object.clone(),
                    };
                    response(200, etag_headers(object), Body::Bytes(slice))
                }
                None => not_found(),
            },
            Operation::PutObject { .. } => {
                let headers = etag_headers(&content);
                state.objects.insert(key, content);
                response(200, headers, Body::Empty)
            }
            Operation::InitiateMultipartUpload { .. } => {
                state.next_upload += 1;
                let upload_id = format!("upload-{}", state.next_upload);
                state.uploads.insert(
                    upload_id.clone(),
                    PendingUpload {
                        key,
                        parts: BTreeMap::new(),
                    },
                );
                let body = format!(
                    "<InitiateMultipartUploadResult><UploadId>{upload_id}</UploadId></InitiateMultipartUploadResult>"
                );
                response(200, HeaderMap::new(), Body::Bytes(Bytes::from(body)))
            }
            Operation::UploadPart {
                upload_id,
                part_number,
            } => {
                let headers = etag_headers(&content);
                let Some(upload) = state.uploads.get_mut(&upload_id) else {
                    return not_found();
                };
                upload.parts.insert(part_number, content);
                state.part_finish_order.push(part_number);
                response(200, headers, Body::Empty)
            }
            Operation::CompleteMultipartUpload { upload_id, parts } => {
                let Some(upload) = state.uploads.remove(&upload_id) else {
                    return not_found();
                };
                let mut assembled = Vec::new();
                for part in &parts {
                    match upload.parts.get(&part.part_number) {
                        Some(bytes) => assembled.extend_from_slice(bytes),
                        None => return response(400, HeaderMap::new(), Body::Empty),
                    }
                }
                state
                    .completed
                    .push(parts.iter().map(|part| part.part_number).collect());
                let assembled = Bytes::from(assembled);
                let headers = etag_headers(&assembled);
                state.objects.insert(upload.key, assembled);
                response(200, headers, Body::Empty)
            }
            Operation::AbortMultipartUpload { upload_id } => {
                if state.uploads.remove(&upload_id).is_none() {
                    return not_found();
                }
                state.aborted.push(upload_id);
                response(204, HeaderMap::new(), Body::Empty)
            }
            Operation::CopyObject { source_key } => match state.objects.get(&source_key).cloned() {
                Some(object) => {
                    let headers = etag_headers(&object);
                    state.objects.insert(key, object);
                    response(200, headers, Body::Empty)
                }
                None => not_found(),
            },
            Operation::DeleteObject => {
                if state.objects.remove(&key).is_none() {
                    return not_found();
                }
                response(204, HeaderMap::new(), Body::Empty)
            }
        }
    }
}

#[async_trait]
impl RequestExecutor for MemoryBackend {
    async fn execute(&self, mut request: ObjectRequest) -> Result<ObjectResponse, TransferError> {
        let (delay, fault) = self.admit(&request);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match fault {
            Some(Fault::Transport) => {
                return Err(TransferError::transport(
                    request.operation.name(),
                    request.key.as_str(),
                    std::io::Error::new(std::io::ErrorKind::ConnectionReset, "injected reset"),
                ));
            }
            Some(Fault::Status(status)) => return Ok(response(status, HeaderMap::new(), Body::Empty)),
            None => {}
        }

        let content = std::mem::replace(&mut request.body, Body::Empty)
            .collect()
            .await?;
        Ok(self.respond(request, content))
    }
}

fn take_match<T: Copy>(injected: &mut Vec<Injected<T>>, request: &ObjectRequest) -> Option<T> {
    let position = injected
        .iter()
        .position(|entry| entry.remaining > 0 && entry.target.matches(request))?;
    let entry = &mut injected[position];
    if entry.remaining != u32::MAX {
        entry.remaining -= 1;
    }
    Some(entry.value)
}

fn response(status: u16, headers: HeaderMap, body: Body) -> ObjectResponse {
    ObjectResponse {
        status,
        headers,
        body,
    }
}

fn not_found() -> ObjectResponse {
    response(404, HeaderMap::new(), Body::Empty)
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

fn etag_headers(content: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let digest = checksum(content);
    insert(&mut headers, ETAG.as_str(), &format!("\"{}\"", &digest[..16]));
    headers
}

/// Hex SHA-256, as reported in the checksum header.
pub fn checksum(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Deterministic test content.
#[allow(dead_code)]
pub fn pattern(length: usize) -> Bytes {
    (0..length)
        .map(|i| u8::try_from((i * 31 + i / 251) % 251).unwrap_or(0))
        .collect::<Vec<u8>>()
        .into()
}

/// Small part sizes and fast timings for tests.
#[allow(dead_code)]
pub fn test_config(scratch_dir: &Path) -> ClientConfig {
    ClientConfig {
        multipart_threshold: 1024,
        min_upload_part_size: 1024,
        upload_workers: 4,
        download_multipart_threshold: 1024,
        min_download_part_size: 1024,
        download_workers: 4,
        download_task_interval_ms: 1,
        fast_fallback_timeout_ms: 2_000,
        chunk_read_timeout_ms: 5_000,
        download_qps: 0,
        part_retry_attempts: 3,
        retry_base_delay_ms: 0,
        cleanup_delay_ms: 5,
        scratch_dir: scratch_dir.to_path_buf(),
        ..ClientConfig::default()
    }
}
