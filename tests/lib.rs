//! Shared fixtures for tos-transfer integration tests
//!
//! [`MockObjectService`] is an in-memory object store speaking the request
//! shapes the engine produces (simple and multipart uploads, ranged
//! downloads) with scriptable faults and latency. [`RecordingSigner`] records
//! every signing call, and [`EventLog`] captures everything a transfer emits.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_LENGTH, ETAG, HeaderMap, HeaderValue, IF_MATCH, LAST_MODIFIED, RANGE};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tos_transfer_core::{
    DataTransferEvent, HEADER_CRC64, ObjectRequest, ObjectResponse, PartEvent, RequestBody,
    ResponseBody, Result, Signer, TransferControl, TransferError, TransferProgress, Transport,
};
use tos_transfer_files::crc64;

/// Chunk size of streamed `GET` bodies
const RESPONSE_CHUNK: usize = 16 * 1024;

/// Install a test tracing subscriber once; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 251) as u8).collect()
}

/// Which requests a [`Fault`] applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Any request
    Any,
    /// Requests with this method
    Method(Method),
    /// Upload of this one-based part number
    UploadPart(u32),
    /// Ranged download starting at this offset
    RangeFrom(u64),
    /// Complete-multipart request
    Complete,
}

/// How a matched request fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Respond with this status
    Status(u16),
    /// Fail at the network level
    Reset,
    /// Answer normally but never deliver the body
    Stall,
}

/// A scripted failure for the next `times` matching requests
#[derive(Debug, Clone)]
pub struct Fault {
    /// Matched requests
    pub target: Target,
    /// Failure mode
    pub kind: FaultKind,
    /// Remaining failures
    pub times: u32,
}

impl Fault {
    /// Fail `times` matching requests with `status`
    pub fn status(target: Target, status: u16, times: u32) -> Self {
        Self {
            target,
            kind: FaultKind::Status(status),
            times,
        }
    }

    /// Reset `times` matching requests
    pub fn reset(target: Target, times: u32) -> Self {
        Self {
            target,
            kind: FaultKind::Reset,
            times,
        }
    }

    /// Stall the body of `times` matching responses
    pub fn stall(target: Target, times: u32) -> Self {
        Self {
            target,
            kind: FaultKind::Stall,
            times,
        }
    }
}

/// One request seen by the service
#[derive(Debug, Clone)]
pub struct SeenRequest {
    /// Method
    pub method: Method,
    /// `/bucket/key`
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// `Range` header
    pub range: Option<String>,
}

impl SeenRequest {
    fn part_number(&self) -> Option<u32> {
        self.query
            .iter()
            .find(|(k, _)| k == "partNumber")
            .and_then(|(_, v)| v.parse().ok())
    }

    fn range_start(&self) -> Option<u64> {
        let spec = self.range.as_deref()?.strip_prefix("bytes=")?;
        spec.split('-').next()?.parse().ok()
    }

    fn matches(&self, target: &Target) -> bool {
        match target {
            Target::Any => true,
            Target::Method(m) => self.method == *m,
            Target::UploadPart(n) => self.method == Method::PUT && self.part_number() == Some(*n),
            Target::RangeFrom(start) => self.method == Method::GET && self.range_start() == Some(*start),
            Target::Complete => {
                self.method == Method::POST && self.query.iter().any(|(k, _)| k == "uploadId")
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    version: u64,
}

#[derive(Debug, Default)]
struct MultipartUpload {
    path: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Deserialize)]
struct CompleteBody {
    #[serde(rename = "Parts")]
    parts: Vec<CompleteBodyPart>,
}

#[derive(Deserialize)]
struct CompleteBodyPart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

/// In-memory object service
#[derive(Default)]
pub struct MockObjectService {
    objects: Mutex<HashMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, MultipartUpload>>,
    faults: Mutex<Vec<Fault>>,
    seen: Mutex<Vec<SeenRequest>>,
    latency: Mutex<Duration>,
    next_id: AtomicU64,
    misreport_crc: AtomicBool,
}

impl MockObjectService {
    /// Empty service
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store an object directly
    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        self.store(format!("/{bucket}/{key}"), data);
    }

    /// Stored object contents
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .get(&format!("/{bucket}/{key}"))
            .map(|o| o.data.clone())
    }

    /// Script a failure
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    /// Delay every request
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Report CRC values that do not match the stored data
    pub fn misreport_crc(&self, on: bool) {
        self.misreport_crc.store(on, Ordering::SeqCst);
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }

    /// Requests matching `target`
    pub fn count(&self, target: &Target) -> usize {
        self.seen.lock().iter().filter(|r| r.matches(target)).count()
    }

    /// Multipart uploads not yet completed or aborted
    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    fn store(&self, path: String, data: Bytes) -> StoredObject {
        let version = self.next_id.fetch_add(1, Ordering::SeqCst);
        let object = StoredObject {
            etag: format!("\"{:016x}-{}\"", crc64(&data), version),
            data,
            version,
        };
        self.objects.lock().insert(path, object.clone());
        object
    }

    fn reported_crc(&self, data: &[u8]) -> String {
        let crc = crc64(data);
        if self.misreport_crc.load(Ordering::SeqCst) {
            (crc ^ 1).to_string()
        } else {
            crc.to_string()
        }
    }

    fn take_fault(&self, seen: &SeenRequest) -> Option<FaultKind> {
        let mut faults = self.faults.lock();
        let fault = faults
            .iter_mut()
            .find(|f| f.times > 0 && seen.matches(&f.target))?;
        fault.times -= 1;
        Some(fault.kind.clone())
    }

    fn respond(status: StatusCode, headers: HeaderMap, body: Bytes) -> ObjectResponse {
        ObjectResponse::new(status, headers, ResponseBody::Bytes(body))
    }

    fn status(status: StatusCode, message: &'static str) -> ObjectResponse {
        Self::respond(status, HeaderMap::new(), Bytes::from_static(message.as_bytes()))
    }

    fn object_headers(&self, object: &StoredObject, data: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(data.len() as u64));
        if let Ok(etag) = HeaderValue::from_str(&object.etag) {
            headers.insert(ETAG, etag);
        }
        if let Ok(crc) = HeaderValue::from_str(&self.reported_crc(&object.data)) {
            headers.insert(HEADER_CRC64, crc);
        }
        headers.insert(LAST_MODIFIED, HeaderValue::from(object.version));
        headers
    }

    fn head(&self, path: &str) -> ObjectResponse {
        let Some(object) = self.objects.lock().get(path).cloned() else {
            return Self::status(StatusCode::NOT_FOUND, "no such key");
        };
        let headers = self.object_headers(&object, &object.data);
        Self::respond(StatusCode::OK, headers, Bytes::new())
    }

    fn get(&self, path: &str, headers: &HeaderMap, seen: &SeenRequest) -> ObjectResponse {
        let Some(object) = self.objects.lock().get(path).cloned() else {
            return Self::status(StatusCode::NOT_FOUND, "no such key");
        };
        if let Some(expected) = headers.get(IF_MATCH) {
            if expected.as_bytes() != object.etag.as_bytes() {
                return Self::status(StatusCode::PRECONDITION_FAILED, "etag changed");
            }
        }

        let (status, data) = match (seen.range_start(), seen.range.as_deref()) {
            (Some(start), Some(spec)) => {
                let end = spec
                    .rsplit('-')
                    .next()
                    .and_then(|e| e.parse::<u64>().ok())
                    .unwrap_or(object.data.len() as u64 - 1)
                    .min(object.data.len() as u64 - 1);
                let slice = object.data.slice(start as usize..=end as usize);
                (StatusCode::PARTIAL_CONTENT, slice)
            }
            _ => (StatusCode::OK, object.data.clone()),
        };

        let headers = self.object_headers(&object, &data);
        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(RESPONSE_CHUNK)
            .map(|i| Ok(data.slice(i..(i + RESPONSE_CHUNK).min(data.len()))))
            .collect();
        ObjectResponse::new(
            status,
            headers,
            ResponseBody::Stream(futures::stream::iter(chunks).boxed()),
        )
    }

    fn put_object(&self, path: String, body: Bytes) -> ObjectResponse {
        let object = self.store(path, body);
        let mut headers = HeaderMap::new();
        if let Ok(etag) = HeaderValue::from_str(&object.etag) {
            headers.insert(ETAG, etag);
        }
        if let Ok(crc) = HeaderValue::from_str(&self.reported_crc(&object.data)) {
            headers.insert(HEADER_CRC64, crc);
        }
        Self::respond(StatusCode::OK, headers, Bytes::new())
    }

    fn initiate(&self, path: String) -> ObjectResponse {
        let id = format!("upload-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().insert(
            id.clone(),
            MultipartUpload {
                path,
                parts: BTreeMap::new(),
            },
        );
        let body = serde_json::json!({ "UploadId": id }).to_string();
        Self::respond(StatusCode::OK, HeaderMap::new(), Bytes::from(body))
    }

    fn upload_part(&self, upload_id: &str, part_number: u32, body: Bytes) -> ObjectResponse {
        let mut uploads = self.uploads.lock();
        let Some(upload) = uploads.get_mut(upload_id) else {
            return Self::status(StatusCode::NOT_FOUND, "no such upload");
        };
        let etag = format!("\"part-{}-{:016x}\"", part_number, crc64(&body));
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&etag) {
            headers.insert(ETAG, value);
        }
        if let Ok(crc) = HeaderValue::from_str(&self.reported_crc(&body)) {
            headers.insert(HEADER_CRC64, crc);
        }
        upload.parts.insert(part_number, (etag, body));
        Self::respond(StatusCode::OK, headers, Bytes::new())
    }

    fn complete(&self, upload_id: &str, body: &[u8]) -> ObjectResponse {
        let Ok(list) = serde_json::from_slice::<CompleteBody>(body) else {
            return Self::status(StatusCode::BAD_REQUEST, "malformed part list");
        };
        let Some(upload) = self.uploads.lock().remove(upload_id) else {
            return Self::status(StatusCode::NOT_FOUND, "no such upload");
        };

        let mut data = Vec::new();
        let mut previous = 0;
        for part in &list.parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag && part.part_number > previous => {
                    data.extend_from_slice(bytes);
                    previous = part.part_number;
                }
                _ => {
                    self.uploads.lock().insert(upload_id.to_string(), upload);
                    return Self::status(StatusCode::BAD_REQUEST, "invalid part list");
                }
            }
        }
        self.put_object(upload.path, Bytes::from(data))
    }

    fn abort(&self, upload_id: &str) -> ObjectResponse {
        match self.uploads.lock().remove(upload_id) {
            Some(_) => Self::respond(StatusCode::NO_CONTENT, HeaderMap::new(), Bytes::new()),
            None => Self::status(StatusCode::NOT_FOUND, "no such upload"),
        }
    }
}

#[async_trait]
impl Transport for MockObjectService {
    async fn send(&self, request: ObjectRequest) -> Result<ObjectResponse> {
        let seen = SeenRequest {
            method: request.method.clone(),
            path: request.path(),
            query: request.query.clone(),
            range: request
                .headers
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };
        self.seen.lock().push(seen.clone());

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut stall = false;
        match self.take_fault(&seen) {
            Some(FaultKind::Reset) => return Err(TransferError::transient("connection reset")),
            Some(FaultKind::Status(status)) => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Ok(Self::status(status, "injected fault"));
            }
            Some(FaultKind::Stall) => stall = true,
            None => {}
        }

        let ObjectRequest { headers, body, .. } = request;
        // Draining a streamed body runs the uploader's per-chunk gate
        let body = match body {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Bytes(bytes) => bytes,
            RequestBody::Stream(mut stream) => {
                let mut buf = Vec::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Bytes::from(buf)
            }
        };

        let query_value = |name: &str| {
            seen.query
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        let upload_id = query_value("uploadId");
        let initiate = query_value("uploads").is_some();
        let path = seen.path.clone();

        let response = match (&seen.method, upload_id, seen.part_number()) {
            (&Method::HEAD, _, _) => self.head(&path),
            (&Method::GET, _, _) => self.get(&path, &headers, &seen),
            (&Method::PUT, Some(id), Some(n)) => self.upload_part(&id, n, body),
            (&Method::PUT, None, None) => self.put_object(path, body),
            (&Method::POST, None, None) if initiate => self.initiate(path),
            (&Method::POST, Some(id), None) => self.complete(&id, &body),
            (&Method::DELETE, Some(id), None) => self.abort(&id),
            _ => Self::status(StatusCode::METHOD_NOT_ALLOWED, "unsupported request"),
        };
        if stall {
            let mut response = response;
            response.body = ResponseBody::Stream(futures::stream::pending().boxed());
            return Ok(response);
        }
        Ok(response)
    }
}

/// One call to [`RecordingSigner::sign`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignCall {
    /// Method
    pub method: Method,
    /// `/bucket/key`
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Signing timestamp
    pub timestamp: SystemTime,
}

/// Signer that stamps the timestamp into a header and records every call
#[derive(Debug, Default)]
pub struct RecordingSigner {
    calls: Mutex<Vec<SignCall>>,
}

impl RecordingSigner {
    /// New signer
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Calls so far
    pub fn calls(&self) -> Vec<SignCall> {
        self.calls.lock().clone()
    }
}

impl Signer for RecordingSigner {
    fn sign(&self, request: &ObjectRequest, timestamp: SystemTime) -> Result<HeaderMap> {
        self.calls.lock().push(SignCall {
            method: request.method.clone(),
            path: request.path(),
            query: request.query.clone(),
            timestamp,
        });

        let nanos = timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&nanos.to_string()) {
            headers.insert("x-tos-date", value);
        }
        Ok(headers)
    }
}

/// Everything one transfer emitted, in delivery order
#[derive(Debug, Default)]
pub struct EventLog {
    /// Data transfer events
    pub data: Mutex<Vec<DataTransferEvent>>,
    /// Part lifecycle events
    pub parts: Mutex<Vec<PartEvent>>,
    /// Progress snapshots
    pub progress: Mutex<Vec<TransferProgress>>,
}

impl EventLog {
    /// Subscribe a fresh log to every channel of `control`
    pub fn attach(control: &TransferControl) -> Arc<Self> {
        let log = Arc::new(Self::default());
        let sink = Arc::clone(&log);
        control
            .bus()
            .subscribe_data(move |e: &DataTransferEvent| sink.data.lock().push(e.clone()));
        let sink = Arc::clone(&log);
        control
            .bus()
            .subscribe_parts(move |e: &PartEvent| sink.parts.lock().push(e.clone()));
        let sink = Arc::clone(&log);
        control
            .bus()
            .subscribe_progress(move |p: &TransferProgress| sink.progress.lock().push(p.clone()));
        log
    }

    /// Data events
    pub fn data(&self) -> Vec<DataTransferEvent> {
        self.data.lock().clone()
    }

    /// Part events
    pub fn parts(&self) -> Vec<PartEvent> {
        self.parts.lock().clone()
    }

    /// `consumed_bytes` of every `Rw` event
    pub fn consumed(&self) -> Vec<u64> {
        self.data
            .lock()
            .iter()
            .filter_map(|e| match e {
                DataTransferEvent::Rw { consumed_bytes, .. } => Some(*consumed_bytes),
                _ => None,
            })
            .collect()
    }

    /// Number of terminal data events
    pub fn terminal_count(&self) -> usize {
        self.data.lock().iter().filter(|e| e.is_terminal()).count()
    }

    /// Indices of parts reported as succeeded
    pub fn succeeded_parts(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .parts
            .lock()
            .iter()
            .filter_map(|e| match e {
                PartEvent::PartSucceeded { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        indices.sort_unstable();
        indices
    }
}
