//! Collaborators at the edge of the engine
//!
//! The engine never speaks HTTP itself. It builds [`ObjectRequest`]s, has a
//! [`Signer`] stamp every attempt with fresh headers, and hands them to a
//! [`Transport`]. Protocol bodies of the multipart calls go through a
//! [`Codec`]. [`RequestExecutor`] ties these together for one attempt.

use crate::config::RetryPolicy;
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use http::header::{CONTENT_LENGTH, ETAG, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Header carrying the service-side CRC-64 of an object or part
pub const HEADER_CRC64: &str = "x-tos-hash-crc64ecma";

/// Longest response body excerpt kept in error messages
const MAX_ERROR_BODY: usize = 256;

/// Request payload
pub enum RequestBody {
    /// No payload
    Empty,
    /// Payload held in memory
    Bytes(Bytes),
    /// Payload produced chunk by chunk
    Stream(BoxStream<'static, Result<Bytes>>),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Response payload
pub enum ResponseBody {
    /// Payload held in memory
    Bytes(Bytes),
    /// Payload delivered chunk by chunk
    Stream(BoxStream<'static, Result<Bytes>>),
}

impl ResponseBody {
    /// Empty payload
    pub fn empty() -> Self {
        Self::Bytes(Bytes::new())
    }

    /// Convert into a chunk stream
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        match self {
            Self::Bytes(bytes) if bytes.is_empty() => futures::stream::empty().boxed(),
            Self::Bytes(bytes) => futures::stream::once(async move { Ok(bytes) }).boxed(),
            Self::Stream(stream) => stream,
        }
    }

    /// Read the whole payload
    pub async fn collect(self) -> Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Request against one object
#[derive(Debug)]
pub struct ObjectRequest {
    /// HTTP method
    pub method: Method,
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Query parameters in insertion order
    pub query: Vec<(String, String)>,
    /// Request headers (signing headers are added per attempt)
    pub headers: HeaderMap,
    /// Payload
    pub body: RequestBody,
}

impl ObjectRequest {
    /// Create a request with no query, headers or payload
    pub fn new(method: Method, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            method,
            bucket: bucket.into(),
            key: key.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    /// Add a query parameter (use an empty value for flag parameters)
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the payload
    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Object path `/bucket/key`
    pub fn path(&self) -> String {
        format!("/{}/{}", self.bucket, self.key)
    }

    /// Look up a query parameter
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether a query parameter is present
    pub fn has_query(&self, name: &str) -> bool {
        self.query.iter().any(|(k, _)| k == name)
    }
}

/// Response to an [`ObjectRequest`]
#[derive(Debug)]
pub struct ObjectResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Payload
    pub body: ResponseBody,
}

impl ObjectResponse {
    /// Create a response
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Header value as text
    pub fn header_str(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `ETag` header with surrounding quotes kept
    pub fn etag(&self) -> Option<String> {
        self.header_str(ETAG).map(str::to_string)
    }

    /// `Content-Length` header
    pub fn content_length(&self) -> Option<u64> {
        self.header_str(CONTENT_LENGTH)?.parse().ok()
    }

    /// Service-side CRC-64 header
    pub fn crc64(&self) -> Option<u64> {
        self.header_str(HEADER_CRC64)?.parse().ok()
    }
}

/// Sends requests to the object service
///
/// Implementations classify failures: network-level problems are
/// [`TransferError::TransientNetwork`], everything else is permanent.
/// Non-2xx responses are returned as responses, not errors.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request
    async fn send(&self, request: ObjectRequest) -> Result<ObjectResponse>;
}

/// Produces authentication headers for one attempt
///
/// Called freshly on every attempt with that attempt's timestamp; the
/// result is never reused across retries.
pub trait Signer: Send + Sync {
    /// Compute headers to add to `request`
    fn sign(&self, request: &ObjectRequest, timestamp: SystemTime) -> Result<HeaderMap>;
}

/// Signer for anonymous access
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousSigner;

impl Signer for AnonymousSigner {
    fn sign(&self, _request: &ObjectRequest, _timestamp: SystemTime) -> Result<HeaderMap> {
        Ok(HeaderMap::new())
    }
}

/// Part entry of a complete-multipart body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// One-based part number
    pub part_number: u32,
    /// Service-assigned part etag
    pub etag: String,
}

/// Encodes and decodes multipart protocol bodies
pub trait Codec: Send + Sync {
    /// Extract the upload id from an initiate-multipart response
    fn decode_upload_id(&self, body: &[u8]) -> Result<String>;

    /// Encode the part list of a complete-multipart request
    fn encode_complete_parts(&self, parts: &[CompletedPart]) -> Result<Bytes>;
}

#[derive(Deserialize)]
struct InitiateMultipartOutput {
    #[serde(rename = "UploadId")]
    upload_id: String,
}

#[derive(Serialize)]
struct CompleteMultipartInput<'a> {
    #[serde(rename = "Parts")]
    parts: Vec<CompleteMultipartPart<'a>>,
}

#[derive(Serialize)]
struct CompleteMultipartPart<'a> {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

/// JSON multipart bodies
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode_upload_id(&self, body: &[u8]) -> Result<String> {
        let output: InitiateMultipartOutput = serde_json::from_slice(body)
            .map_err(|e| TransferError::Codec(Cow::Owned(format!("bad initiate response: {e}"))))?;
        if output.upload_id.is_empty() {
            return Err(TransferError::codec("empty upload id"));
        }
        Ok(output.upload_id)
    }

    fn encode_complete_parts(&self, parts: &[CompletedPart]) -> Result<Bytes> {
        let input = CompleteMultipartInput {
            parts: parts
                .iter()
                .map(|p| CompleteMultipartPart {
                    part_number: p.part_number,
                    etag: &p.etag,
                })
                .collect(),
        };
        Ok(Bytes::from(serde_json::to_vec(&input)?))
    }
}

/// Inactivity deadline of one attempt
///
/// The deadline moves forward whenever a request chunk is handed to the
/// transport and stands still while a [`IdlePause`] is held, so time spent
/// waiting for rate-limit tokens never counts against an attempt.
#[derive(Debug, Clone)]
pub struct IdleDeadline {
    state: Arc<Mutex<IdleState>>,
}

#[derive(Debug)]
struct IdleState {
    last_activity: Instant,
    paused: usize,
}

impl IdleDeadline {
    /// Start counting from now
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(IdleState {
                last_activity: Instant::now(),
                paused: 0,
            })),
        }
    }

    /// Record activity
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// Stop the clock until the returned guard is dropped
    pub fn pause(&self) -> IdlePause {
        self.state.lock().paused += 1;
        IdlePause {
            deadline: self.clone(),
        }
    }

    /// Whether a pause is in effect
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused > 0
    }

    /// Resolves once `limit` passes without activity outside a pause
    async fn expired(&self, limit: Duration) {
        loop {
            let wake = {
                let state = self.state.lock();
                (state.paused == 0).then(|| state.last_activity + limit)
            };
            match wake {
                Some(at) if Instant::now() >= at => return,
                Some(at) => tokio::time::sleep_until(at).await,
                None => tokio::time::sleep(limit).await,
            }
        }
    }
}

impl Default for IdleDeadline {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard returned by [`IdleDeadline::pause`]; resuming counts as activity
#[derive(Debug)]
pub struct IdlePause {
    deadline: IdleDeadline,
}

impl Drop for IdlePause {
    fn drop(&mut self) {
        let mut state = self.deadline.state.lock();
        state.paused = state.paused.saturating_sub(1);
        state.last_activity = Instant::now();
    }
}

/// Bound every chunk of a response body by `limit`
fn idle_bounded(body: ResponseBody, limit: Duration) -> ResponseBody {
    let ResponseBody::Stream(stream) = body else {
        return body;
    };
    let bounded = futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(limit, stream.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(stream))),
            Ok(None) => None,
            Err(_) => Some((
                Err(TransferError::Timeout(Cow::Owned(format!(
                    "response body stalled for {}ms",
                    limit.as_millis()
                )))),
                None,
            )),
        }
    });
    ResponseBody::Stream(bounded.boxed())
}

/// Runs single request attempts: sign, send with a time budget, classify
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    timeout: Duration,
    retry: RetryPolicy,
    last_signed: Mutex<SystemTime>,
}

impl RequestExecutor {
    /// Create an executor
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            signer,
            timeout,
            retry,
            last_signed: Mutex::new(SystemTime::UNIX_EPOCH),
        }
    }

    /// Timestamp for a new attempt, strictly later than every earlier one
    fn next_timestamp(&self) -> SystemTime {
        let mut last = self.last_signed.lock();
        let now = SystemTime::now();
        let stamp = if now > *last {
            now
        } else {
            *last + Duration::from_micros(1)
        };
        *last = stamp;
        stamp
    }

    /// Perform one attempt with its own inactivity deadline
    pub async fn execute(&self, request: ObjectRequest) -> Result<ObjectResponse> {
        self.execute_with(request, &IdleDeadline::new()).await
    }

    /// Perform one attempt
    ///
    /// Signs with a fresh timestamp and maps non-2xx statuses to transient or
    /// permanent errors. The attempt times out when `deadline` sees no
    /// activity for the per-attempt timeout: while sending, every streamed
    /// request chunk counts as activity; afterwards every response chunk must
    /// arrive within the timeout.
    pub async fn execute_with(
        &self,
        mut request: ObjectRequest,
        deadline: &IdleDeadline,
    ) -> Result<ObjectResponse> {
        let timestamp = self.next_timestamp();
        let signed = self.signer.sign(&request, timestamp)?;
        request.headers.extend(signed);

        let method = request.method.clone();
        let path = request.path();
        tracing::trace!("{} {} {:?}", method, path, request.query);

        request.body = match request.body {
            RequestBody::Stream(stream) => {
                let activity = deadline.clone();
                RequestBody::Stream(stream.inspect(move |_| activity.touch()).boxed())
            }
            other => other,
        };

        deadline.touch();
        let mut response = tokio::select! {
            response = self.transport.send(request) => response?,
            _ = deadline.expired(self.timeout) => {
                return Err(TransferError::Timeout(Cow::Owned(format!(
                    "{method} {path} idle for more than {}ms",
                    self.timeout.as_millis()
                ))));
            }
        };
        response.body = idle_bounded(response.body, self.timeout);

        if response.status.is_success() {
            return Ok(response);
        }

        let status = response.status.as_u16();
        let body = response.body.collect().await.unwrap_or_default();
        let excerpt = String::from_utf8_lossy(&body[..body.len().min(MAX_ERROR_BODY)]).into_owned();
        let message = format!("{method} {path}: {excerpt}");

        if self.retry.is_retryable_status(status) {
            Err(TransferError::TransientNetwork(Cow::Owned(format!(
                "status {status}: {message}"
            ))))
        } else {
            Err(TransferError::Request {
                status,
                message: Cow::Owned(message),
            })
        }
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("timeout", &self.timeout)
            .field("retryable_statuses", &self.retry.retryable_statuses)
            .finish()
    }
}
