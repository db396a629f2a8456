//! HTTP logical stream: one proxied request/response pair.
//!
//! ```text
//! Buffering ──done──▶ Executing ──headers──▶ Streaming-Response ──end──▶ Closed
//!     │                   │                        │
//!     └──── error ────────┴──────── error ─────────┴──▶ close envelope
//! ```
//!
//! The response is read chunk by chunk and each chunk becomes one envelope.
//! The first envelope also carries the status code and response headers; the
//! last one is flagged done and closes the stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::Method;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::body::{boundary_from_content_type, BodyReader, Chunk};
use super::codec::{OpenDetails, WebStreamMsg};
use super::compression::{attach_payload, message_payload, should_compress_body};
use super::headers::{
    correct_location, filter_response_headers, gather_request_headers, header_value,
    is_not_modified, strip_for_not_modified, BaseProtocol,
};
use super::resolver::{LocalRequest, LocalResponse, ResolveOutcome};
use super::stream::{PriorityTracker, StreamContext, StreamLink};
use crate::error::{BoxError, TunnelError};

/// Bytes read per envelope for uncompressed bodies.
pub const BULK_READ_SIZE: usize = 199 * 1024;

/// Compressible bodies are mostly text and shrink well, so read more per envelope.
const COMPRESSED_READ_MULTIPLIER: usize = 4;

/// Extra room reserved whenever the upload buffer has to grow.
pub const UPLOAD_HEADROOM: usize = 50 * 1024;

/// Most a declared upload size may reserve up front; larger bodies grow as they arrive.
const MAX_UPLOAD_PREALLOC: usize = 64 * UPLOAD_HEADROOM;

/// Coalescing window for bodies of unknown length.
const STREAMING_READ_WINDOW: Duration = Duration::from_millis(50);

/// Compression stops paying off once output exceeds this share of input.
const MIN_COMPRESSION_GAIN: f64 = 0.9;

/// Request body assembly.
#[derive(Debug)]
pub enum UploadState {
    NotStarted { known_size: Option<usize> },
    Buffering { buf: Vec<u8>, known_size: Option<usize> },
    Complete(Bytes),
}

impl UploadState {
    pub fn new(known_size: Option<u64>) -> Self {
        Self::NotStarted {
            known_size: known_size.and_then(|size| usize::try_from(size).ok()),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// Append one fragment. `done` marks the last fragment of the upload.
    ///
    /// The state is unusable after an error.
    pub fn push(&mut self, data: Bytes, done: bool) -> Result<(), String> {
        let state = std::mem::replace(self, Self::Complete(Bytes::new()));
        *self = match state {
            Self::NotStarted { known_size } => {
                check_overflow(known_size, 0, data.len())?;
                if known_size == Some(data.len()) || (done && known_size.is_none()) {
                    // The whole body arrived in one fragment; keep its buffer.
                    Self::Complete(data)
                } else {
                    let wanted = known_size.unwrap_or(data.len() + UPLOAD_HEADROOM);
                    let mut buf = Vec::with_capacity(wanted.min(MAX_UPLOAD_PREALLOC));
                    buf.extend_from_slice(&data);
                    Self::Buffering { buf, known_size }.finish_if(done)?
                }
            }
            Self::Buffering { mut buf, known_size } => {
                check_overflow(known_size, buf.len(), data.len())?;
                if buf.capacity() - buf.len() < data.len() {
                    buf.try_reserve(data.len() + UPLOAD_HEADROOM)
                        .map_err(|e| format!("upload buffer: {e}"))?;
                }
                buf.extend_from_slice(&data);
                Self::Buffering { buf, known_size }.finish_if(done)?
            }
            Self::Complete(body) => {
                if !data.is_empty() {
                    return Err("upload data received after the upload completed".to_string());
                }
                Self::Complete(body)
            }
        };
        Ok(())
    }

    fn finish_if(self, done: bool) -> Result<Self, String> {
        if !done {
            return Ok(self);
        }
        match self {
            Self::Buffering { mut buf, known_size } => {
                if let Some(size) = known_size {
                    if buf.len() != size {
                        return Err(format!(
                            "upload ended after {} of {size} declared bytes",
                            buf.len()
                        ));
                    }
                }
                buf.shrink_to_fit();
                Ok(Self::Complete(Bytes::from(buf)))
            }
            Self::NotStarted { .. } => Ok(Self::Complete(Bytes::new())),
            complete @ Self::Complete(_) => Ok(complete),
        }
    }

    pub fn into_body(self) -> Bytes {
        match self {
            Self::Complete(body) => body,
            Self::Buffering { buf, .. } => Bytes::from(buf),
            Self::NotStarted { .. } => Bytes::new(),
        }
    }
}

fn check_overflow(known_size: Option<usize>, have: usize, incoming: usize) -> Result<(), String> {
    match known_size {
        Some(size) if have.saturating_add(incoming) > size => Err(format!(
            "upload overflow: {} bytes received, {size} declared",
            have.saturating_add(incoming)
        )),
        _ => Ok(()),
    }
}

/// How the response body is chunked into envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadMode {
    Boundary(String),
    Streaming,
    Bulk,
    NoBody,
}

struct Timings {
    opened: Instant,
    upload_done: Option<Instant>,
    response_started: Option<Instant>,
}

/// Drive one HTTP stream from its open message to its close.
pub async fn run(
    link: StreamLink,
    ctx: Arc<StreamContext>,
    priority: Arc<PriorityTracker>,
    mut inbox: mpsc::UnboundedReceiver<WebStreamMsg>,
) {
    let Some(first) = inbox.recv().await else {
        return;
    };
    let Some(open) = first.open.clone() else {
        warn!(stream_id = link.id(), "Stream: first message was not an open message");
        link.close(false).await;
        return;
    };
    let _priority_guard = open.priority.is_high().then(|| priority.begin());

    match execute(&link, &ctx, &priority, &open, first, &mut inbox).await {
        Ok(()) => {}
        Err(StreamFailure::RelayClosed) => {
            debug!(stream_id = link.id(), "Stream: closed by relay");
        }
        Err(StreamFailure::LocalUnreachable) => link.fail(true).await,
        Err(StreamFailure::Failed(e)) => {
            if !link.is_closed() {
                warn!(stream_id = link.id(), "Stream: {} {} failed: {e}", open.method, open.path);
                link.fail(false).await;
            }
        }
    }
}

enum StreamFailure {
    RelayClosed,
    LocalUnreachable,
    Failed(TunnelError),
}

impl From<TunnelError> for StreamFailure {
    fn from(e: TunnelError) -> Self {
        Self::Failed(e)
    }
}

async fn execute(
    link: &StreamLink,
    ctx: &StreamContext,
    priority: &PriorityTracker,
    open: &OpenDetails,
    first: WebStreamMsg,
    inbox: &mut mpsc::UnboundedReceiver<WebStreamMsg>,
) -> Result<(), StreamFailure> {
    let id = link.id();
    let mut timings = Timings {
        opened: link.opened_at(),
        upload_done: None,
        response_started: None,
    };

    let relay_headers = first.headers.clone().unwrap_or_default();
    let body = collect_upload(id, first, inbox).await?;
    timings.upload_done = Some(Instant::now());

    let method = Method::from_bytes(open.method.as_bytes())
        .map_err(|_| TunnelError::stream(id, format!("invalid method {:?}", open.method)))?;
    let request = LocalRequest {
        method: method.clone(),
        headers: gather_request_headers(
            &relay_headers,
            ctx.resolver.local_host(),
            open.external_host.as_deref(),
            BaseProtocol::Http,
        ),
        body,
    };

    priority.yield_if_busy(open.priority).await;
    let response = match ctx
        .resolver
        .fetch(ctx.fetcher.as_ref(), &open.path, open.path_type, &request)
        .await
    {
        ResolveOutcome::Response(response) => response,
        ResolveOutcome::TransportFailure => {
            info!(stream_id = id, "Stream: no local service answered {}", open.path);
            return Err(StreamFailure::LocalUnreachable);
        }
    };
    timings.response_started = Some(Instant::now());

    let sent_bytes = stream_response(link, priority, open, &method, &request, response).await?;
    log_timings(id, &timings, sent_bytes);
    Ok(())
}

/// Gather request body fragments until the relay marks the upload done.
async fn collect_upload(
    id: u32,
    first: WebStreamMsg,
    inbox: &mut mpsc::UnboundedReceiver<WebStreamMsg>,
) -> Result<Bytes, StreamFailure> {
    let mut upload = UploadState::new(first.full_stream_data_size);
    let mut next = Some(first);
    loop {
        let msg = match next.take() {
            Some(msg) => msg,
            None => inbox.recv().await.ok_or(StreamFailure::RelayClosed)?,
        };
        if msg.is_close_message {
            return Err(StreamFailure::RelayClosed);
        }
        if msg.open.is_some() && !upload_is_fresh(&upload) {
            return Err(TunnelError::stream(id, "second open message on an open stream").into());
        }
        let data = message_payload(&msg)
            .map_err(|e| TunnelError::stream(id, format!("upload fragment: {e}")))?;
        upload
            .push(data, msg.is_data_transmission_done)
            .map_err(|e| TunnelError::stream(id, e))?;
        if msg.is_data_transmission_done {
            return Ok(upload.into_body());
        }
    }
}

fn upload_is_fresh(upload: &UploadState) -> bool {
    matches!(upload, UploadState::NotStarted { .. })
}

/// Stream the local response back as envelopes. Returns the bytes put on the wire.
async fn stream_response(
    link: &StreamLink,
    priority: &PriorityTracker,
    open: &OpenDetails,
    method: &Method,
    request: &LocalRequest,
    response: LocalResponse,
) -> Result<usize, StreamFailure> {
    let id = link.id();
    let LocalResponse {
        mut status,
        headers,
        url,
        body,
    } = response;
    debug!(stream_id = id, "Stream: {} {url} -> {status}", open.method);

    let mut headers = filter_response_headers(headers);
    if status == 200 && is_not_modified(&request.headers, &headers) {
        status = 304;
        strip_for_not_modified(&mut headers);
    }
    for (name, value) in &mut headers {
        if name.eq_ignore_ascii_case("location") {
            if let Some(corrected) = correct_location(&open.path, value, &request.headers) {
                *value = corrected;
            }
        }
    }

    let content_type = header_value(&headers, "content-type").map(str::to_string);
    let content_length =
        header_value(&headers, "content-length").and_then(|v| v.trim().parse::<u64>().ok());
    let mode = read_mode(status, method, content_type.as_deref(), content_length);
    let mut compress =
        mode != ReadMode::NoBody && should_compress_body(content_type.as_deref(), content_length);
    let read_size = if compress {
        BULK_READ_SIZE * COMPRESSED_READ_MULTIPLIER
    } else {
        BULK_READ_SIZE
    };

    let mut reader = BodyReader::new(body);
    let mut first_headers = Some(headers);
    let (mut raw_total, mut wire_total) = (0usize, 0usize);
    loop {
        if link.is_closed() {
            return Err(StreamFailure::RelayClosed);
        }
        priority.yield_if_busy(open.priority).await;

        let chunk = read_chunk(&mut reader, &mode, read_size)
            .await
            .map_err(|e| TunnelError::stream(id, format!("local read from {url}: {e}")))?;
        let Chunk { data, is_end } = chunk.unwrap_or(Chunk {
            data: Bytes::new(),
            is_end: true,
        });
        if data.is_empty() && !is_end {
            continue;
        }

        let mut msg = WebStreamMsg::new(id);
        if let Some(headers) = first_headers.take() {
            msg.status_code = Some(status);
            msg.headers = Some(headers);
            msg.full_stream_data_size = content_length;
        }
        raw_total += data.len();
        wire_total += attach_payload(&mut msg, data, compress);
        msg.is_data_transmission_done = is_end;
        msg.is_close_message = is_end;
        link.send(msg).await?;

        if is_end {
            return Ok(wire_total);
        }
        if compress && wire_total as f64 > raw_total as f64 * MIN_COMPRESSION_GAIN {
            debug!(stream_id = id, "Stream: compression ineffective, disabling");
            compress = false;
        }
    }
}

fn read_mode(
    status: u16,
    method: &Method,
    content_type: Option<&str>,
    content_length: Option<u64>,
) -> ReadMode {
    if status == 304 || status == 204 || method == Method::HEAD {
        return ReadMode::NoBody;
    }
    if let Some(boundary) = content_type.and_then(boundary_from_content_type) {
        return ReadMode::Boundary(boundary);
    }
    let is_jpeg = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("image/jpeg"));
    if content_length.is_none() && !is_jpeg {
        ReadMode::Streaming
    } else {
        ReadMode::Bulk
    }
}

async fn read_chunk(
    reader: &mut BodyReader,
    mode: &ReadMode,
    max: usize,
) -> Result<Option<Chunk>, BoxError> {
    match mode {
        ReadMode::NoBody => Ok(None),
        ReadMode::Boundary(boundary) => reader.read_boundary_part(boundary, max).await,
        ReadMode::Streaming => reader.read_streaming(max, STREAMING_READ_WINDOW).await,
        ReadMode::Bulk => reader.read_bulk(max).await,
    }
}

fn log_timings(id: u32, timings: &Timings, sent_bytes: usize) {
    let now = Instant::now();
    let upload = timings
        .upload_done
        .map(|t| t.duration_since(timings.opened).as_millis());
    let request = match (timings.upload_done, timings.response_started) {
        (Some(a), Some(b)) => Some(b.duration_since(a).as_millis()),
        _ => None,
    };
    let send = timings
        .response_started
        .map(|t| now.duration_since(t).as_millis());
    debug!(
        stream_id = id,
        upload_ms = ?upload,
        request_ms = ?request,
        send_ms = ?send,
        total_ms = now.duration_since(timings.opened).as_millis(),
        sent_bytes,
        "Stream: complete"
    );
}
