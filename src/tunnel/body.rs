//! Chunked reads over a local HTTP response body.
//!
//! Three read styles feed the HTTP stream's response loop:
//!
//! - [`BodyReader::read_bulk`]: fill up to a fixed size or end of body.
//! - [`BodyReader::read_streaming`]: same, but give up waiting after a short
//!   coalescing window so unterminated streams (SSE) flow promptly.
//! - [`BodyReader::read_boundary_part`]: return exactly one multipart part, so
//!   each MJPEG frame becomes one envelope.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use tokio::time::Instant;

use crate::error::BoxError;

/// Body type returned by every [`LocalFetcher`](super::resolver::LocalFetcher).
pub type LocalBody = BoxBody<Bytes, BoxError>;

/// How far into a multipart chunk to look for the end of its headers.
pub const BOUNDARY_HEADER_SEARCH_LIMIT: usize = 5 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Largest part `Content-Length` trusted for framing; bigger values fall back
/// to scanning for the next boundary marker.
const MAX_BOUNDARY_PART_LEN: usize = 64 * 1024 * 1024;

/// In-memory body, used for synthesized responses and tests.
pub fn full_body(data: impl Into<Bytes>) -> LocalBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// One read cycle's result.
#[derive(Debug)]
pub struct Chunk {
    pub data: Bytes,
    /// The body has no more bytes after this chunk.
    pub is_end: bool,
}

pub struct BodyReader {
    body: LocalBody,
    pending: BytesMut,
    finished: bool,
    /// Set once a multipart stream turns out to have no per-part length.
    pub has_no_content_length_boundary: bool,
    first_streaming_read: bool,
}

impl BodyReader {
    pub fn new(body: LocalBody) -> Self {
        Self {
            body,
            pending: BytesMut::new(),
            finished: false,
            has_no_content_length_boundary: false,
            first_streaming_read: true,
        }
    }

    /// True once the body is exhausted and nothing is buffered.
    pub fn is_done(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    /// Pull the next data frame into `pending`. Returns false at end of body.
    async fn fill(&mut self) -> Result<bool, BoxError> {
        if self.finished {
            return Ok(false);
        }
        loop {
            match self.body.frame().await {
                None => {
                    self.finished = true;
                    return Ok(false);
                }
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        if data.is_empty() {
                            continue;
                        }
                        self.pending.extend_from_slice(&data);
                        return Ok(true);
                    }
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    fn take(&mut self, max: usize) -> Option<Chunk> {
        if self.pending.is_empty() && self.finished {
            return None;
        }
        let len = max.min(self.pending.len());
        let data = self.pending.split_to(len).freeze();
        Some(Chunk {
            data,
            is_end: self.is_done(),
        })
    }

    /// Read until `max` bytes are buffered or the body ends.
    pub async fn read_bulk(&mut self, max: usize) -> Result<Option<Chunk>, BoxError> {
        while self.pending.len() < max && self.fill().await? {}
        Ok(self.take(max))
    }

    /// Read whatever arrives within `window` after the first byte, up to `max`.
    ///
    /// The first call on a reader gets two windows, since event streams often
    /// stall before their first message.
    pub async fn read_streaming(
        &mut self,
        max: usize,
        window: Duration,
    ) -> Result<Option<Chunk>, BoxError> {
        if self.pending.is_empty() && !self.fill().await? {
            return Ok(self.take(max));
        }
        let window = if self.first_streaming_read {
            self.first_streaming_read = false;
            window * 2
        } else {
            window
        };
        let deadline = Instant::now() + window;
        while self.pending.len() < max {
            match tokio::time::timeout_at(deadline, self.fill()).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) | Err(_) => break,
                Ok(Err(e)) => return Err(e),
            }
        }
        Ok(self.take(max))
    }

    /// Read exactly one multipart part delimited by `boundary`.
    ///
    /// Uses the part's `Content-Length` when present. Otherwise scans for the
    /// next `--boundary` marker, bounded by `max`.
    pub async fn read_boundary_part(
        &mut self,
        boundary: &str,
        max: usize,
    ) -> Result<Option<Chunk>, BoxError> {
        if self.has_no_content_length_boundary {
            return self.read_until_boundary(boundary, 0, max).await;
        }

        let header_end = loop {
            let window = self.pending.len().min(BOUNDARY_HEADER_SEARCH_LIMIT);
            if let Some(idx) = find(&self.pending[..window], HEADER_END) {
                break idx;
            }
            if self.pending.len() >= BOUNDARY_HEADER_SEARCH_LIMIT {
                self.has_no_content_length_boundary = true;
                return self.read_until_boundary(boundary, 0, max).await;
            }
            if !self.fill().await? {
                return Ok(self.take(self.pending.len()));
            }
        };

        // Part headers, blank line, payload, and the CRLF that precedes the next boundary.
        let part_len = part_content_length(&self.pending[..header_end])
            .filter(|&len| len <= MAX_BOUNDARY_PART_LEN)
            .and_then(|len| (header_end + HEADER_END.len()).checked_add(len)?.checked_add(2));
        let Some(part_len) = part_len else {
            self.has_no_content_length_boundary = true;
            return self
                .read_until_boundary(boundary, header_end + HEADER_END.len(), max)
                .await;
        };
        while self.pending.len() < part_len && self.fill().await? {}
        Ok(self.take(part_len))
    }

    async fn read_until_boundary(
        &mut self,
        boundary: &str,
        search_from: usize,
        max: usize,
    ) -> Result<Option<Chunk>, BoxError> {
        let marker = format!("--{boundary}");
        // Skip our own leading marker so the search finds the next part.
        let mut from = search_from.max(1);
        loop {
            if self.pending.len() > from {
                if let Some(idx) = find(&self.pending[from..], marker.as_bytes()) {
                    return Ok(self.take(from + idx));
                }
                from = self.pending.len().saturating_sub(marker.len()).max(from);
            }
            if self.pending.len() >= max || !self.fill().await? {
                return Ok(self.take(max));
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// `Content-Length` from a multipart part's header block.
fn part_content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Boundary token from a `multipart/...; boundary=...` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let start = lower.find("boundary=")? + "boundary=".len();
    let token = content_type[start..]
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('"');
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
