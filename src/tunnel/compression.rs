//! Per-chunk brotli compression for tunnel payloads.
//!
//! Runs once per outbound chunk on small devices, so the encoder is pinned to
//! its fastest quality.

use std::io;

use brotli::enc::BrotliEncoderParams;
use bytes::Bytes;
use tracing::warn;

use super::codec::{DataCompression, WebStreamMsg};

/// Below this many bytes compression costs more than it saves.
pub const MIN_SIZE_TO_COMPRESS: usize = 200;

/// Brotli quality 0 is the fastest setting.
const BROTLI_QUALITY: i32 = 0;

/// Window size (log2) used by the encoder.
const BROTLI_LGWIN: i32 = 22;

/// Cap on the output buffer reserved from a peer-declared size.
const MAX_DECOMPRESS_PREALLOC: usize = 4 * 1024 * 1024;

/// Substrings of a lowercased content type whose bodies are worth compressing.
const COMPRESSIBLE_CONTENT_TYPES: &[&str] =
    &["text/", "javascript", "json", "xml", "svg", "octet-stream"];

/// Decide whether an HTTP response body should be compressed.
///
/// Unknown content types are left alone; they are usually already-compressed media.
pub fn should_compress_body(content_type: Option<&str>, content_length: Option<u64>) -> bool {
    if content_length.is_some_and(|len| len < MIN_SIZE_TO_COMPRESS as u64) {
        return false;
    }
    let Some(content_type) = content_type else {
        return false;
    };
    let lower = content_type.to_ascii_lowercase();
    COMPRESSIBLE_CONTENT_TYPES
        .iter()
        .any(|needle| lower.contains(needle))
}

/// WebSocket frames are compressed whenever they are big enough.
pub fn should_compress_frame(len: usize) -> bool {
    len >= MIN_SIZE_TO_COMPRESS
}

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let params = BrotliEncoderParams {
        quality: BROTLI_QUALITY,
        lgwin: BROTLI_LGWIN,
        ..BrotliEncoderParams::default()
    };
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    brotli::BrotliCompress(&mut &data[..], &mut out, &params)?;
    Ok(out)
}

/// Decompress `data` and check the result is exactly `original_size` bytes.
pub fn decompress(data: &[u8], original_size: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(original_size.min(MAX_DECOMPRESS_PREALLOC));
    brotli::BrotliDecompress(&mut &data[..], &mut out)?;
    if out.len() != original_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "decompressed {} bytes, expected {original_size}",
                out.len()
            ),
        ));
    }
    Ok(out)
}

/// The uncompressed payload carried by `msg`.
pub fn message_payload(msg: &WebStreamMsg) -> io::Result<Bytes> {
    match msg.original_data_size {
        Some(size) if msg.is_compressed() => decompress(&msg.data, size as usize).map(Bytes::from),
        _ => Ok(msg.data.clone()),
    }
}

/// Put `data` on `msg`, brotli-compressed when `compress` is set.
///
/// Falls back to the raw bytes if the encoder fails. Returns the number of
/// bytes that will travel on the wire.
pub fn attach_payload(msg: &mut WebStreamMsg, data: Bytes, compress: bool) -> usize {
    if compress && !data.is_empty() {
        match (self::compress(&data), u32::try_from(data.len())) {
            (Ok(packed), Ok(original_size)) => {
                msg.compression = DataCompression::Brotli;
                msg.original_data_size = Some(original_size);
                msg.data = Bytes::from(packed);
                return msg.data.len();
            }
            (Err(e), _) => warn!(stream_id = msg.stream_id, "Compression failed, sending raw: {e}"),
            (_, Err(_)) => {}
        }
    }
    msg.compression = DataCompression::None;
    msg.original_data_size = None;
    msg.data = data;
    msg.data.len()
}
