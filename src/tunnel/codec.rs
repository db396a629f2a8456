//! Binary envelope framing for the relay socket.
//!
//! Every WebSocket binary message from or to the relay carries exactly one
//! envelope:
//!
//! ```text
//! +----------------+-------------+----------------+-----------------+-------------+
//! | message_size   | context tag | context_len    | context payload | data        |
//! | u32 LE         | u8          | u32 LE         | bincode         | raw bytes   |
//! +----------------+-------------+----------------+-----------------+-------------+
//! ```
//!
//! `message_size` counts every byte after itself. The context payload is
//! bincode with fixed-width little-endian integers. Only WebStream envelopes
//! carry a data region; it is split off the frame without copying.

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the `message_size` prefix.
pub const SIZE_PREFIX_LEN: usize = 4;

/// Size prefix + context tag + context length.
pub const MIN_FRAME_LEN: usize = SIZE_PREFIX_LEN + 1 + 4;

/// Context type tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextType {
    HandshakeSyn = 1,
    HandshakeAck = 2,
    WebStream = 3,
    Summon = 4,
}

impl TryFrom<u8> for ContextType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ContextType::HandshakeSyn),
            2 => Ok(ContextType::HandshakeAck),
            3 => Ok(ContextType::WebStream),
            4 => Ok(ContextType::Summon),
            _ => Err(CodecError::UnknownContext(value)),
        }
    }
}

/// First message the agent sends on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeSyn {
    pub identity: String,
    pub version: String,
    pub is_primary: bool,
    pub local_proxy_port: Option<u16>,
    pub lan_ip: Option<String>,
}

/// Relay's answer to [`HandshakeSyn`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub accepted: bool,
    pub error_reason: Option<String>,
    /// Extra seconds the relay wants added to the reconnect delay.
    pub backoff_seconds_hint: Option<u32>,
    pub requires_update: bool,
}

/// Relay request to open a secondary connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summon {
    pub server_connect_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataCompression {
    #[default]
    None,
    Brotli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PathType {
    #[default]
    Relative,
    Absolute,
}

impl PathType {
    /// Classify a user-supplied path: full URLs are absolute.
    pub fn of(path: &str) -> Self {
        if path.starts_with("http://")
            || path.starts_with("https://")
            || path.starts_with("ws://")
            || path.starts_with("wss://")
        {
            Self::Absolute
        } else {
            Self::Relative
        }
    }
}

/// Scheduling tier of a stream. Anything ordered before `Normal` is high priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum MessagePriority {
    Highest,
    High,
    #[default]
    Normal,
    Low,
    Lowest,
}

impl MessagePriority {
    pub fn is_high(self) -> bool {
        self < MessagePriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WsFrameType {
    Text,
    Binary,
    Close,
}

/// Present only on the message that opens a stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenDetails {
    pub is_websocket: bool,
    pub method: String,
    pub path: String,
    pub path_type: PathType,
    pub priority: MessagePriority,
    /// Hostname the remote user sees, forwarded as `X-Forwarded-Host`.
    pub external_host: Option<String>,
}

/// One multiplexed stream message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WebStreamMsg {
    pub stream_id: u32,
    pub is_control_only: bool,
    pub open: Option<OpenDetails>,
    pub status_code: Option<u16>,
    /// Request headers on the open message, response headers on the first reply.
    pub headers: Option<Vec<(String, String)>>,
    pub compression: DataCompression,
    /// Uncompressed length of `data`; set iff `compression` is not `None`.
    pub original_data_size: Option<u32>,
    /// Total body size of the exchange when known up front.
    pub full_stream_data_size: Option<u64>,
    pub is_data_transmission_done: bool,
    pub is_close_message: bool,
    pub close_due_to_connection_failure: bool,
    pub ws_frame_type: Option<WsFrameType>,
    #[serde(skip)]
    pub data: Bytes,
}

impl WebStreamMsg {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            ..Self::default()
        }
    }

    /// Control-only close notification for `stream_id`.
    pub fn close(stream_id: u32) -> Self {
        Self {
            stream_id,
            is_control_only: true,
            is_close_message: true,
            ..Self::default()
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != DataCompression::None
    }

    fn check_compression_fields(&self) -> Result<(), CodecError> {
        if self.is_compressed() == self.original_data_size.is_some() {
            Ok(())
        } else {
            Err(CodecError::CompressionFields(self.stream_id))
        }
    }
}

/// A decoded relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    HandshakeSyn(HandshakeSyn),
    HandshakeAck(HandshakeAck),
    WebStream(WebStreamMsg),
    Summon(Summon),
}

impl Envelope {
    pub fn context_type(&self) -> ContextType {
        match self {
            Envelope::HandshakeSyn(_) => ContextType::HandshakeSyn,
            Envelope::HandshakeAck(_) => ContextType::HandshakeAck,
            Envelope::WebStream(_) => ContextType::WebStream,
            Envelope::Summon(_) => ContextType::Summon,
        }
    }
}

/// Codec errors. Every variant is a protocol fault.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("declared frame size {declared} does not match buffer length {actual}")]
    SizeMismatch { declared: u64, actual: usize },

    #[error("unknown context type {0}")]
    UnknownContext(u8),

    #[error("malformed context payload: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("compression fields inconsistent on stream {0}")]
    CompressionFields(u32),

    #[error("{0:?} envelope carries {1} unexpected data bytes")]
    UnexpectedData(ContextType, usize),

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// Encode an envelope into one wire frame.
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let (context, data) = match envelope {
        Envelope::HandshakeSyn(syn) => (wire_options().serialize(syn)?, None),
        Envelope::HandshakeAck(ack) => (wire_options().serialize(ack)?, None),
        Envelope::Summon(summon) => (wire_options().serialize(summon)?, None),
        Envelope::WebStream(msg) => {
            msg.check_compression_fields()?;
            (wire_options().serialize(msg)?, Some(&msg.data))
        }
    };
    let data: &[u8] = data.map(|d| &d[..]).unwrap_or_default();

    let body_len = 1 + 4 + context.len() + data.len();
    let message_size = u32::try_from(body_len).map_err(|_| CodecError::TooLarge(body_len))?;
    let context_len =
        u32::try_from(context.len()).map_err(|_| CodecError::TooLarge(context.len()))?;

    let mut buf = BytesMut::with_capacity(SIZE_PREFIX_LEN + body_len);
    buf.put_u32_le(message_size);
    buf.put_u8(envelope.context_type() as u8);
    buf.put_u32_le(context_len);
    buf.put_slice(&context);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Decode one wire frame. The buffer must hold exactly one envelope.
pub fn decode(mut buf: Bytes) -> Result<Envelope, CodecError> {
    let actual = buf.len();
    if actual < MIN_FRAME_LEN {
        return Err(CodecError::TooShort(actual));
    }

    let declared = u64::from(buf.get_u32_le()) + SIZE_PREFIX_LEN as u64;
    if declared != actual as u64 {
        return Err(CodecError::SizeMismatch { declared, actual });
    }

    let context_type = ContextType::try_from(buf.get_u8())?;
    let context_len = buf.get_u32_le() as usize;
    if context_len > buf.remaining() {
        return Err(CodecError::SizeMismatch {
            declared: (MIN_FRAME_LEN + context_len) as u64,
            actual,
        });
    }

    let context = buf.split_to(context_len);
    let data = buf;

    if context_type != ContextType::WebStream && !data.is_empty() {
        return Err(CodecError::UnexpectedData(context_type, data.len()));
    }

    let envelope = match context_type {
        ContextType::HandshakeSyn => Envelope::HandshakeSyn(wire_options().deserialize(&context)?),
        ContextType::HandshakeAck => Envelope::HandshakeAck(wire_options().deserialize(&context)?),
        ContextType::Summon => Envelope::Summon(wire_options().deserialize(&context)?),
        ContextType::WebStream => {
            let mut msg: WebStreamMsg = wire_options().deserialize(&context)?;
            msg.check_compression_fields()?;
            msg.data = data;
            Envelope::WebStream(msg)
        }
    };
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream_msg() -> WebStreamMsg {
        WebStreamMsg {
            stream_id: 42,
            open: Some(OpenDetails {
                is_websocket: false,
                method: "POST".into(),
                path: "/api/files/local".into(),
                path_type: PathType::Relative,
                priority: MessagePriority::High,
                external_host: Some("abc.relay.example".into()),
            }),
            headers: Some(vec![
                ("Content-Type".into(), "application/json".into()),
                ("X-Api-Key".into(), "secret".into()),
            ]),
            compression: DataCompression::Brotli,
            original_data_size: Some(512),
            full_stream_data_size: Some(512),
            is_data_transmission_done: true,
            data: Bytes::from_static(b"\x0b\x80compressed-ish payload"),
            ..WebStreamMsg::new(42)
        }
    }

    fn all_envelopes() -> Vec<Envelope> {
        vec![
            Envelope::HandshakeSyn(HandshakeSyn {
                identity: "printer-7f3a".into(),
                version: "1.2.3".into(),
                is_primary: true,
                local_proxy_port: Some(443),
                lan_ip: Some("192.168.1.20".into()),
            }),
            Envelope::HandshakeAck(HandshakeAck {
                accepted: false,
                error_reason: Some("busy".into()),
                backoff_seconds_hint: Some(30),
                requires_update: false,
            }),
            Envelope::Summon(Summon {
                server_connect_url: "wss://eu-2.relay.example/agent".into(),
            }),
            Envelope::WebStream(sample_stream_msg()),
            Envelope::WebStream(WebStreamMsg::close(7)),
            Envelope::WebStream(WebStreamMsg {
                ws_frame_type: Some(WsFrameType::Text),
                data: Bytes::from_static(b"hello"),
                ..WebStreamMsg::new(u32::MAX)
            }),
        ]
    }

    #[test]
    fn test_roundtrip_all_context_types() {
        for envelope in all_envelopes() {
            let frame = encode(&envelope).unwrap();
            assert_eq!(decode(frame).unwrap(), envelope);
        }
    }

    #[test]
    fn test_size_prefix_counts_bytes_after_itself() {
        let frame = encode(&Envelope::WebStream(sample_stream_msg())).unwrap();
        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared + SIZE_PREFIX_LEN, frame.len());
        assert_eq!(frame[4], ContextType::WebStream as u8);
        assert!(frame.ends_with(b"compressed-ish payload"));
    }

    #[test]
    fn test_truncated_or_extended_frames_fail() {
        for envelope in all_envelopes() {
            let frame = encode(&envelope).unwrap();
            for len in 0..frame.len() {
                assert!(decode(frame.slice(..len)).is_err(), "truncated to {len}");
            }
            let mut extended = BytesMut::from(&frame[..]);
            extended.put_u8(0);
            assert!(matches!(
                decode(extended.freeze()),
                Err(CodecError::SizeMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_every_wrong_size_prefix_fails() {
        let frame = encode(&Envelope::WebStream(sample_stream_msg())).unwrap();
        let correct = (frame.len() - SIZE_PREFIX_LEN) as u32;
        for declared in 0..correct + 64 {
            if declared == correct {
                continue;
            }
            let mut corrupt = BytesMut::from(&frame[..]);
            corrupt[..4].copy_from_slice(&declared.to_le_bytes());
            assert!(
                matches!(decode(corrupt.freeze()), Err(CodecError::SizeMismatch { .. })),
                "declared {declared}"
            );
        }
    }

    #[test]
    fn test_context_len_past_end_fails() {
        let frame = encode(&Envelope::WebStream(WebStreamMsg::close(3))).unwrap();
        let mut corrupt = BytesMut::from(&frame[..]);
        let too_long = (frame.len() as u32).to_le_bytes();
        corrupt[5..9].copy_from_slice(&too_long);
        assert!(matches!(
            decode(corrupt.freeze()),
            Err(CodecError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_context_tag() {
        let frame = encode(&Envelope::WebStream(WebStreamMsg::close(3))).unwrap();
        let mut corrupt = BytesMut::from(&frame[..]);
        corrupt[4] = 99;
        assert!(matches!(
            decode(corrupt.freeze()),
            Err(CodecError::UnknownContext(99))
        ));
    }

    #[test]
    fn test_data_on_non_stream_context_rejected() {
        let frame = encode(&Envelope::Summon(Summon {
            server_connect_url: "wss://x".into(),
        }))
        .unwrap();
        let mut corrupt = BytesMut::from(&frame[..]);
        corrupt.put_slice(b"junk");
        let new_size = (corrupt.len() - SIZE_PREFIX_LEN) as u32;
        corrupt[..4].copy_from_slice(&new_size.to_le_bytes());
        assert!(matches!(
            decode(corrupt.freeze()),
            Err(CodecError::UnexpectedData(ContextType::Summon, 4))
        ));
    }

    #[test]
    fn test_compression_fields_must_agree() {
        let bad = WebStreamMsg {
            compression: DataCompression::Brotli,
            original_data_size: None,
            ..WebStreamMsg::new(9)
        };
        assert!(matches!(
            encode(&Envelope::WebStream(bad.clone())),
            Err(CodecError::CompressionFields(9))
        ));

        // Hand-build the frame to get past the encoder's check.
        let context = wire_options().serialize(&bad).unwrap();
        let mut frame = BytesMut::new();
        frame.put_u32_le((1 + 4 + context.len()) as u32);
        frame.put_u8(ContextType::WebStream as u8);
        frame.put_u32_le(context.len() as u32);
        frame.put_slice(&context);
        assert!(matches!(
            decode(frame.freeze()),
            Err(CodecError::CompressionFields(9))
        ));
    }

    #[test]
    fn test_priority_tiers() {
        assert!(MessagePriority::Highest.is_high());
        assert!(MessagePriority::High.is_high());
        assert!(!MessagePriority::Normal.is_high());
        assert!(!MessagePriority::Lowest.is_high());
    }

    #[test]
    fn test_path_type_of() {
        assert_eq!(PathType::of("/api/status"), PathType::Relative);
        assert_eq!(PathType::of("https://10.0.0.4/x"), PathType::Absolute);
        assert_eq!(PathType::of("ws://host/socket"), PathType::Absolute);
    }
}
