//! Error types for the tunnel agent.
//!
//! | Domain      | Type            | Consequence                                  |
//! |-------------|-----------------|----------------------------------------------|
//! | Wire format | [`CodecError`]  | protocol fault, session torn down            |
//! | Session     | [`TunnelError`] | see [`TunnelError::is_protocol_fault`]       |
//! | Local call  | [`FetchError`]  | try next candidate, else close the stream    |
//! | Startup     | [`ConfigError`] | process exits                                |
//!
//! [`CodecError`]: crate::tunnel::codec::CodecError

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::tunnel::codec::CodecError;

/// Boxed error used for local response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of the tunnel transport or of one of its logical streams.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Malformed envelope or size mismatch from the relay.
    #[error("protocol fault: {0}")]
    Codec(#[from] CodecError),

    /// Relay and agent disagree about stream state.
    #[error("protocol fault: {0}")]
    Protocol(String),

    /// Failure confined to a single logical stream.
    #[error("stream {stream_id} failed: {message}")]
    Stream { stream_id: u32, message: String },

    /// Relay unreachable or the socket broke.
    #[error("relay connection failed: {0}")]
    Connect(#[from] WsError),

    /// The session this stream belonged to is gone.
    #[error("session closed")]
    SessionClosed,

    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),
}

impl TunnelError {
    pub fn stream(stream_id: u32, message: impl Into<String>) -> Self {
        Self::Stream {
            stream_id,
            message: message.into(),
        }
    }

    /// Protocol faults tear down the whole physical connection.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, Self::Codec(_) | Self::Protocol(_))
    }
}

/// A single local candidate could not be reached.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid local url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("local request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("local request to {url} timed out")]
    Timeout { url: String },
}

/// Configuration could not be loaded.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_fault_classification() {
        assert!(TunnelError::Protocol("duplicate open".into()).is_protocol_fault());
        assert!(TunnelError::Codec(CodecError::TooShort(3)).is_protocol_fault());
        assert!(!TunnelError::stream(4, "connection refused").is_protocol_fault());
        assert!(!TunnelError::SessionClosed.is_protocol_fault());
    }
}
