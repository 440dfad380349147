//! Error taxonomy.
//!
//! - [`DecodeError`]: one malformed or mismatched message. Always recoverable;
//!   the receiving loop drops the message and keeps going.
//! - [`NetError`]: everything a caller of the client API can see. Transport
//!   variants are surfaced and never retried automatically.
//!
//! Disconnection is not an error; see `DisconnectReason` in the client crate.

use std::io;

use thiserror::Error;

/// Failure to turn bytes into a [`crate::protocol::Message`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not UTF-8 JSON, or no `type` tag.
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    /// Tag requires a payload but none was present.
    #[error("`{kind}` message is missing its payload")]
    MissingPayload { kind: &'static str },
    /// Payload present but does not match the tag's shape.
    #[error("`{kind}` payload has the wrong shape: {source}")]
    IncompatiblePayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by the network layer.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("connect to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("not connected")]
    NotConnected,
    #[error("already connected or connecting")]
    AlreadyConnected,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl NetError {
    /// Wraps an I/O error with a short description of what was being done.
    pub fn transport(context: &'static str, source: io::Error) -> Self {
        NetError::Transport { context, source }
    }

    /// True for connect/send/receive failures of the underlying sockets.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            NetError::Transport { .. } | NetError::ConnectTimeout { .. } | NetError::FrameTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_errors() {
        let err = NetError::transport("tcp read", io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_transport());
        assert!(err.to_string().starts_with("tcp read"));
        assert!(!NetError::NotConnected.is_transport());
        assert!(!NetError::ProtocolViolation("snapshot before identity".into()).is_transport());
    }
}
