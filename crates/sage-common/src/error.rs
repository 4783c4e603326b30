//! Common error types for SAGE.
//!
//! Every crate in the workspace keeps its own `thiserror` enum close to the
//! code that raises it. Each of those enums maps onto an [`ErrorKind`], which
//! is the protocol-level taxonomy callers branch on (retry, re-handshake,
//! drop the message, or surface an attack).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using SAGE's shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-level error classification.
///
/// Serialized in snake_case so a peer can report why it aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or invalid KEM key material.
    KeyExchange,
    /// Signature or Ack Tag mismatch, or AEAD tag failure.
    Authentication,
    /// DID lookup failed or the identity is inactive.
    IdentityResolution,
    /// Nonce seen before its TTL elapsed.
    Replay,
    /// Sequence or timestamp went backwards.
    OutOfOrder,
    /// Exact re-delivery of an already accepted message.
    DuplicateMessage,
    /// Session exceeded its age, idle, or message limits.
    SessionExpired,
    /// Session was explicitly closed.
    SessionClosed,
    /// Network-level send/receive failure.
    Transport,
    /// Caller-supplied deadline elapsed.
    Timeout,
    /// Message did not fit the protocol state machine.
    Protocol,
    /// Invalid configuration.
    Config,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Whether the caller may retry the operation (with fresh material).
    ///
    /// Only transport-level and deadline failures are retryable. Crypto and
    /// authentication failures never are.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Timeout)
    }

    /// Whether the error only rejects a single message and leaves an
    /// established session usable.
    pub fn is_per_message(self) -> bool {
        matches!(
            self,
            ErrorKind::Replay | ErrorKind::OutOfOrder | ErrorKind::DuplicateMessage
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::KeyExchange => "key_exchange",
            ErrorKind::Authentication => "authentication",
            ErrorKind::IdentityResolution => "identity_resolution",
            ErrorKind::Replay => "replay",
            ErrorKind::OutOfOrder => "out_of_order",
            ErrorKind::DuplicateMessage => "duplicate_message",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for shared infrastructure (config, I/O).
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Serialization(_) => ErrorKind::Config,
            Error::Io(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_and_timeout_retry() {
        assert!(ErrorKind::Transport.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::KeyExchange.is_retryable());
        assert!(!ErrorKind::IdentityResolution.is_retryable());
    }

    #[test]
    fn test_per_message_kinds() {
        assert!(ErrorKind::Replay.is_per_message());
        assert!(ErrorKind::OutOfOrder.is_per_message());
        assert!(ErrorKind::DuplicateMessage.is_per_message());
        assert!(!ErrorKind::SessionExpired.is_per_message());
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::config("bad").kind(), ErrorKind::Config);
        assert_eq!(Error::internal("oops").kind(), ErrorKind::Internal);
        assert_eq!(ErrorKind::OutOfOrder.to_string(), "out_of_order");
    }
}
