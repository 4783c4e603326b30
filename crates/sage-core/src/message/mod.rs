//! Anti-replay and ordering layer.
//!
//! Every protocol or application message carries a [`ControlHeader`]. The
//! [`MessageValidator`](validator::MessageValidator) runs four independent
//! checks over it:
//!
//! 1. clock skew against local time
//! 2. nonce reuse ([`nonce::NonceTracker`])
//! 3. exact re-delivery ([`dedupe::DuplicateDetector`])
//! 4. sequence and timestamp ordering per session ([`order::OrderManager`])

pub mod dedupe;
pub mod nonce;
pub mod order;
pub mod validator;

use std::time::Duration;

use chrono::{DateTime, Utc};
use sage_common::ErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dedupe::DuplicateDetector;
pub use nonce::{generate_nonce, NonceTracker};
pub use order::{OrderManager, SequencePolicy};
pub use validator::{MessageValidator, ValidationOutcome, ValidatorConfig, ValidatorStats};

/// Replay-protection fields carried by every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlHeader {
    pub sequence: u64,
    pub nonce: String,
    pub timestamp: DateTime<Utc>,
}

impl ControlHeader {
    /// Header with a fresh random nonce stamped with the current time.
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            nonce: generate_nonce(),
            timestamp: Utc::now(),
        }
    }
}

/// Why a message was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("empty timestamp")]
    EmptyTimestamp,

    #[error("timestamp outside tolerance window: {skew:?}")]
    ClockSkew { skew: Duration },

    #[error("nonce has been used before (replay attack detected)")]
    Replay,

    #[error("duplicate packet detected")]
    Duplicate,

    #[error("invalid sequence: {sequence} <= last {last}")]
    SequenceRegression { sequence: u64, last: u64 },

    #[error("sequence {0} already accepted")]
    SequenceRepeated(u64),

    #[error("out-of-order: timestamp {timestamp} before {last}")]
    TimestampRegression {
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::EmptyTimestamp => ErrorKind::Protocol,
            ValidationError::ClockSkew { .. }
            | ValidationError::Replay
            | ValidationError::SequenceRepeated(_) => ErrorKind::Replay,
            ValidationError::Duplicate => ErrorKind::DuplicateMessage,
            ValidationError::SequenceRegression { .. }
            | ValidationError::TimestampRegression { .. } => ErrorKind::OutOfOrder,
        }
    }
}

/// The Unix epoch stands in for "no timestamp".
pub(crate) fn is_empty_timestamp(ts: &DateTime<Utc>) -> bool {
    ts.timestamp() == 0 && ts.timestamp_subsec_nanos() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_has_fresh_nonce() {
        let a = ControlHeader::new(1);
        let b = ControlHeader::new(1);
        assert_ne!(a.nonce, b.nonce);
        assert!(!is_empty_timestamp(&a.timestamp));
    }

    #[test]
    fn test_header_json_shape() {
        let header = ControlHeader {
            sequence: 7,
            nonce: "abc".into(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["nonce"], "abc");
        assert!(is_empty_timestamp(&header.timestamp));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ValidationError::Replay.kind(), ErrorKind::Replay);
        assert_eq!(ValidationError::Duplicate.kind(), ErrorKind::DuplicateMessage);
        assert_eq!(
            ValidationError::SequenceRegression { sequence: 1, last: 2 }.kind(),
            ErrorKind::OutOfOrder
        );
        assert!(ValidationError::Replay.kind().is_per_message());
    }
}
