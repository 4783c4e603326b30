//! Single entry point for the anti-replay checks.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use sage_common::config::ReplaySettings;
use sage_common::sweep::{spawn_sweeper, SweeperHandle};
use tracing::{debug, warn};

use super::{
    is_empty_timestamp, ControlHeader, DuplicateDetector, NonceTracker, OrderManager,
    SequencePolicy, ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub nonce_ttl: Duration,
    pub duplicate_ttl: Duration,
    /// Allowed backwards drift between consecutive timestamps in a session.
    pub timestamp_tolerance: Duration,
    /// Allowed distance from local time; zero disables the check.
    pub max_clock_skew: Duration,
    pub cleanup_interval: Duration,
    pub sequence_policy: SequencePolicy,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig::from(&ReplaySettings::default())
    }
}

impl From<&ReplaySettings> for ValidatorConfig {
    fn from(settings: &ReplaySettings) -> Self {
        Self {
            nonce_ttl: settings.nonce_ttl(),
            duplicate_ttl: settings.duplicate_ttl(),
            timestamp_tolerance: settings.timestamp_tolerance(),
            max_clock_skew: settings.max_clock_skew(),
            cleanup_interval: settings.cleanup_interval(),
            sequence_policy: SequencePolicy::from(settings),
        }
    }
}

/// Result of [`MessageValidator::validate_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub accepted: bool,
    pub failure: Option<ValidationError>,
    pub processed_sequence: Option<u64>,
}

impl ValidationOutcome {
    fn accepted(sequence: u64) -> Self {
        Self {
            accepted: true,
            failure: None,
            processed_sequence: Some(sequence),
        }
    }

    fn rejected(error: ValidationError) -> Self {
        Self {
            accepted: false,
            failure: Some(error),
            processed_sequence: None,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self.failure, Some(ValidationError::Replay))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self.failure, Some(ValidationError::Duplicate))
    }

    pub fn is_out_of_order(&self) -> bool {
        matches!(
            self.failure,
            Some(ValidationError::SequenceRegression { .. })
                | Some(ValidationError::TimestampRegression { .. })
        )
    }

    /// The accepted sequence, or the rejection.
    pub fn into_result(self) -> Result<u64, ValidationError> {
        match (self.failure, self.processed_sequence) {
            (Some(err), _) => Err(err),
            (None, Some(seq)) => Ok(seq),
            (None, None) => Err(ValidationError::EmptyTimestamp),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorStats {
    pub tracked_nonces: usize,
    pub tracked_packets: usize,
    pub tracked_sessions: usize,
    pub nonce_ttl: Duration,
    pub duplicate_ttl: Duration,
}

#[derive(Debug)]
pub struct MessageValidator {
    config: ValidatorConfig,
    nonces: NonceTracker,
    duplicates: DuplicateDetector,
    order: OrderManager,
    /// Serializes check-then-mark across the three stores.
    gate: Mutex<()>,
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl MessageValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            nonces: NonceTracker::new(config.nonce_ttl),
            duplicates: DuplicateDetector::new(config.duplicate_ttl),
            order: OrderManager::new(config.sequence_policy, config.timestamp_tolerance),
            gate: Mutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Run every check; only a fully accepted message is recorded.
    ///
    /// Order: clock skew, nonce, duplicate, sequence/timestamp ordering.
    pub fn validate_message(&self, header: &ControlHeader, session_id: &str) -> ValidationOutcome {
        let _gate = self.gate.lock();

        if let Err(err) = self.check_clock(header) {
            return self.reject(err, session_id, header);
        }
        if self.nonces.is_nonce_used(&header.nonce) {
            return self.reject(ValidationError::Replay, session_id, header);
        }
        if self.duplicates.is_duplicate(header) {
            return self.reject(ValidationError::Duplicate, session_id, header);
        }
        if let Err(err) = self.order.process_message(header, session_id) {
            return self.reject(err, session_id, header);
        }

        self.nonces.mark_nonce_used(&header.nonce);
        self.duplicates.mark_seen(header);
        ValidationOutcome::accepted(header.sequence)
    }

    /// Drop a session's ordering state once it ends.
    pub fn forget_session(&self, session_id: &str) {
        self.order.remove_session(session_id);
    }

    pub fn last_sequence(&self, session_id: &str) -> Option<u64> {
        self.order.last_sequence(session_id)
    }

    pub fn purge_expired(&self) -> usize {
        let _gate = self.gate.lock();
        self.nonces.purge_expired() + self.duplicates.purge_expired()
    }

    pub fn stats(&self) -> ValidatorStats {
        ValidatorStats {
            tracked_nonces: self.nonces.len(),
            tracked_packets: self.duplicates.len(),
            tracked_sessions: self.order.len(),
            nonce_ttl: self.config.nonce_ttl,
            duplicate_ttl: self.config.duplicate_ttl,
        }
    }

    /// Purge expired nonces and packet hashes every `cleanup_interval`.
    pub fn spawn_cleanup(self: &Arc<Self>) -> SweeperHandle {
        let validator: Weak<Self> = Arc::downgrade(self);
        spawn_sweeper("replay", self.config.cleanup_interval, move || {
            validator.upgrade().map_or(0, |v| v.purge_expired())
        })
    }

    fn check_clock(&self, header: &ControlHeader) -> Result<(), ValidationError> {
        if is_empty_timestamp(&header.timestamp) {
            return Err(ValidationError::EmptyTimestamp);
        }
        if self.config.max_clock_skew.is_zero() {
            return Ok(());
        }
        let skew = (Utc::now() - header.timestamp).abs().to_std().unwrap_or_default();
        if skew > self.config.max_clock_skew {
            return Err(ValidationError::ClockSkew { skew });
        }
        Ok(())
    }

    fn reject(
        &self,
        error: ValidationError,
        session_id: &str,
        header: &ControlHeader,
    ) -> ValidationOutcome {
        match error {
            ValidationError::Replay | ValidationError::Duplicate => {
                warn!(session_id, sequence = header.sequence, %error, "message rejected");
            }
            _ => debug!(session_id, sequence = header.sequence, %error, "message rejected"),
        }
        ValidationOutcome::rejected(error)
    }
}
