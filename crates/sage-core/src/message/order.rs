//! Per-session sequence and timestamp ordering.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sage_common::config::{ReplaySettings, SequencePolicySetting};
use sage_crypto::seq_window::{SequenceWindow, WindowVerdict};

use super::{is_empty_timestamp, ControlHeader, ValidationError};

/// How sequence numbers are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SequencePolicy {
    /// Each sequence must exceed the last accepted; gaps are allowed.
    #[default]
    Strict,
    /// Accept reordering inside a window of `size` sequences, each at most once.
    Windowed { size: u64 },
}

impl From<&ReplaySettings> for SequencePolicy {
    fn from(settings: &ReplaySettings) -> Self {
        match settings.sequence_policy {
            SequencePolicySetting::Strict => SequencePolicy::Strict,
            SequencePolicySetting::Windowed => SequencePolicy::Windowed {
                size: settings.window_size,
            },
        }
    }
}

#[derive(Debug, Default)]
struct SequenceState {
    last_sequence: Option<u64>,
    window: Option<SequenceWindow>,
    last_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct OrderManager {
    policy: SequencePolicy,
    tolerance: Duration,
    sessions: Mutex<HashMap<String, SequenceState>>,
}

impl OrderManager {
    /// `tolerance` is how far a timestamp may fall behind the last accepted one.
    pub fn new(policy: SequencePolicy, tolerance: Duration) -> Self {
        Self {
            policy,
            tolerance,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> SequencePolicy {
        self.policy
    }

    /// Check ordering without recording anything.
    pub fn check(&self, header: &ControlHeader, session_id: &str) -> Result<(), ValidationError> {
        let sessions = self.sessions.lock();
        let state = sessions.get(session_id);
        self.evaluate(header, state)
    }

    /// Check ordering and, if accepted, record the header as the session's latest.
    pub fn process_message(
        &self,
        header: &ControlHeader,
        session_id: &str,
    ) -> Result<(), ValidationError> {
        let mut sessions = self.sessions.lock();
        self.evaluate(header, sessions.get(session_id))?;

        let state = sessions.entry(session_id.to_string()).or_default();
        match self.policy {
            SequencePolicy::Strict => {
                state.last_sequence = Some(header.sequence);
            }
            SequencePolicy::Windowed { size } => {
                let window = state.window.get_or_insert_with(|| {
                    SequenceWindow::with_size(size).unwrap_or_default()
                });
                window.check_and_update(header.sequence);
                state.last_sequence = window.highest();
            }
        }
        state.last_timestamp = Some(match state.last_timestamp {
            Some(last) if last > header.timestamp => last,
            _ => header.timestamp,
        });
        Ok(())
    }

    pub fn last_sequence(&self, session_id: &str) -> Option<u64> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|s| s.last_sequence)
    }

    /// Forget a session's ordering state.
    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn evaluate(
        &self,
        header: &ControlHeader,
        state: Option<&SequenceState>,
    ) -> Result<(), ValidationError> {
        if is_empty_timestamp(&header.timestamp) {
            return Err(ValidationError::EmptyTimestamp);
        }
        let Some(state) = state else {
            return Ok(());
        };

        match self.policy {
            SequencePolicy::Strict => {
                if let Some(last) = state.last_sequence {
                    if header.sequence <= last {
                        return Err(ValidationError::SequenceRegression {
                            sequence: header.sequence,
                            last,
                        });
                    }
                }
            }
            SequencePolicy::Windowed { .. } => {
                if let Some(window) = &state.window {
                    match window.check(header.sequence) {
                        WindowVerdict::Accepted => {}
                        WindowVerdict::Repeated => {
                            return Err(ValidationError::SequenceRepeated(header.sequence))
                        }
                        WindowVerdict::Stale => {
                            return Err(ValidationError::SequenceRegression {
                                sequence: header.sequence,
                                last: window.highest().unwrap_or_default(),
                            })
                        }
                    }
                }
            }
        }

        if let Some(last) = state.last_timestamp {
            let behind = (last - header.timestamp).to_std().unwrap_or_default();
            if behind > self.tolerance {
                return Err(ValidationError::TimestampRegression {
                    timestamp: header.timestamp,
                    last,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::generate_nonce;

    fn header(sequence: u64, offset_ms: i64, base: DateTime<Utc>) -> ControlHeader {
        ControlHeader {
            sequence,
            nonce: generate_nonce(),
            timestamp: base + chrono::Duration::milliseconds(offset_ms),
        }
    }

    #[test]
    fn test_strict_monotonic_with_gaps() {
        let order = OrderManager::new(SequencePolicy::Strict, Duration::from_secs(1));
        let now = Utc::now();

        order.process_message(&header(1, 0, now), "s").unwrap();
        order.process_message(&header(5, 10, now), "s").unwrap();
        assert_eq!(order.last_sequence("s"), Some(5));

        let err = order.process_message(&header(5, 20, now), "s").unwrap_err();
        assert_eq!(err, ValidationError::SequenceRegression { sequence: 5, last: 5 });
        assert!(order.process_message(&header(3, 20, now), "s").is_err());

        order.process_message(&header(6, 20, now), "s").unwrap();
        assert_eq!(order.last_sequence("s"), Some(6));
    }

    #[test]
    fn test_sessions_are_independent() {
        let order = OrderManager::new(SequencePolicy::Strict, Duration::from_secs(1));
        let now = Utc::now();

        order.process_message(&header(10, 0, now), "a").unwrap();
        order.process_message(&header(1, 0, now), "b").unwrap();
        assert_eq!(order.len(), 2);
        assert!(order.remove_session("a"));
        order.process_message(&header(1, 0, now), "a").unwrap();
    }

    #[test]
    fn test_timestamp_tolerance() {
        let order = OrderManager::new(SequencePolicy::Strict, Duration::from_secs(1));
        let now = Utc::now();

        order.process_message(&header(1, 0, now), "s").unwrap();
        // within tolerance
        order.process_message(&header(2, -900, now), "s").unwrap();

        let err = order.process_message(&header(3, -1500, now), "s").unwrap_err();
        assert!(matches!(err, ValidationError::TimestampRegression { .. }));
        assert_eq!(order.last_sequence("s"), Some(2));
    }

    #[test]
    fn test_empty_timestamp_rejected() {
        let order = OrderManager::new(SequencePolicy::Strict, Duration::from_secs(1));
        let h = ControlHeader {
            sequence: 1,
            nonce: "n".into(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        };
        assert_eq!(
            order.process_message(&h, "s"),
            Err(ValidationError::EmptyTimestamp)
        );
    }

    #[test]
    fn test_check_does_not_record() {
        let order = OrderManager::new(SequencePolicy::Strict, Duration::from_secs(1));
        let now = Utc::now();
        order.check(&header(1, 0, now), "s").unwrap();
        assert_eq!(order.last_sequence("s"), None);
        assert!(order.is_empty());
    }

    #[test]
    fn test_windowed_allows_bounded_reordering() {
        let order = OrderManager::new(SequencePolicy::Windowed { size: 4 }, Duration::from_secs(5));
        let now = Utc::now();

        order.process_message(&header(10, 0, now), "s").unwrap();
        order.process_message(&header(8, 0, now), "s").unwrap();
        order.process_message(&header(9, 0, now), "s").unwrap();
        assert_eq!(order.last_sequence("s"), Some(10));

        assert_eq!(
            order.process_message(&header(9, 0, now), "s"),
            Err(ValidationError::SequenceRepeated(9))
        );
        assert!(matches!(
            order.process_message(&header(6, 0, now), "s"),
            Err(ValidationError::SequenceRegression { .. })
        ));
    }
}
