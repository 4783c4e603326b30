//! Duplicate packet detection.
//!
//! Packets are identified by a hex SHA-256 over their control header, so a
//! retransmitted copy is caught even when nonce tracking was bypassed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::SecondsFormat;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::ControlHeader;

pub const DEFAULT_DUPLICATE_TTL: Duration = Duration::from_secs(3 * 60);

/// Hex SHA-256 of `sequence|nonce|timestamp` (RFC 3339, nanoseconds).
pub fn packet_hash(header: &ControlHeader) -> String {
    let mut hasher = Sha256::new();
    hasher.update(header.sequence.to_be_bytes());
    hasher.update(b"|");
    hasher.update(header.nonce.as_bytes());
    hasher.update(b"|");
    hasher.update(
        header
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
pub struct DuplicateDetector {
    ttl: Duration,
    /// packet hash -> first seen
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_TTL)
    }
}

impl DuplicateDetector {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_duplicate(&self, header: &ControlHeader) -> bool {
        let hash = packet_hash(header);
        let mut seen = self.seen.lock();
        match seen.get(&hash) {
            Some(first_seen) if first_seen.elapsed() <= self.ttl => true,
            Some(_) => {
                seen.remove(&hash);
                false
            }
            None => false,
        }
    }

    pub fn mark_seen(&self, header: &ControlHeader) {
        self.seen.lock().insert(packet_hash(header), Instant::now());
    }

    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, first_seen| first_seen.elapsed() <= ttl);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}
