//! Nonce tracking with TTL.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::time::Instant;

/// Default time a used nonce is remembered.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(5 * 60);

/// 16 random bytes, base64url without padding.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Remembers nonces until their TTL elapses.
///
/// After expiry a nonce is treated as unused again.
#[derive(Debug)]
pub struct NonceTracker {
    ttl: Duration,
    /// nonce -> expiry
    used: Mutex<HashMap<String, Instant>>,
}

impl Default for NonceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_TTL)
    }
}

impl NonceTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            used: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mark_nonce_used(&self, nonce: &str) {
        let expiry = Instant::now() + self.ttl;
        self.used.lock().insert(nonce.to_string(), expiry);
    }

    pub fn is_nonce_used(&self, nonce: &str) -> bool {
        let now = Instant::now();
        let mut used = self.used.lock();
        match used.get(nonce) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                used.remove(nonce);
                false
            }
            None => false,
        }
    }

    /// Mark `nonce` if it is fresh. Returns false for a replay.
    pub fn check_and_mark(&self, nonce: &str) -> bool {
        let now = Instant::now();
        let mut used = self.used.lock();
        if used.get(nonce).is_some_and(|expiry| *expiry > now) {
            return false;
        }
        used.insert(nonce.to_string(), now + self.ttl);
        true
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut used = self.used.lock();
        let before = used.len();
        used.retain(|_, expiry| *expiry > now);
        before - used.len()
    }

    pub fn len(&self) -> usize {
        self.used.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.lock().is_empty()
    }
}
