//! AEAD-protected session between two agents.
//!
//! # Wire Format
//!
//! ```text
//! [12 bytes: nonce = 0x00000000 || counter (u64 BE)] [ciphertext] [16 bytes: tag]
//! ```
//!
//! The associated data always starts with the session id, so a ciphertext
//! cannot be replayed into another session even if keys collided.
//!
//! A session is `Active` until it is closed or one of its limits trips
//! (absolute age, idle time, message count). Expiry is evaluated lazily on
//! every use and never reverses.

use std::fmt;
use std::time::Duration;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sage_common::config::SessionSettings;
use sage_common::helpers::constant_time_eq;
use sage_common::ErrorKind;
use sha2::Sha256;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::schedule::{DirectionalKeys, Role, ScheduleError, SessionId, SessionKeys};

/// Bytes of nonce prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;
/// Ciphertext expansion over the plaintext.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session expired")]
    Expired,

    #[error("session closed")]
    Closed,

    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("authentication failed")]
    Authentication,

    #[error("nonce counter exhausted")]
    Exhausted,

    #[error("encryption failed")]
    Encryption,

    #[error("key schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Expired | SessionError::Exhausted => ErrorKind::SessionExpired,
            SessionError::Closed => ErrorKind::SessionClosed,
            SessionError::TooShort(_) | SessionError::Authentication => ErrorKind::Authentication,
            SessionError::Encryption => ErrorKind::Internal,
            SessionError::Schedule(e) => e.kind(),
        }
    }
}

/// Session limits. A zero value disables that limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_age: Duration,
    pub idle_timeout: Duration,
    pub max_messages: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_age: settings.max_age(),
            idle_timeout: settings.idle_timeout(),
            max_messages: settings.max_messages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Expired,
    Closed,
}

struct Inner {
    /// `None` once closed.
    keys: Option<DirectionalKeys>,
    send_counter: u64,
    message_count: u64,
    last_used: Instant,
}

/// Established session with per-direction keys.
pub struct SecureSession {
    id: SessionId,
    role: Role,
    config: SessionConfig,
    created_at: Instant,
    inner: Mutex<Inner>,
}

impl SecureSession {
    /// Derive keys from the exporter secret and open a session.
    pub fn new(
        id: SessionId,
        exporter_secret: &[u8],
        role: Role,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let keys = SessionKeys::derive(exporter_secret, &id)?.for_role(role);
        let now = Instant::now();

        Ok(Self {
            id,
            role,
            config,
            created_at: now,
            inner: Mutex::new(Inner {
                keys: Some(keys),
                send_counter: 0,
                message_count: 0,
                last_used: now,
            }),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.inner.lock().last_used
    }

    pub fn message_count(&self) -> u64 {
        self.inner.lock().message_count
    }

    pub fn state(&self) -> SessionState {
        let inner = self.inner.lock();
        self.state_of(&inner, Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.state() == SessionState::Expired
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Encrypt with the session id as associated data.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.seal(plaintext, &[])
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.unseal(ciphertext, &[])
    }

    /// Encrypt binding extra associated data after the session id.
    pub fn encrypt_with_aad(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.seal(plaintext, aad)
    }

    pub fn decrypt_with_aad(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.unseal(ciphertext, aad)
    }

    /// HMAC-SHA256 over covered content with the outbound MAC key.
    pub fn sign_covered(&self, covered: &[u8]) -> Result<[u8; 32], SessionError> {
        let inner = self.inner.lock();
        let keys = self.usable_keys(&inner)?;
        covered_mac(&keys.send_mac, covered)
    }

    /// Check a peer's covered-content MAC with the inbound MAC key.
    pub fn verify_covered(&self, covered: &[u8], mac: &[u8]) -> Result<(), SessionError> {
        let inner = self.inner.lock();
        let keys = self.usable_keys(&inner)?;
        let expected = covered_mac(&keys.recv_mac, covered)?;
        if constant_time_eq(&expected, mac) {
            Ok(())
        } else {
            Err(SessionError::Authentication)
        }
    }

    /// Close the session and wipe its keys. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.keys.take().is_some() {
            debug!(session_id = %self.id, "session closed");
        }
    }

    fn seal(&self, plaintext: &[u8], extra_aad: &[u8]) -> Result<Vec<u8>, SessionError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.usable_keys(&inner)?;

        let counter = inner
            .send_counter
            .checked_add(1)
            .ok_or(SessionError::Exhausted)?;
        let nonce = counter_nonce(counter);

        let ciphertext = {
            let keys = self.usable_keys(&inner)?;
            let cipher = ChaCha20Poly1305::new((&keys.send_enc).into());
            let aad = self.aad(extra_aad);
            cipher
                .encrypt(
                    &nonce,
                    Payload {
                        msg: plaintext,
                        aad: &aad,
                    },
                )
                .map_err(|_| SessionError::Encryption)?
        };

        inner.send_counter = counter;
        inner.message_count += 1;
        inner.last_used = now;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unseal(&self, data: &[u8], extra_aad: &[u8]) -> Result<Vec<u8>, SessionError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if data.len() < OVERHEAD {
            // still report lifecycle problems first
            self.usable_keys(&inner)?;
            return Err(SessionError::TooShort(data.len()));
        }

        let plaintext = {
            let keys = self.usable_keys(&inner)?;
            let cipher = ChaCha20Poly1305::new((&keys.recv_enc).into());
            let (nonce, ciphertext) = data.split_at(NONCE_LEN);
            let aad = self.aad(extra_aad);
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| SessionError::Authentication)?
        };

        inner.message_count += 1;
        inner.last_used = now;
        Ok(plaintext)
    }

    fn aad(&self, extra: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.id.as_bytes().len() + extra.len());
        aad.extend_from_slice(self.id.as_bytes());
        aad.extend_from_slice(extra);
        aad
    }

    fn usable_keys<'a>(&self, inner: &'a Inner) -> Result<&'a DirectionalKeys, SessionError> {
        match self.state_of(inner, Instant::now()) {
            SessionState::Closed => Err(SessionError::Closed),
            SessionState::Expired => Err(SessionError::Expired),
            SessionState::Active => inner.keys.as_ref().ok_or(SessionError::Closed),
        }
    }

    fn state_of(&self, inner: &Inner, now: Instant) -> SessionState {
        if inner.keys.is_none() {
            return SessionState::Closed;
        }

        let SessionConfig {
            max_age,
            idle_timeout,
            max_messages,
        } = self.config;

        let too_old = !max_age.is_zero() && now.duration_since(self.created_at) >= max_age;
        let idle = !idle_timeout.is_zero() && now.duration_since(inner.last_used) >= idle_timeout;
        let worn_out = max_messages > 0 && inner.message_count >= max_messages;

        if too_old || idle || worn_out {
            SessionState::Expired
        } else {
            SessionState::Active
        }
    }
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Nonce for outbound message number `counter`.
fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(nonce)
}

fn covered_mac(key: &[u8; 32], covered: &[u8]) -> Result<[u8; 32], SessionError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| SessionError::Encryption)?;
    mac.update(covered);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::compute_session_id;

    const EXPORTER: [u8; 32] = [7u8; 32];

    fn pair(config: SessionConfig) -> (SecureSession, SecureSession) {
        let id = compute_session_id(&EXPORTER, "ctx", "did:sage:alice", "did:sage:bob");
        let client = SecureSession::new(id.clone(), &EXPORTER, Role::Initiator, config).unwrap();
        let server = SecureSession::new(id, &EXPORTER, Role::Responder, config).unwrap();
        (client, server)
    }

    fn unlimited() -> SessionConfig {
        SessionConfig {
            max_age: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            max_messages: 0,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_both_directions() {
        let (client, server) = pair(SessionConfig::default());

        let ct = client.encrypt(b"hello from client").unwrap();
        assert_eq!(server.decrypt(&ct).unwrap(), b"hello from client");

        let ct = server.encrypt(b"hello from server").unwrap();
        assert_eq!(client.decrypt(&ct).unwrap(), b"hello from server");
    }

    #[tokio::test]
    async fn test_ciphertext_size() {
        let (client, _server) = pair(SessionConfig::default());
        let ct = client.encrypt(b"nineteen bytes long").unwrap();
        assert_eq!(ct.len(), 19 + OVERHEAD);
        assert_eq!(ct.len(), 47);
    }

    #[tokio::test]
    async fn test_nonce_counter_increments() {
        let (client, _server) = pair(SessionConfig::default());
        let first = client.encrypt(b"a").unwrap();
        let second = client.encrypt(b"a").unwrap();

        assert_eq!(&first[..4], &[0u8; 4]);
        assert_eq!(u64::from_be_bytes(first[4..12].try_into().unwrap()), 1);
        assert_eq!(u64::from_be_bytes(second[4..12].try_into().unwrap()), 2);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_own_direction_cannot_decrypt() {
        let (client, _server) = pair(SessionConfig::default());
        let ct = client.encrypt(b"loopback").unwrap();
        assert!(matches!(client.decrypt(&ct), Err(SessionError::Authentication)));
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let (client, server) = pair(unlimited());
        let ct = client.encrypt(b"integrity matters").unwrap();

        for i in 0..ct.len() {
            let mut tampered = ct.clone();
            tampered[i] ^= 0x01;
            let err = server.decrypt(&tampered).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Authentication, "byte {i}");
        }
        assert!(server.decrypt(&ct).is_ok());
    }

    #[tokio::test]
    async fn test_short_ciphertext_rejected() {
        let (_client, server) = pair(SessionConfig::default());
        let err = server.decrypt(&[0u8; 27]).unwrap_err();
        assert!(matches!(err, SessionError::TooShort(27)));
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_aad_binding() {
        let (client, server) = pair(SessionConfig::default());
        let ct = client.encrypt_with_aad(b"payload", b"header-v1").unwrap();

        assert!(server.decrypt_with_aad(&ct, b"header-v2").is_err());
        assert!(server.decrypt(&ct).is_err());
        assert_eq!(server.decrypt_with_aad(&ct, b"header-v1").unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_other_session_cannot_decrypt() {
        let (client, _) = pair(SessionConfig::default());
        let other_id = compute_session_id(&EXPORTER, "other", "did:sage:alice", "did:sage:bob");
        let other =
            SecureSession::new(other_id, &EXPORTER, Role::Responder, SessionConfig::default())
                .unwrap();

        let ct = client.encrypt(b"secret").unwrap();
        assert!(other.decrypt(&ct).is_err());
    }

    #[tokio::test]
    async fn test_covered_signatures() {
        let (client, server) = pair(SessionConfig::default());
        let mac = client.sign_covered(b"@method: POST").unwrap();

        assert!(server.verify_covered(b"@method: POST", &mac).is_ok());
        assert!(matches!(
            server.verify_covered(b"@method: GET", &mac),
            Err(SessionError::Authentication)
        ));
        assert!(client.verify_covered(b"@method: POST", &mac).is_err());
    }

    #[tokio::test]
    async fn test_message_limit_expires_session() {
        let (client, server) = pair(SessionConfig {
            max_messages: 2,
            ..unlimited()
        });

        client.encrypt(b"one").unwrap();
        client.encrypt(b"two").unwrap();
        assert!(client.is_expired());
        let err = client.encrypt(b"three").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionExpired);

        assert_eq!(server.state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (client, server) = pair(SessionConfig {
            idle_timeout: Duration::from_secs(60),
            ..unlimited()
        });

        tokio::time::advance(Duration::from_secs(30)).await;
        let ct = client.encrypt(b"keepalive").unwrap();
        server.decrypt(&ct).unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(client.state(), SessionState::Active);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(matches!(client.encrypt(b"late"), Err(SessionError::Expired)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_never_resurrects() {
        let (client, _server) = pair(SessionConfig {
            max_age: Duration::from_secs(3600),
            ..unlimited()
        });

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(client.is_expired());
        assert!(client.encrypt(b"x").is_err());
        assert!(client.is_expired());
    }

    #[tokio::test]
    async fn test_close_wipes_keys() {
        let (client, server) = pair(SessionConfig::default());
        let ct = client.encrypt(b"before close").unwrap();

        server.close();
        server.close();
        assert!(server.is_closed());
        assert!(matches!(server.decrypt(&ct), Err(SessionError::Closed)));
        assert!(matches!(server.sign_covered(b"x"), Err(SessionError::Closed)));
        assert_eq!(SessionError::Closed.kind(), ErrorKind::SessionClosed);
    }
}
