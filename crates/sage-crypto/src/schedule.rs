//! Session-ID derivation and per-direction key schedule.
//!
//! Everything here is a pure function of the handshake output, so both
//! parties compute identical values without further round trips.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sage_common::helpers::constant_time_eq;
use sage_common::ErrorKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

const SESSION_KEYS_INFO: &[u8] = b"sage/session exporter v1|dir:c2s+s2c";
const ACK_KEY_INFO: &[u8] = b"sage/ack-key v1";
const ACK_LABEL_SERVER: &[u8] = b"sage/ack-tag server v1";
const ACK_LABEL_CLIENT: &[u8] = b"sage/ack-tag client v1";

/// Raw session identifier length before encoding.
pub const SESSION_ID_BYTES: usize = 16;

/// Encoded session identifier length (base64url, no padding).
pub const SESSION_ID_LEN: usize = 22;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("ack tag mismatch")]
    AckTagMismatch,

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("key derivation failed")]
    Kdf,
}

impl ScheduleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScheduleError::AckTagMismatch => ErrorKind::Authentication,
            ScheduleError::InvalidSessionId(_) => ErrorKind::Protocol,
            ScheduleError::Kdf => ErrorKind::Internal,
        }
    }
}

/// Session identifier: 16 bytes of SHA-256, base64url without padding.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn from_bytes(bytes: &[u8; SESSION_ID_BYTES]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse and validate an encoded session id.
    pub fn parse(s: &str) -> Result<Self, ScheduleError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| ScheduleError::InvalidSessionId(e.to_string()))?;
        if bytes.len() != SESSION_ID_BYTES {
            return Err(ScheduleError::InvalidSessionId(format!(
                "expected {SESSION_ID_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The encoded form as bytes; used as HKDF salt and AEAD associated data.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for SessionId {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Derive the session id both parties agree on.
///
/// The seed is each input prefixed with its big-endian `u32` length, so
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn compute_session_id(
    exporter_secret: &[u8],
    context_id: &str,
    client_did: &str,
    server_did: &str,
) -> SessionId {
    let mut hasher = Sha256::new();
    for part in [
        exporter_secret,
        context_id.as_bytes(),
        client_did.as_bytes(),
        server_did.as_bytes(),
    ] {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();

    let mut id = [0u8; SESSION_ID_BYTES];
    id.copy_from_slice(&digest[..SESSION_ID_BYTES]);
    SessionId::from_bytes(&id)
}

/// Which side of the handshake a party played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Client; sends with the c2s keys.
    Initiator,
    /// Server; sends with the s2c keys.
    Responder,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// Both directions' keys, derived in one HKDF expand.
///
/// Layout of the 128-byte output: `[c2s_enc][c2s_mac][s2c_enc][s2c_mac]`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    c2s_enc: [u8; 32],
    c2s_mac: [u8; 32],
    s2c_enc: [u8; 32],
    s2c_mac: [u8; 32],
}

impl SessionKeys {
    pub fn derive(exporter_secret: &[u8], session_id: &SessionId) -> Result<Self, ScheduleError> {
        let hk = Hkdf::<Sha256>::new(Some(session_id.as_bytes()), exporter_secret);
        let mut okm = Zeroizing::new([0u8; 128]);
        hk.expand(SESSION_KEYS_INFO, &mut okm[..])
            .map_err(|_| ScheduleError::Kdf)?;

        let mut keys = SessionKeys {
            c2s_enc: [0u8; 32],
            c2s_mac: [0u8; 32],
            s2c_enc: [0u8; 32],
            s2c_mac: [0u8; 32],
        };
        keys.c2s_enc.copy_from_slice(&okm[0..32]);
        keys.c2s_mac.copy_from_slice(&okm[32..64]);
        keys.s2c_enc.copy_from_slice(&okm[64..96]);
        keys.s2c_mac.copy_from_slice(&okm[96..128]);
        Ok(keys)
    }

    /// Pick send/receive keys for `role`.
    pub fn for_role(&self, role: Role) -> DirectionalKeys {
        match role {
            Role::Initiator => DirectionalKeys {
                send_enc: self.c2s_enc,
                send_mac: self.c2s_mac,
                recv_enc: self.s2c_enc,
                recv_mac: self.s2c_mac,
            },
            Role::Responder => DirectionalKeys {
                send_enc: self.s2c_enc,
                send_mac: self.s2c_mac,
                recv_enc: self.c2s_enc,
                recv_mac: self.c2s_mac,
            },
        }
    }
}

/// Keys as seen by one party.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DirectionalKeys {
    pub send_enc: [u8; 32],
    pub send_mac: [u8; 32],
    pub recv_enc: [u8; 32],
    pub recv_mac: [u8; 32],
}

/// Key used only for Ack Tags, expanded from the HPKE shared secret.
pub fn ack_key(shared_secret: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, ScheduleError> {
    let hk = Hkdf::<Sha256>::from_prk(shared_secret).map_err(|_| ScheduleError::Kdf)?;
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(ACK_KEY_INFO, &mut key[..])
        .map_err(|_| ScheduleError::Kdf)?;
    Ok(key)
}

/// SHA-256 over length-prefixed parts.
pub fn transcript_hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn ack_label(role: Role) -> &'static [u8] {
    match role {
        Role::Responder => ACK_LABEL_SERVER,
        Role::Initiator => ACK_LABEL_CLIENT,
    }
}

/// Key-confirmation tag sent by `role` over the transcript.
pub fn make_ack_tag(
    ack_key: &[u8; 32],
    role: Role,
    transcript: &[u8; 32],
) -> Result<[u8; 32], ScheduleError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(ack_key).map_err(|_| ScheduleError::Kdf)?;
    mac.update(ack_label(role));
    mac.update(transcript);
    Ok(mac.finalize().into_bytes().into())
}

/// Recompute the tag `role` should have sent and compare in constant time.
pub fn verify_ack_tag(
    ack_key: &[u8; 32],
    role: Role,
    transcript: &[u8; 32],
    tag: &[u8],
) -> Result<(), ScheduleError> {
    let expected = make_ack_tag(ack_key, role, transcript)?;
    if constant_time_eq(&expected, tag) {
        Ok(())
    } else {
        Err(ScheduleError::AckTagMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_deterministic() {
        let exporter = [9u8; 32];
        let a = compute_session_id(&exporter, "ctx-1", "did:sage:alice", "did:sage:bob");
        let b = compute_session_id(&exporter, "ctx-1", "did:sage:alice", "did:sage:bob");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), SESSION_ID_LEN);
        assert!(SessionId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_session_id_inputs_matter() {
        let exporter = [9u8; 32];
        let base = compute_session_id(&exporter, "ctx-1", "did:a", "did:b");
        assert_ne!(base, compute_session_id(&exporter, "ctx-2", "did:a", "did:b"));
        assert_ne!(base, compute_session_id(&[8u8; 32], "ctx-1", "did:a", "did:b"));
        assert_ne!(base, compute_session_id(&exporter, "ctx-1", "did:b", "did:a"));
    }

    #[test]
    fn test_session_id_length_prefix_separates_fields() {
        let exporter = [1u8; 32];
        let a = compute_session_id(&exporter, "ab", "c", "d");
        let b = compute_session_id(&exporter, "a", "bc", "d");
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_parse_rejects_bad_input() {
        assert!(SessionId::parse("not base64!!").is_err());
        assert!(SessionId::parse("AAAA").is_err());
    }

    #[test]
    fn test_session_keys_are_directional() {
        let id = compute_session_id(&[3u8; 32], "ctx", "did:a", "did:b");
        let keys = SessionKeys::derive(&[3u8; 32], &id).unwrap();

        let initiator = keys.for_role(Role::Initiator);
        let responder = keys.for_role(Role::Responder);

        assert_eq!(initiator.send_enc, responder.recv_enc);
        assert_eq!(initiator.recv_enc, responder.send_enc);
        assert_eq!(initiator.send_mac, responder.recv_mac);
        assert_ne!(initiator.send_enc, initiator.recv_enc);
        assert_ne!(initiator.send_enc, initiator.send_mac);
    }

    #[test]
    fn test_session_keys_bound_to_session_id() {
        let a = compute_session_id(&[3u8; 32], "ctx-a", "did:a", "did:b");
        let b = compute_session_id(&[3u8; 32], "ctx-b", "did:a", "did:b");
        let ka = SessionKeys::derive(&[3u8; 32], &a).unwrap().for_role(Role::Initiator);
        let kb = SessionKeys::derive(&[3u8; 32], &b).unwrap().for_role(Role::Initiator);
        assert_ne!(ka.send_enc, kb.send_enc);
    }

    #[test]
    fn test_ack_tag_roles_differ() {
        let key = ack_key(&[5u8; 32]).unwrap();
        let th = transcript_hash(&[b"info", b"ctx"]);

        let server = make_ack_tag(&key, Role::Responder, &th).unwrap();
        let client = make_ack_tag(&key, Role::Initiator, &th).unwrap();
        assert_ne!(server, client);

        assert!(verify_ack_tag(&key, Role::Responder, &th, &server).is_ok());
        let err = verify_ack_tag(&key, Role::Initiator, &th, &server).unwrap_err();
        assert_eq!(err.to_string(), "ack tag mismatch");
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_ack_tag_rejects_wrong_key_and_transcript() {
        let key = ack_key(&[5u8; 32]).unwrap();
        let other_key = ack_key(&[6u8; 32]).unwrap();
        let th = transcript_hash(&[b"a", b"b"]);
        let tag = make_ack_tag(&key, Role::Responder, &th).unwrap();

        assert!(verify_ack_tag(&other_key, Role::Responder, &th, &tag).is_err());
        let other_th = transcript_hash(&[b"ab"]);
        assert!(verify_ack_tag(&key, Role::Responder, &other_th, &tag).is_err());
        assert!(verify_ack_tag(&key, Role::Responder, &th, &tag[..31]).is_err());
    }
}
