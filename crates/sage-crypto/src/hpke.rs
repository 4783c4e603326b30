//! HPKE-style key encapsulation over X25519 and HKDF-SHA256.
//!
//! Suite: `x25519-hkdf-sha256-chacha20poly1305`
//!
//! # Flow
//!
//! ```text
//! Sender                                   Receiver
//!   |                                         |
//!   |  derive(eph_s, receiver_pub, info)      |
//!   |     enc = eph_s.public                  |
//!   |---------------- enc ------------------->|
//!   |                                         |  open(receiver_priv, enc, info)
//!   [  identical shared_secret + exporter_secret ]
//! ```
//!
//! Key schedule (both sides):
//!
//! ```text
//! dh            = X25519(priv, peer_pub)          all-zero output is rejected
//! kem_context   = enc || receiver_pub
//! prk           = HKDF-Extract("sage/hpke-kem v1", dh || kem_context)
//! shared_secret = HKDF-Expand(prk, "sage/hpke shared-secret v1" || info, 32)
//! exporter      = HKDF-Expand(prk, "sage/hpke exporter v1" || info, 32)
//! ```

use hkdf::Hkdf;
use sage_common::helpers::is_all_zero;
use sage_common::ErrorKind;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::keys::KeyPair;

/// The only negotiable suite.
pub const SUITE: &str = "x25519-hkdf-sha256-chacha20poly1305";

/// Length of an encapsulated key (an X25519 public key).
pub const ENC_LEN: usize = 32;

const KEM_SALT: &[u8] = b"sage/hpke-kem v1";
const SHARED_SECRET_LABEL: &[u8] = b"sage/hpke shared-secret v1";
const EXPORTER_LABEL: &[u8] = b"sage/hpke exporter v1";
const COMBINER_LABEL: &[u8] = b"sage/hpke combiner v1";

/// HPKE errors.
#[derive(Debug, Error)]
pub enum HpkeError {
    #[error("invalid encapsulated key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("low-order public key")]
    LowOrderPoint,

    #[error("key agreement requires an x25519 key")]
    NotX25519,

    #[error("key derivation failed")]
    Kdf,
}

impl HpkeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HpkeError::Kdf => ErrorKind::Internal,
            _ => ErrorKind::KeyExchange,
        }
    }
}

/// Secrets produced by one KEM run. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HpkeSecrets {
    shared_secret: [u8; 32],
    exporter_secret: [u8; 32],
}

impl HpkeSecrets {
    pub fn new(shared_secret: [u8; 32], exporter_secret: [u8; 32]) -> Self {
        Self {
            shared_secret,
            exporter_secret,
        }
    }

    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }

    pub fn exporter_secret(&self) -> &[u8; 32] {
        &self.exporter_secret
    }
}

impl std::fmt::Debug for HpkeSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HpkeSecrets(..)")
    }
}

/// Sender-side result: the encapsulated key to transmit plus the secrets.
#[derive(Debug)]
pub struct HpkeOutput {
    pub encapsulated_key: [u8; ENC_LEN],
    pub secrets: HpkeSecrets,
}

/// Encapsulate to `receiver_pub` using the sender's ephemeral X25519 key.
pub fn derive(
    sender_ephemeral: &KeyPair,
    receiver_pub: &[u8],
    info: &[u8],
) -> Result<HpkeOutput, HpkeError> {
    let sender = sender_ephemeral.as_x25519().ok_or(HpkeError::NotX25519)?;
    let receiver = parse_public(receiver_pub)?;
    let enc = *X25519Public::from(sender).as_bytes();

    let secrets = key_schedule(sender, &receiver, &enc, receiver.as_bytes(), info)?;
    Ok(HpkeOutput {
        encapsulated_key: enc,
        secrets,
    })
}

/// Decapsulate `encapsulated_key` with the receiver's private key.
///
/// Produces the same secrets as the matching [`derive`] call.
pub fn open(
    receiver_priv: &KeyPair,
    encapsulated_key: &[u8],
    info: &[u8],
) -> Result<HpkeSecrets, HpkeError> {
    let receiver = receiver_priv.as_x25519().ok_or(HpkeError::NotX25519)?;
    let enc = parse_public(encapsulated_key)?;
    let receiver_pub = X25519Public::from(receiver);

    key_schedule(receiver, &enc, enc.as_bytes(), receiver_pub.as_bytes(), info)
}

/// `"sage/hpke-handshake v1|ctx:<ctx>|init:<client>|resp:<server>"`
pub fn build_info(context_id: &str, client_did: &str, server_did: &str) -> String {
    format!("sage/hpke-handshake v1|ctx:{context_id}|init:{client_did}|resp:{server_did}")
}

/// `"sage/hpke-export v1|suite:<suite>|ctx:<ctx>"`
pub fn build_export_context(context_id: &str) -> String {
    format!("sage/hpke-export v1|suite:{SUITE}|ctx:{context_id}")
}

/// Mix several 32-byte secrets into one, bound to `export_context`.
pub fn combine_secrets(
    parts: &[&[u8; 32]],
    export_context: &[u8],
) -> Result<Zeroizing<[u8; 32]>, HpkeError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(parts.len() * 32));
    for part in parts {
        ikm.extend_from_slice(&part[..]);
    }

    let hk = Hkdf::<Sha256>::new(Some(export_context), &ikm);
    let mut out = Zeroizing::new([0u8; 32]);
    hk.expand(COMBINER_LABEL, &mut out[..])
        .map_err(|_| HpkeError::Kdf)?;
    Ok(out)
}

fn parse_public(bytes: &[u8]) -> Result<X25519Public, HpkeError> {
    let raw: [u8; ENC_LEN] = bytes
        .try_into()
        .map_err(|_| HpkeError::InvalidKeyLength(bytes.len()))?;
    Ok(X25519Public::from(raw))
}

fn key_schedule(
    private: &StaticSecret,
    peer: &X25519Public,
    enc: &[u8; ENC_LEN],
    receiver_pub: &[u8; ENC_LEN],
    info: &[u8],
) -> Result<HpkeSecrets, HpkeError> {
    let dh = private.diffie_hellman(peer);
    if is_all_zero(dh.as_bytes()) {
        return Err(HpkeError::LowOrderPoint);
    }

    let mut ikm = Zeroizing::new([0u8; 32 + 2 * ENC_LEN]);
    ikm[..32].copy_from_slice(dh.as_bytes());
    ikm[32..32 + ENC_LEN].copy_from_slice(enc);
    ikm[32 + ENC_LEN..].copy_from_slice(receiver_pub);

    let hk = Hkdf::<Sha256>::new(Some(KEM_SALT), &ikm[..]);

    let mut shared_secret = [0u8; 32];
    let mut exporter_secret = [0u8; 32];
    hk.expand_multi_info(&[SHARED_SECRET_LABEL, info], &mut shared_secret)
        .map_err(|_| HpkeError::Kdf)?;
    hk.expand_multi_info(&[EXPORTER_LABEL, info], &mut exporter_secret)
        .map_err(|_| HpkeError::Kdf)?;

    Ok(HpkeSecrets::new(shared_secret, exporter_secret))
}
