//! Agent key material.
//!
//! A [`KeyPair`] is one of four closed algorithm variants. Signing keys
//! (Ed25519, secp256k1, RSA) authenticate handshake messages; X25519 keys
//! are used only for key agreement.
//!
//! Encoded lengths:
//!
//! | Algorithm | Private | Public |
//! |-----------|---------|--------|
//! | Ed25519   | 64 (seed ‖ public) | 32 |
//! | X25519    | 32 | 32 |
//! | secp256k1 | 32 | 33 compressed, 65 uncompressed |
//! | RSA       | PKCS#8 DER | SPKI DER |
//!
//! # Example
//!
//! ```
//! use sage_crypto::keys::{KeyAlgorithm, KeyPair};
//!
//! let keypair = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
//! let signature = keypair.sign(b"challenge").unwrap();
//! keypair.public_key().verify(b"challenge", &signature).unwrap();
//! ```

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer as _, Verifier as _};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sage_common::ErrorKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// RSA modulus size used by [`KeyPair::generate`].
pub const RSA_DEFAULT_BITS: usize = 2048;

/// Errors raised while creating, encoding or using keys.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("{op} is not supported for {algorithm} keys")]
    UnsupportedOperation {
        op: &'static str,
        algorithm: KeyAlgorithm,
    },

    #[error("invalid {algorithm} key length: expected {expected}, got {actual}")]
    InvalidLength {
        algorithm: KeyAlgorithm,
        expected: &'static str,
        actual: usize,
    },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("unknown key algorithm: {0}")]
    UnknownAlgorithm(String),
}

impl KeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyError::InvalidSignature => ErrorKind::Authentication,
            KeyError::InvalidLength { .. } | KeyError::InvalidKey(_) => ErrorKind::KeyExchange,
            KeyError::UnsupportedOperation { .. } | KeyError::UnknownAlgorithm(_) => {
                ErrorKind::Protocol
            }
        }
    }
}

/// Key algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Ed25519,
    X25519,
    Secp256k1,
    Rsa,
}

impl KeyAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::X25519 => "x25519",
            KeyAlgorithm::Secp256k1 => "secp256k1",
            KeyAlgorithm::Rsa => "rsa",
        }
    }

    /// Whether keys of this algorithm can produce signatures.
    pub fn can_sign(self) -> bool {
        !matches!(self, KeyAlgorithm::X25519)
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(KeyAlgorithm::Ed25519),
            "x25519" => Ok(KeyAlgorithm::X25519),
            "secp256k1" => Ok(KeyAlgorithm::Secp256k1),
            "rsa" => Ok(KeyAlgorithm::Rsa),
            other => Err(KeyError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Private key material plus its public half.
///
/// Private material is wiped on drop.
pub enum KeyPair {
    Ed25519(ed25519_dalek::SigningKey),
    X25519(x25519_dalek::StaticSecret),
    Secp256k1(secp256k1::SecretKey),
    Rsa(Box<RsaPrivateKey>),
}

impl KeyPair {
    /// Generate a fresh key pair using the OS CSPRNG.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self, KeyError> {
        Ok(match algorithm {
            KeyAlgorithm::Ed25519 => {
                KeyPair::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng))
            }
            KeyAlgorithm::X25519 => {
                KeyPair::X25519(x25519_dalek::StaticSecret::random_from_rng(OsRng))
            }
            KeyAlgorithm::Secp256k1 => KeyPair::Secp256k1(secp256k1::SecretKey::new(&mut OsRng)),
            KeyAlgorithm::Rsa => {
                let key = RsaPrivateKey::new(&mut OsRng, RSA_DEFAULT_BITS)
                    .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
                KeyPair::Rsa(Box::new(key))
            }
        })
    }

    /// Import private key bytes in the encoding [`KeyPair::private_key_bytes`] produces.
    ///
    /// Ed25519 also accepts a bare 32-byte seed.
    pub fn from_private_bytes(algorithm: KeyAlgorithm, bytes: &[u8]) -> Result<Self, KeyError> {
        match algorithm {
            KeyAlgorithm::Ed25519 => match bytes.len() {
                32 => {
                    let mut seed = Zeroizing::new([0u8; 32]);
                    seed.copy_from_slice(bytes);
                    Ok(KeyPair::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)))
                }
                64 => {
                    let mut full = Zeroizing::new([0u8; 64]);
                    full.copy_from_slice(bytes);
                    let key = ed25519_dalek::SigningKey::from_keypair_bytes(&full)
                        .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
                    Ok(KeyPair::Ed25519(key))
                }
                actual => Err(KeyError::InvalidLength {
                    algorithm,
                    expected: "32 or 64",
                    actual,
                }),
            },
            KeyAlgorithm::X25519 => {
                let mut raw = Zeroizing::new([0u8; 32]);
                if bytes.len() != 32 {
                    return Err(KeyError::InvalidLength {
                        algorithm,
                        expected: "32",
                        actual: bytes.len(),
                    });
                }
                raw.copy_from_slice(bytes);
                Ok(KeyPair::X25519(x25519_dalek::StaticSecret::from(*raw)))
            }
            KeyAlgorithm::Secp256k1 => {
                if bytes.len() != 32 {
                    return Err(KeyError::InvalidLength {
                        algorithm,
                        expected: "32",
                        actual: bytes.len(),
                    });
                }
                let key = secp256k1::SecretKey::from_slice(bytes)
                    .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
                Ok(KeyPair::Secp256k1(key))
            }
            KeyAlgorithm::Rsa => {
                let key = RsaPrivateKey::from_pkcs8_der(bytes)
                    .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
                Ok(KeyPair::Rsa(Box::new(key)))
            }
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            KeyPair::Ed25519(_) => KeyAlgorithm::Ed25519,
            KeyPair::X25519(_) => KeyAlgorithm::X25519,
            KeyPair::Secp256k1(_) => KeyAlgorithm::Secp256k1,
            KeyPair::Rsa(_) => KeyAlgorithm::Rsa,
        }
    }

    /// Derive the public half.
    pub fn public_key(&self) -> PublicKey {
        match self {
            KeyPair::Ed25519(sk) => PublicKey::Ed25519(sk.verifying_key()),
            KeyPair::X25519(sk) => PublicKey::X25519(x25519_dalek::PublicKey::from(sk)),
            KeyPair::Secp256k1(sk) => {
                let secp = secp256k1::Secp256k1::signing_only();
                PublicKey::Secp256k1(secp256k1::PublicKey::from_secret_key(&secp, sk))
            }
            KeyPair::Rsa(sk) => PublicKey::Rsa(Box::new(sk.to_public_key())),
        }
    }

    /// Encoded public key (compressed form for secp256k1).
    pub fn public_key_bytes(&self) -> Result<Vec<u8>, KeyError> {
        self.public_key().to_bytes()
    }

    /// Encoded private key. The buffer is wiped when dropped.
    pub fn private_key_bytes(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        Ok(match self {
            KeyPair::Ed25519(sk) => Zeroizing::new(sk.to_keypair_bytes().to_vec()),
            KeyPair::X25519(sk) => Zeroizing::new(sk.to_bytes().to_vec()),
            KeyPair::Secp256k1(sk) => Zeroizing::new(sk.secret_bytes().to_vec()),
            KeyPair::Rsa(sk) => {
                let der = sk
                    .to_pkcs8_der()
                    .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
                Zeroizing::new(der.as_bytes().to_vec())
            }
        })
    }

    /// Sign `message`.
    ///
    /// secp256k1 and RSA sign the SHA-256 digest; Ed25519 signs the message
    /// directly. X25519 keys cannot sign.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        match self {
            KeyPair::Ed25519(sk) => Ok(sk.sign(message).to_bytes().to_vec()),
            KeyPair::X25519(_) => Err(KeyError::UnsupportedOperation {
                op: "sign",
                algorithm: KeyAlgorithm::X25519,
            }),
            KeyPair::Secp256k1(sk) => {
                let secp = secp256k1::Secp256k1::signing_only();
                let msg = secp256k1::Message::from_digest(Sha256::digest(message).into());
                Ok(secp.sign_ecdsa(&msg, sk).serialize_compact().to_vec())
            }
            KeyPair::Rsa(sk) => {
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(sk.as_ref().clone());
                let signature = signer
                    .try_sign(message)
                    .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
                Ok(signature.to_vec())
            }
        }
    }

    /// The X25519 secret, for key agreement.
    pub fn as_x25519(&self) -> Option<&x25519_dalek::StaticSecret> {
        match self {
            KeyPair::X25519(sk) => Some(sk),
            _ => None,
        }
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        // dalek keys and rsa zeroize themselves; secp256k1 keys are Copy
        if let KeyPair::Secp256k1(sk) = self {
            sk.non_secure_erase();
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

/// Verification-only key, typically resolved from a DID document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Ed25519(ed25519_dalek::VerifyingKey),
    X25519(x25519_dalek::PublicKey),
    Secp256k1(secp256k1::PublicKey),
    Rsa(Box<RsaPublicKey>),
}

impl PublicKey {
    /// Parse an encoded public key.
    pub fn from_bytes(algorithm: KeyAlgorithm, bytes: &[u8]) -> Result<Self, KeyError> {
        let wrong_len = |expected| KeyError::InvalidLength {
            algorithm,
            expected,
            actual: bytes.len(),
        };

        match algorithm {
            KeyAlgorithm::Ed25519 => {
                let raw: [u8; 32] = bytes.try_into().map_err(|_| wrong_len("32"))?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&raw)
                    .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
                Ok(PublicKey::Ed25519(key))
            }
            KeyAlgorithm::X25519 => {
                let raw: [u8; 32] = bytes.try_into().map_err(|_| wrong_len("32"))?;
                Ok(PublicKey::X25519(x25519_dalek::PublicKey::from(raw)))
            }
            KeyAlgorithm::Secp256k1 => {
                if bytes.len() != 33 && bytes.len() != 65 {
                    return Err(wrong_len("33 or 65"));
                }
                let key = secp256k1::PublicKey::from_slice(bytes)
                    .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
                Ok(PublicKey::Secp256k1(key))
            }
            KeyAlgorithm::Rsa => {
                let key = RsaPublicKey::from_public_key_der(bytes)
                    .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
                Ok(PublicKey::Rsa(Box::new(key)))
            }
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            PublicKey::Ed25519(_) => KeyAlgorithm::Ed25519,
            PublicKey::X25519(_) => KeyAlgorithm::X25519,
            PublicKey::Secp256k1(_) => KeyAlgorithm::Secp256k1,
            PublicKey::Rsa(_) => KeyAlgorithm::Rsa,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, KeyError> {
        Ok(match self {
            PublicKey::Ed25519(pk) => pk.as_bytes().to_vec(),
            PublicKey::X25519(pk) => pk.as_bytes().to_vec(),
            PublicKey::Secp256k1(pk) => pk.serialize().to_vec(),
            PublicKey::Rsa(pk) => pk
                .to_public_key_der()
                .map_err(|e| KeyError::InvalidKey(e.to_string()))?
                .into_vec(),
        })
    }

    /// Uncompressed SEC1 encoding; only meaningful for secp256k1.
    pub fn to_uncompressed_bytes(&self) -> Result<Vec<u8>, KeyError> {
        match self {
            PublicKey::Secp256k1(pk) => Ok(pk.serialize_uncompressed().to_vec()),
            other => Err(KeyError::UnsupportedOperation {
                op: "uncompressed encoding",
                algorithm: other.algorithm(),
            }),
        }
    }

    /// Verify a signature produced by [`KeyPair::sign`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        match self {
            PublicKey::Ed25519(pk) => {
                let sig = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| KeyError::InvalidSignature)?;
                pk.verify(message, &sig)
                    .map_err(|_| KeyError::InvalidSignature)
            }
            PublicKey::X25519(_) => Err(KeyError::UnsupportedOperation {
                op: "verify",
                algorithm: KeyAlgorithm::X25519,
            }),
            PublicKey::Secp256k1(pk) => {
                let secp = secp256k1::Secp256k1::verification_only();
                let msg = secp256k1::Message::from_digest(Sha256::digest(message).into());
                let sig = secp256k1::ecdsa::Signature::from_compact(signature)
                    .map_err(|_| KeyError::InvalidSignature)?;
                secp.verify_ecdsa(&msg, &sig, pk)
                    .map_err(|_| KeyError::InvalidSignature)
            }
            PublicKey::Rsa(pk) => {
                let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(pk.as_ref().clone());
                let sig = rsa::pkcs1v15::Signature::try_from(signature)
                    .map_err(|_| KeyError::InvalidSignature)?;
                verifier
                    .verify(message, &sig)
                    .map_err(|_| KeyError::InvalidSignature)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_lengths() {
        let ed = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        assert_eq!(ed.public_key_bytes().unwrap().len(), 32);
        assert_eq!(ed.private_key_bytes().unwrap().len(), 64);

        let x = KeyPair::generate(KeyAlgorithm::X25519).unwrap();
        assert_eq!(x.public_key_bytes().unwrap().len(), 32);
        assert_eq!(x.private_key_bytes().unwrap().len(), 32);

        let k = KeyPair::generate(KeyAlgorithm::Secp256k1).unwrap();
        assert_eq!(k.public_key_bytes().unwrap().len(), 33);
        assert_eq!(k.public_key().to_uncompressed_bytes().unwrap().len(), 65);
        assert_eq!(k.private_key_bytes().unwrap().len(), 32);
    }

    #[test]
    fn test_sign_verify_ed25519() {
        let keypair = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        let signature = keypair.sign(b"hello sage").unwrap();
        assert_eq!(signature.len(), 64);

        let public = keypair.public_key();
        assert!(public.verify(b"hello sage", &signature).is_ok());
        assert!(matches!(
            public.verify(b"wrong message", &signature),
            Err(KeyError::InvalidSignature)
        ));
    }

    #[test]
    fn test_sign_verify_secp256k1() {
        let keypair = KeyPair::generate(KeyAlgorithm::Secp256k1).unwrap();
        let signature = keypair.sign(b"hello sage").unwrap();

        let public =
            PublicKey::from_bytes(KeyAlgorithm::Secp256k1, &keypair.public_key_bytes().unwrap())
                .unwrap();
        assert!(public.verify(b"hello sage", &signature).is_ok());
        assert!(public.verify(b"hello sagf", &signature).is_err());
    }

    #[test]
    fn test_sign_verify_rsa_and_der_roundtrip() {
        let keypair = KeyPair::generate(KeyAlgorithm::Rsa).unwrap();
        let der = keypair.private_key_bytes().unwrap();
        let restored = KeyPair::from_private_bytes(KeyAlgorithm::Rsa, &der).unwrap();

        let signature = restored.sign(b"hello sage").unwrap();
        let public =
            PublicKey::from_bytes(KeyAlgorithm::Rsa, &keypair.public_key_bytes().unwrap()).unwrap();
        assert!(public.verify(b"hello sage", &signature).is_ok());
    }

    #[test]
    fn test_x25519_cannot_sign() {
        let keypair = KeyPair::generate(KeyAlgorithm::X25519).unwrap();
        let err = keypair.sign(b"nope").unwrap_err();
        assert!(matches!(err, KeyError::UnsupportedOperation { .. }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_private_bytes_roundtrip() {
        for algorithm in [
            KeyAlgorithm::Ed25519,
            KeyAlgorithm::X25519,
            KeyAlgorithm::Secp256k1,
        ] {
            let keypair = KeyPair::generate(algorithm).unwrap();
            let private = keypair.private_key_bytes().unwrap();
            let restored = KeyPair::from_private_bytes(algorithm, &private).unwrap();
            assert_eq!(
                restored.public_key_bytes().unwrap(),
                keypair.public_key_bytes().unwrap(),
                "{algorithm}"
            );
        }
    }

    #[test]
    fn test_ed25519_seed_import() {
        let keypair = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        let private = keypair.private_key_bytes().unwrap();
        let from_seed = KeyPair::from_private_bytes(KeyAlgorithm::Ed25519, &private[..32]).unwrap();
        assert_eq!(
            from_seed.public_key_bytes().unwrap(),
            keypair.public_key_bytes().unwrap()
        );
    }

    #[test]
    fn test_invalid_lengths_rejected() {
        assert!(matches!(
            PublicKey::from_bytes(KeyAlgorithm::Ed25519, &[0u8; 31]),
            Err(KeyError::InvalidLength { .. })
        ));
        assert!(matches!(
            KeyPair::from_private_bytes(KeyAlgorithm::X25519, &[0u8; 16]),
            Err(KeyError::InvalidLength { .. })
        ));
        assert!(matches!(
            PublicKey::from_bytes(KeyAlgorithm::Secp256k1, &[2u8; 40]),
            Err(KeyError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("Ed25519".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Ed25519);
        assert!("dsa".parse::<KeyAlgorithm>().is_err());
        assert!(!KeyAlgorithm::X25519.can_sign());
    }
}
