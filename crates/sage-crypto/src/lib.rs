//! Cryptographic core for SAGE.
//!
//! This crate provides:
//! - Agent key pairs (Ed25519, X25519, secp256k1, RSA)
//! - HPKE-style key encapsulation over X25519 + HKDF-SHA256
//! - Session-ID derivation, directional key schedule and Ack Tags
//! - ChaCha20-Poly1305 sessions with lifecycle limits
//! - A concurrent session store
//!
//! # Design
//!
//! Both handshake parties feed the same HPKE output through the same pure
//! key schedule, so the session id and keys agree without extra round
//! trips. Outbound traffic uses an explicit 64-bit counter nonce carried in
//! the ciphertext, so decryption does not depend on delivery order.

#![forbid(unsafe_code)]

pub mod hpke;
pub mod keys;
pub mod manager;
pub mod schedule;
pub mod seq_window;
pub mod session;

pub use hpke::{HpkeError, HpkeOutput, HpkeSecrets};
pub use keys::{KeyAlgorithm, KeyError, KeyPair, PublicKey};
pub use manager::{ManagerError, SessionManager, SessionStats};
pub use schedule::{Role, ScheduleError, SessionId, SessionKeys};
pub use seq_window::{SequenceWindow, WindowVerdict};
pub use session::{SecureSession, SessionConfig, SessionError, SessionState};
