//! Four-message authenticated key exchange.
//!
//! ```text
//! client                                   server
//!   Invitation {suites}          ──▶  resolve client DID, verify signature
//!                                ◀──  InvitationAck {suite}
//!   Request {ephemeral_c, static_kem}  ──▶  open static leg, derive ephemeral leg
//!                                ◀──  Response {ephemeral_s, ack_tag, signature}
//!   Complete {ack_tag}           ──▶  verify tag, create responder session
//!                                ◀──  CompleteAck {session_id, key_id}
//! ```
//!
//! Both sides combine the static KEM leg (when the server publishes a KEM key)
//! with the ephemeral leg, then derive the session id and keys from the
//! combined exporter secret. The Ack Tags prove both sides hold the same
//! shared secret before any session exists.

pub mod client;
pub mod messages;
pub mod server;

use std::time::Duration;

use sage_common::{ErrorKind, SageConfig};
use sage_crypto::hpke::combine_secrets;
use sage_crypto::schedule::{transcript_hash, ScheduleError};
use sage_crypto::{HpkeError, HpkeSecrets, KeyError, ManagerError, SessionConfig, SessionId};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::did::ResolveError;
use crate::message::{ValidationError, ValidatorConfig};
use crate::transport::TransportError;

pub use client::Client;
pub use messages::HandshakeMessage;
pub use server::Server;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("identity resolution failed: {0}")]
    Identity(#[from] ResolveError),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] HpkeError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("header rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("context id already used: {0}")]
    ContextReused(String),

    #[error("peer aborted ({kind}): {reason}")]
    PeerAborted { kind: ErrorKind, reason: String },

    #[error("session error: {0}")]
    Session(#[from] ManagerError),
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::Identity(e) => e.kind(),
            HandshakeError::Authentication(_) => ErrorKind::Authentication,
            HandshakeError::Schedule(e) => e.kind(),
            HandshakeError::KeyExchange(e) => e.kind(),
            HandshakeError::Key(e) => e.kind(),
            HandshakeError::Protocol(_) | HandshakeError::ContextReused(_) => ErrorKind::Protocol,
            HandshakeError::Transport(e) => e.kind(),
            HandshakeError::Timeout(_) => ErrorKind::Timeout,
            HandshakeError::Validation(e) => e.kind(),
            HandshakeError::PeerAborted { kind, .. } => *kind,
            HandshakeError::Session(e) => e.kind(),
        }
    }

    /// Build the abort message a peer should receive for this failure.
    pub fn to_abort(&self, context_id: &str) -> HandshakeMessage {
        HandshakeMessage::Abort {
            context_id: context_id.to_string(),
            kind: self.kind(),
            reason: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    InvitationSent,
    ResponseReceived,
    CompleteSent,
    Established,
    Aborted,
}

impl ClientState {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Established | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    InvitationReceived,
    RequestProcessed,
    ResponseSent,
    Established,
    Aborted,
}

/// Issues the opaque key id a server binds to each new session.
pub trait KeyIdBinder: Send + Sync {
    fn issue(&self, session_id: &SessionId) -> String;
}

/// `kid-<uuid v4>`
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidKeyIdBinder;

impl KeyIdBinder for UuidKeyIdBinder {
    fn issue(&self, _session_id: &SessionId) -> String {
        format!("kid-{}", uuid::Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientOptions {
    /// Deadline used by [`Client::initiate`].
    pub timeout: Duration,
    /// How long a finished context id stays reserved.
    pub context_ttl: Duration,
    pub cleanup_interval: Duration,
    pub replay: ValidatorConfig,
    /// Overrides the session manager's default config.
    pub session: Option<SessionConfig>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&SageConfig::default())
    }
}

impl From<&SageConfig> for ClientOptions {
    fn from(config: &SageConfig) -> Self {
        Self {
            timeout: config.handshake.timeout(),
            context_ttl: config.handshake.pending_ttl(),
            cleanup_interval: config.handshake.cleanup_interval(),
            replay: ValidatorConfig::from(&config.replay),
            session: Some(SessionConfig::from(&config.session)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerOptions {
    /// How long a half-finished handshake is kept.
    pub pending_ttl: Duration,
    pub cleanup_interval: Duration,
    pub replay: ValidatorConfig,
    pub session: Option<SessionConfig>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&SageConfig::default())
    }
}

impl From<&SageConfig> for ServerOptions {
    fn from(config: &SageConfig) -> Self {
        Self {
            pending_ttl: config.handshake.pending_ttl(),
            cleanup_interval: config.handshake.cleanup_interval(),
            replay: ValidatorConfig::from(&config.replay),
            session: Some(SessionConfig::from(&config.session)),
        }
    }
}

/// Everything both sides hash into the transcript, in order.
pub(crate) struct Transcript<'a> {
    pub info: &'a str,
    pub export_context: &'a str,
    pub client_ephemeral: &'a [u8],
    pub server_ephemeral: &'a [u8],
    pub static_kem: bool,
    pub client_did: &'a str,
    pub server_did: &'a str,
    pub context_id: &'a str,
}

impl Transcript<'_> {
    pub fn hash(&self) -> [u8; 32] {
        transcript_hash(&[
            self.info.as_bytes(),
            self.export_context.as_bytes(),
            self.client_ephemeral,
            self.server_ephemeral,
            &[u8::from(self.static_kem)],
            self.client_did.as_bytes(),
            self.server_did.as_bytes(),
            self.context_id.as_bytes(),
        ])
    }
}

/// Both KEM legs folded into one shared secret and one exporter secret.
pub(crate) struct CombinedSecrets {
    pub shared: Zeroizing<[u8; 32]>,
    pub exporter: Zeroizing<[u8; 32]>,
}

/// Static leg first (when present), then the ephemeral leg.
pub(crate) fn combine_legs(
    static_leg: Option<&HpkeSecrets>,
    ephemeral_leg: &HpkeSecrets,
    export_context: &str,
) -> Result<CombinedSecrets, HpkeError> {
    let legs: Vec<&HpkeSecrets> = static_leg.into_iter().chain([ephemeral_leg]).collect();
    let shared: Vec<&[u8; 32]> = legs.iter().map(|l| l.shared_secret()).collect();
    let exporter: Vec<&[u8; 32]> = legs.iter().map(|l| l.exporter_secret()).collect();

    Ok(CombinedSecrets {
        shared: combine_secrets(&shared, export_context.as_bytes())?,
        exporter: combine_secrets(&exporter, export_context.as_bytes())?,
    })
}

pub(crate) fn parse_ephemeral(value: &str) -> Result<[u8; 32], HandshakeError> {
    let bytes = messages::decode_b64(value, "ephemeral_public")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| {
            HandshakeError::Protocol(format!("ephemeral key must be 32 bytes, got {}", b.len()))
        })
}

pub(crate) fn parse_ack_tag(value: &str) -> Result<Vec<u8>, HandshakeError> {
    let tag = messages::decode_b64(value, "ack_tag")?;
    if tag.len() != 32 {
        return Err(ScheduleError::AckTagMismatch.into());
    }
    Ok(tag)
}
