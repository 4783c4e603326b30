//! Handshake wire envelope.
//!
//! Messages are JSON, tagged by `phase`. Client-originated bodies are signed
//! with the client's DID signing key; the signature covers
//! `"sage/handshake-msg v1|<phase>|<canonical body json>"` and travels
//! base64url-encoded next to the body.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sage_common::ErrorKind;
use sage_crypto::{KeyPair, PublicKey, SessionId};
use serde::{Deserialize, Serialize};

use super::HandshakeError;
use crate::message::ControlHeader;

const MESSAGE_SIG_LABEL: &str = "sage/handshake-msg v1";

/// Label prefixed to the server's signature over `transcript ‖ ack_tag`.
pub const RESPONSE_SIG_LABEL: &[u8] = b"sage/handshake-sig v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Invitation(Signed<InvitationBody>),
    InvitationAck {
        context_id: String,
        suite: String,
        header: ControlHeader,
    },
    Request(Signed<RequestBody>),
    Response {
        context_id: String,
        /// Server ephemeral X25519 key, base64url.
        ephemeral_public: String,
        ack_tag: String,
        signature: String,
        header: ControlHeader,
    },
    Complete(Signed<CompleteBody>),
    CompleteAck {
        context_id: String,
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_id: Option<String>,
        header: ControlHeader,
    },
    Abort {
        context_id: String,
        kind: ErrorKind,
        reason: String,
    },
}

impl HandshakeMessage {
    pub fn phase(&self) -> &'static str {
        match self {
            HandshakeMessage::Invitation(_) => "invitation",
            HandshakeMessage::InvitationAck { .. } => "invitation_ack",
            HandshakeMessage::Request(_) => "request",
            HandshakeMessage::Response { .. } => "response",
            HandshakeMessage::Complete(_) => "complete",
            HandshakeMessage::CompleteAck { .. } => "complete_ack",
            HandshakeMessage::Abort { .. } => "abort",
        }
    }

    pub fn context_id(&self) -> &str {
        match self {
            HandshakeMessage::Invitation(m) => &m.body.context_id,
            HandshakeMessage::Request(m) => &m.body.context_id,
            HandshakeMessage::Complete(m) => &m.body.context_id,
            HandshakeMessage::InvitationAck { context_id, .. }
            | HandshakeMessage::Response { context_id, .. }
            | HandshakeMessage::CompleteAck { context_id, .. }
            | HandshakeMessage::Abort { context_id, .. } => context_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, HandshakeError> {
        serde_json::to_vec(self).map_err(|e| HandshakeError::Protocol(format!("encode: {e}")))
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, HandshakeError> {
        serde_json::from_slice(raw).map_err(|e| HandshakeError::Protocol(format!("decode: {e}")))
    }
}

/// A body plus the sender's detached signature over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signed<T> {
    pub body: T,
    pub signature: String,
}

impl<T: Serialize> Signed<T> {
    pub fn sign(phase: &str, body: T, key: &KeyPair) -> Result<Self, HandshakeError> {
        let payload = signing_payload(phase, &body)?;
        let signature = key.sign(&payload)?;
        Ok(Self {
            body,
            signature: encode_b64(&signature),
        })
    }

    pub fn verify(&self, phase: &str, key: &PublicKey) -> Result<(), HandshakeError> {
        let payload = signing_payload(phase, &self.body)?;
        let signature = decode_b64(&self.signature, "signature")?;
        key.verify(&payload, &signature)
            .map_err(|_| HandshakeError::Authentication(format!("invalid {phase} signature")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationBody {
    pub context_id: String,
    pub client_did: String,
    pub server_did: String,
    pub suites: Vec<String>,
    pub header: ControlHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub context_id: String,
    /// Client ephemeral X25519 key, base64url.
    pub ephemeral_public: String,
    /// Whether the client also encapsulated to the server's published KEM key.
    pub static_kem: bool,
    pub header: ControlHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteBody {
    pub context_id: String,
    pub ack_tag: String,
    pub header: ControlHeader,
}

fn signing_payload<T: Serialize>(phase: &str, body: &T) -> Result<Vec<u8>, HandshakeError> {
    let json =
        serde_json::to_vec(body).map_err(|e| HandshakeError::Protocol(format!("encode: {e}")))?;
    let mut payload = Vec::with_capacity(MESSAGE_SIG_LABEL.len() + phase.len() + json.len() + 2);
    payload.extend_from_slice(MESSAGE_SIG_LABEL.as_bytes());
    payload.push(b'|');
    payload.extend_from_slice(phase.as_bytes());
    payload.push(b'|');
    payload.extend_from_slice(&json);
    Ok(payload)
}

/// `RESPONSE_SIG_LABEL ‖ transcript ‖ ack_tag`
pub fn response_signing_payload(transcript: &[u8; 32], ack_tag: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(RESPONSE_SIG_LABEL.len() + 32 + ack_tag.len());
    payload.extend_from_slice(RESPONSE_SIG_LABEL);
    payload.extend_from_slice(transcript);
    payload.extend_from_slice(ack_tag);
    payload
}

pub fn encode_b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>, HandshakeError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| HandshakeError::Protocol(format!("{field} is not valid base64url")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_crypto::KeyAlgorithm;

    fn invitation_body() -> InvitationBody {
        InvitationBody {
            context_id: "ctx-1".into(),
            client_did: "did:sage:ethereum:0xclient".into(),
            server_did: "did:sage:ethereum:0xserver".into(),
            suites: vec![sage_crypto::hpke::SUITE.to_string()],
            header: ControlHeader::new(1),
        }
    }

    #[test]
    fn test_phase_tag_on_the_wire() {
        let key = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        let signed = Signed::sign("invitation", invitation_body(), &key).unwrap();
        let msg = HandshakeMessage::Invitation(signed);
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(json["phase"], "invitation");
        assert_eq!(json["body"]["context_id"], "ctx-1");

        let abort = HandshakeMessage::Abort {
            context_id: "ctx-1".into(),
            kind: ErrorKind::IdentityResolution,
            reason: "inactive".into(),
        };
        let json: serde_json::Value = serde_json::from_slice(&abort.to_bytes().unwrap()).unwrap();
        assert_eq!(json["phase"], "abort");
        assert_eq!(json["kind"], "identity_resolution");
    }

    #[test]
    fn test_decode_preserves_message() {
        let key = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        let signed = Signed::sign("invitation", invitation_body(), &key).unwrap();
        let msg = HandshakeMessage::Invitation(signed);
        let decoded = HandshakeMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.context_id(), "ctx-1");
        assert_eq!(decoded.phase(), "invitation");
    }

    #[test]
    fn test_signature_binds_body_and_phase() {
        let key = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        let signed = Signed::sign("invitation", invitation_body(), &key).unwrap();
        signed.verify("invitation", &key.public_key()).unwrap();

        // same body under another phase label
        assert!(signed.verify("request", &key.public_key()).is_err());

        let mut tampered = signed.clone();
        tampered.body.server_did.push('x');
        let err = tampered.verify("invitation", &key.public_key()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let other = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        assert!(signed.verify("invitation", &other.public_key()).is_err());
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let err = HandshakeMessage::from_bytes(b"{\"phase\":\"teleport\"}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(decode_b64("not base64!", "ack_tag").is_err());
    }
}
