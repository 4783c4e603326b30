//! Initiator side of the handshake.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use sage_common::sweep::{spawn_sweeper, SweeperHandle};
use sage_crypto::hpke::{self, build_export_context, build_info, SUITE};
use sage_crypto::schedule::{ack_key, compute_session_id, make_ack_tag, verify_ack_tag, Role};
use sage_crypto::{KeyAlgorithm, KeyError, KeyPair, SessionId, SessionManager};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::messages::{
    decode_b64, encode_b64, response_signing_payload, CompleteBody, InvitationBody, RequestBody,
    Signed,
};
use super::{
    combine_legs, parse_ack_tag, parse_ephemeral, ClientOptions, ClientState, HandshakeError,
    HandshakeMessage, Transcript,
};
use crate::did::DidResolver;
use crate::message::{ControlHeader, MessageValidator};
use crate::transport::Transport;

/// A context id this client has used, and how far its attempt got.
struct ContextRecord {
    state: ClientState,
    started_at: Instant,
}

pub struct Client {
    signing_key: KeyPair,
    resolver: Arc<dyn DidResolver>,
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionManager>,
    validator: Arc<MessageValidator>,
    options: ClientOptions,
    contexts: Mutex<HashMap<String, ContextRecord>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("algorithm", &self.signing_key.algorithm())
            .field("contexts", &self.contexts.lock().len())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(
        signing_key: KeyPair,
        resolver: Arc<dyn DidResolver>,
        transport: Arc<dyn Transport>,
        sessions: Arc<SessionManager>,
        options: ClientOptions,
    ) -> Result<Self, HandshakeError> {
        if !signing_key.algorithm().can_sign() {
            return Err(KeyError::UnsupportedOperation {
                op: "sign",
                algorithm: signing_key.algorithm(),
            }
            .into());
        }
        Ok(Self {
            signing_key,
            resolver,
            transport,
            sessions,
            validator: Arc::new(MessageValidator::new(options.replay)),
            options,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn validator(&self) -> &MessageValidator {
        &self.validator
    }

    pub fn state_of(&self, context_id: &str) -> ClientState {
        self.contexts
            .lock()
            .get(context_id)
            .map_or(ClientState::Idle, |record| record.state)
    }

    /// Context ids still reserved, finished or not.
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Run the handshake with the configured deadline.
    pub async fn initiate(
        &self,
        context_id: &str,
        client_did: &str,
        server_did: &str,
    ) -> Result<SessionId, HandshakeError> {
        self.initiate_with_timeout(context_id, client_did, server_did, self.options.timeout)
            .await
    }

    /// Run the handshake, giving up after `deadline`.
    ///
    /// A context id is good for one attempt; retry with a fresh one.
    pub async fn initiate_with_timeout(
        &self,
        context_id: &str,
        client_did: &str,
        server_did: &str,
        deadline: Duration,
    ) -> Result<SessionId, HandshakeError> {
        {
            let mut contexts = self.contexts.lock();
            if contexts.contains_key(context_id) {
                return Err(HandshakeError::ContextReused(context_id.to_string()));
            }
            contexts.insert(
                context_id.to_string(),
                ContextRecord {
                    state: ClientState::Idle,
                    started_at: Instant::now(),
                },
            );
        }

        let attempt = self.run(context_id, client_did, server_did);
        let outcome = match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Timeout(deadline)),
        };

        if let Err(err) = &outcome {
            self.set_state(context_id, ClientState::Aborted);
            warn!(context_id, kind = %err.kind(), error = %err, "handshake failed");
            if notifies_peer(err) {
                if let Ok(abort) = err.to_abort(context_id).to_bytes() {
                    if let Err(send_err) = self.transport.send(context_id, abort).await {
                        debug!(context_id, error = %send_err, "abort not delivered");
                    }
                }
            }
        }

        // no more headers arrive for this context
        self.validator.forget_session(context_id);
        self.transport.release(context_id);
        outcome
    }

    async fn run(
        &self,
        context_id: &str,
        client_did: &str,
        server_did: &str,
    ) -> Result<SessionId, HandshakeError> {
        // zeroized when this attempt ends, however it ends
        let ephemeral = KeyPair::generate(KeyAlgorithm::X25519)?;
        let ephemeral_public = ephemeral.public_key_bytes()?;

        // Invitation
        let invitation = InvitationBody {
            context_id: context_id.to_string(),
            client_did: client_did.to_string(),
            server_did: server_did.to_string(),
            suites: vec![SUITE.to_string()],
            header: ControlHeader::new(1),
        };
        let invitation = Signed::sign("invitation", invitation, &self.signing_key)?;
        self.set_state(context_id, ClientState::InvitationSent);
        let reply = self
            .exchange(context_id, HandshakeMessage::Invitation(invitation))
            .await?;
        let (suite, header) = match reply {
            HandshakeMessage::InvitationAck { suite, header, .. } => (suite, header),
            other => return Err(unexpected(&other)),
        };
        self.check_header(&header, context_id)?;
        if suite != SUITE {
            return Err(HandshakeError::Protocol(format!("server chose unknown suite {suite}")));
        }

        // Request
        let server = self.resolver.resolve_active(server_did).await?;
        let info = build_info(context_id, client_did, server_did);
        let export_context = build_export_context(context_id);
        let static_leg = match &server.kem_key {
            Some(kem_key) => Some(hpke::derive(&ephemeral, kem_key, info.as_bytes())?),
            None => None,
        };

        let request = RequestBody {
            context_id: context_id.to_string(),
            ephemeral_public: encode_b64(&ephemeral_public),
            static_kem: static_leg.is_some(),
            header: ControlHeader::new(2),
        };
        let request = Signed::sign("request", request, &self.signing_key)?;
        let reply = self
            .exchange(context_id, HandshakeMessage::Request(request))
            .await?;
        let (server_ephemeral, ack_tag, signature, header) = match reply {
            HandshakeMessage::Response {
                ephemeral_public,
                ack_tag,
                signature,
                header,
                ..
            } => (ephemeral_public, ack_tag, signature, header),
            other => return Err(unexpected(&other)),
        };
        self.check_header(&header, context_id)?;
        self.set_state(context_id, ClientState::ResponseReceived);

        // Key confirmation
        let server_ephemeral = parse_ephemeral(&server_ephemeral)?;
        let ephemeral_leg = hpke::open(&ephemeral, &server_ephemeral, info.as_bytes())?;
        let secrets = combine_legs(
            static_leg.as_ref().map(|leg| &leg.secrets),
            &ephemeral_leg,
            &export_context,
        )?;
        let transcript = Transcript {
            info: &info,
            export_context: &export_context,
            client_ephemeral: &ephemeral_public,
            server_ephemeral: &server_ephemeral,
            static_kem: static_leg.is_some(),
            client_did,
            server_did,
            context_id,
        }
        .hash();

        let ack = ack_key(&secrets.shared)?;
        let server_tag = parse_ack_tag(&ack_tag)?;
        verify_ack_tag(&ack, Role::Responder, &transcript, &server_tag)?;
        let signature = decode_b64(&signature, "signature")?;
        server
            .signing_key
            .verify(&response_signing_payload(&transcript, &server_tag), &signature)
            .map_err(|_| HandshakeError::Authentication("invalid response signature".into()))?;

        let session_id =
            compute_session_id(&secrets.exporter[..], context_id, client_did, server_did);

        // Complete
        let complete = CompleteBody {
            context_id: context_id.to_string(),
            ack_tag: encode_b64(&make_ack_tag(&ack, Role::Initiator, &transcript)?),
            header: ControlHeader::new(3),
        };
        let complete = Signed::sign("complete", complete, &self.signing_key)?;
        self.set_state(context_id, ClientState::CompleteSent);
        let reply = self
            .exchange(context_id, HandshakeMessage::Complete(complete))
            .await?;
        let (echoed, key_id, header) = match reply {
            HandshakeMessage::CompleteAck {
                session_id,
                key_id,
                header,
                ..
            } => (session_id, key_id, header),
            other => return Err(unexpected(&other)),
        };
        self.check_header(&header, context_id)?;
        if echoed != session_id {
            return Err(HandshakeError::Authentication(format!(
                "server reported session {echoed}, derived {session_id}"
            )));
        }

        self.sessions.create_session(
            session_id.clone(),
            &secrets.exporter[..],
            Role::Initiator,
            self.options.session,
        )?;
        if let Some(key_id) = key_id {
            if let Err(err) = self.sessions.bind_key_id(key_id, &session_id) {
                self.sessions.remove_session(&session_id);
                return Err(err.into());
            }
        }

        self.set_state(context_id, ClientState::Established);
        info!(context_id, session_id = %session_id, server_did, "handshake established");
        Ok(session_id)
    }

    /// Send one message and decode the reply. A peer `Abort` becomes an error.
    async fn exchange(
        &self,
        context_id: &str,
        message: HandshakeMessage,
    ) -> Result<HandshakeMessage, HandshakeError> {
        debug!(context_id, phase = message.phase(), "sending handshake message");
        self.transport.send(context_id, message.to_bytes()?).await?;
        let raw = self.transport.receive(context_id).await?;

        let reply = HandshakeMessage::from_bytes(&raw)?;
        if reply.context_id() != context_id {
            return Err(HandshakeError::Protocol(format!(
                "reply for context {} while waiting on {context_id}",
                reply.context_id()
            )));
        }
        if let HandshakeMessage::Abort { kind, reason, .. } = reply {
            return Err(HandshakeError::PeerAborted { kind, reason });
        }
        Ok(reply)
    }

    fn check_header(&self, header: &ControlHeader, context_id: &str) -> Result<(), HandshakeError> {
        self.validator
            .validate_message(header, context_id)
            .into_result()?;
        Ok(())
    }

    fn set_state(&self, context_id: &str, state: ClientState) {
        if let Some(record) = self.contexts.lock().get_mut(context_id) {
            record.state = state;
        }
    }

    /// Drop finished contexts older than `context_ttl`. Their ids can be
    /// used again afterwards.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.options.context_ttl;
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|_, record| {
            !(record.state.is_settled() && record.started_at.elapsed() > ttl)
        });
        before - contexts.len()
    }

    /// Sweep finished contexts and replay state every `cleanup_interval`.
    pub fn spawn_cleanup(self: &Arc<Self>) -> SweeperHandle {
        let client: Weak<Self> = Arc::downgrade(self);
        spawn_sweeper("client-handshake", self.options.cleanup_interval, move || {
            client
                .upgrade()
                .map_or(0, |c| c.purge_expired() + c.validator.purge_expired())
        })
    }
}

fn unexpected(message: &HandshakeMessage) -> HandshakeError {
    HandshakeError::Protocol(format!("unexpected {} message", message.phase()))
}

/// The server already knows about (or cannot hear) these failures.
fn notifies_peer(err: &HandshakeError) -> bool {
    !matches!(
        err,
        HandshakeError::Transport(_)
            | HandshakeError::PeerAborted { .. }
            | HandshakeError::Timeout(_)
    )
}
