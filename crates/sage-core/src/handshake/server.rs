//! Responder side of the handshake.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sage_common::sweep::{spawn_sweeper, SweeperHandle};
use sage_common::ErrorKind;
use sage_crypto::hpke::{self, build_export_context, build_info, SUITE};
use sage_crypto::schedule::{ack_key, compute_session_id, make_ack_tag, verify_ack_tag, Role};
use sage_crypto::{KeyAlgorithm, KeyError, KeyPair, PublicKey, SessionId, SessionManager};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::messages::{
    encode_b64, response_signing_payload, CompleteBody, InvitationBody, RequestBody, Signed,
};
use super::{
    combine_legs, parse_ack_tag, parse_ephemeral, HandshakeError, HandshakeMessage, KeyIdBinder,
    ServerOptions, ServerState, Transcript, UuidKeyIdBinder,
};
use crate::did::DidResolver;
use crate::message::{ControlHeader, MessageValidator};

/// Key material held between Response and Complete. Wiped on drop.
struct NegotiatedKeys {
    shared_secret: Zeroizing<[u8; 32]>,
    exporter_secret: Zeroizing<[u8; 32]>,
    session_id: SessionId,
    transcript: [u8; 32],
}

struct PendingHandshake {
    state: ServerState,
    client_did: String,
    /// Resolved once at invitation time and reused for later phases.
    client_key: PublicKey,
    created_at: Instant,
    next_sequence: u64,
    keys: Option<NegotiatedKeys>,
}

impl PendingHandshake {
    fn ensure_state(&self, state: ServerState) -> Result<(), HandshakeError> {
        if self.state == state {
            Ok(())
        } else {
            Err(HandshakeError::Protocol(format!(
                "unexpected message in state {:?}",
                self.state
            )))
        }
    }

    fn header(&mut self) -> ControlHeader {
        self.next_sequence += 1;
        ControlHeader::new(self.next_sequence)
    }

    fn abort(&mut self) {
        self.state = ServerState::Aborted;
        self.keys = None;
    }

    fn is_settled(&self) -> bool {
        matches!(self.state, ServerState::Established | ServerState::Aborted)
    }
}

pub struct Server {
    did: String,
    signing_key: KeyPair,
    kem_key: KeyPair,
    resolver: Arc<dyn DidResolver>,
    sessions: Arc<SessionManager>,
    validator: MessageValidator,
    binder: Option<Arc<dyn KeyIdBinder>>,
    options: ServerOptions,
    /// One slot per context. A phase holds the slot's lock while it runs,
    /// so the context stays claimed in the map throughout.
    pending: Mutex<HashMap<String, Arc<Mutex<PendingHandshake>>>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("did", &self.did)
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// `signing_key` must be able to sign; `kem_key` must be X25519.
    pub fn new(
        did: impl Into<String>,
        signing_key: KeyPair,
        kem_key: KeyPair,
        resolver: Arc<dyn DidResolver>,
        sessions: Arc<SessionManager>,
        options: ServerOptions,
    ) -> Result<Self, HandshakeError> {
        if !signing_key.algorithm().can_sign() {
            return Err(KeyError::UnsupportedOperation {
                op: "sign",
                algorithm: signing_key.algorithm(),
            }
            .into());
        }
        if kem_key.algorithm() != KeyAlgorithm::X25519 {
            return Err(KeyError::UnsupportedOperation {
                op: "key agreement",
                algorithm: kem_key.algorithm(),
            }
            .into());
        }

        Ok(Self {
            did: did.into(),
            signing_key,
            kem_key,
            resolver,
            sessions,
            validator: MessageValidator::new(options.replay),
            binder: Some(Arc::new(UuidKeyIdBinder)),
            options,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_key_id_binder(mut self, binder: Arc<dyn KeyIdBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    /// Establish sessions without issuing key ids.
    pub fn without_key_ids(mut self) -> Self {
        self.binder = None;
        self
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn validator(&self) -> &MessageValidator {
        &self.validator
    }

    /// Public half of the KEM key, for publishing in the DID document.
    pub fn kem_public_key(&self) -> Result<[u8; 32], HandshakeError> {
        let bytes = self.kem_key.public_key_bytes()?;
        bytes.try_into().map_err(|b: Vec<u8>| {
            HandshakeError::Key(KeyError::InvalidLength {
                algorithm: KeyAlgorithm::X25519,
                expected: "32",
                actual: b.len(),
            })
        })
    }

    pub fn state_of(&self, context_id: &str) -> ServerState {
        match self.slot(context_id) {
            Some(slot) => slot.lock().state,
            None => ServerState::Idle,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Process one client message and return the encoded reply.
    ///
    /// An empty reply means there is nothing to send back (peer abort).
    /// Errors leave any in-flight context `Aborted`; the transport decides
    /// how to report them to the client.
    pub async fn handle_message(&self, raw: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let message = HandshakeMessage::from_bytes(raw)?;
        let context_id = message.context_id().to_string();
        debug!(context_id = %context_id, phase = message.phase(), "handshake message received");

        let reply = match message {
            HandshakeMessage::Invitation(invitation) => self.on_invitation(invitation).await?,
            HandshakeMessage::Request(request) => {
                self.advance(&context_id, |pending| self.on_request(pending, &request))?
            }
            HandshakeMessage::Complete(complete) => {
                self.advance(&context_id, |pending| self.on_complete(pending, &complete))?
            }
            HandshakeMessage::Abort { kind, reason, .. } => {
                self.on_abort(&context_id, kind, &reason);
                return Ok(Vec::new());
            }
            other => {
                return Err(HandshakeError::Protocol(format!(
                    "unexpected {} message from client",
                    other.phase()
                )))
            }
        };
        reply.to_bytes()
    }

    async fn on_invitation(
        &self,
        invitation: Signed<InvitationBody>,
    ) -> Result<HandshakeMessage, HandshakeError> {
        let body = &invitation.body;
        if body.server_did != self.did {
            return Err(HandshakeError::Protocol(format!(
                "invitation addressed to {}",
                body.server_did
            )));
        }

        let client = self.resolver.resolve_active(&body.client_did).await?;
        invitation.verify("invitation", &client.signing_key)?;
        self.check_header(&body.header, &body.context_id)?;

        if !body.suites.iter().any(|s| s == SUITE) {
            return Err(HandshakeError::Protocol(format!(
                "no supported suite in {:?}",
                body.suites
            )));
        }

        let mut pending = self.pending.lock();
        if pending.contains_key(&body.context_id) {
            return Err(HandshakeError::ContextReused(body.context_id.clone()));
        }
        let mut entry = PendingHandshake {
            state: ServerState::InvitationReceived,
            client_did: body.client_did.clone(),
            client_key: client.signing_key,
            created_at: Instant::now(),
            next_sequence: 0,
            keys: None,
        };
        let header = entry.header();
        pending.insert(body.context_id.clone(), Arc::new(Mutex::new(entry)));
        drop(pending);

        info!(
            context_id = %body.context_id,
            client_did = %body.client_did,
            "invitation accepted"
        );
        Ok(HandshakeMessage::InvitationAck {
            context_id: body.context_id.clone(),
            suite: SUITE.to_string(),
            header,
        })
    }

    fn on_request(
        &self,
        pending: &mut PendingHandshake,
        request: &Signed<RequestBody>,
    ) -> Result<HandshakeMessage, HandshakeError> {
        let body = &request.body;
        let context_id = body.context_id.as_str();
        request.verify("request", &pending.client_key)?;
        self.check_header(&body.header, context_id)?;
        pending.ensure_state(ServerState::InvitationReceived)?;

        let client_ephemeral = parse_ephemeral(&body.ephemeral_public)?;
        let info = build_info(context_id, &pending.client_did, &self.did);
        let export_context = build_export_context(context_id);

        let static_leg = if body.static_kem {
            Some(hpke::open(&self.kem_key, &client_ephemeral, info.as_bytes())?)
        } else {
            None
        };
        let server_ephemeral = KeyPair::generate(KeyAlgorithm::X25519)?;
        let ephemeral_leg = hpke::derive(&server_ephemeral, &client_ephemeral, info.as_bytes())?;
        let secrets = combine_legs(static_leg.as_ref(), &ephemeral_leg.secrets, &export_context)?;
        pending.state = ServerState::RequestProcessed;

        let session_id = compute_session_id(
            &secrets.exporter[..],
            context_id,
            &pending.client_did,
            &self.did,
        );
        let transcript = Transcript {
            info: &info,
            export_context: &export_context,
            client_ephemeral: &client_ephemeral,
            server_ephemeral: &ephemeral_leg.encapsulated_key,
            static_kem: body.static_kem,
            client_did: &pending.client_did,
            server_did: &self.did,
            context_id,
        }
        .hash();

        let ack_tag = make_ack_tag(&*ack_key(&secrets.shared)?, Role::Responder, &transcript)?;
        let signature = self
            .signing_key
            .sign(&response_signing_payload(&transcript, &ack_tag))?;

        pending.keys = Some(NegotiatedKeys {
            shared_secret: secrets.shared,
            exporter_secret: secrets.exporter,
            session_id,
            transcript,
        });
        pending.state = ServerState::ResponseSent;
        debug!(context_id, static_kem = body.static_kem, "response prepared");

        Ok(HandshakeMessage::Response {
            context_id: context_id.to_string(),
            ephemeral_public: encode_b64(&ephemeral_leg.encapsulated_key),
            ack_tag: encode_b64(&ack_tag),
            signature: encode_b64(&signature),
            header: pending.header(),
        })
    }

    fn on_complete(
        &self,
        pending: &mut PendingHandshake,
        complete: &Signed<CompleteBody>,
    ) -> Result<HandshakeMessage, HandshakeError> {
        let body = &complete.body;
        let context_id = body.context_id.as_str();
        complete.verify("complete", &pending.client_key)?;
        self.check_header(&body.header, context_id)?;
        pending.ensure_state(ServerState::ResponseSent)?;

        let keys = pending
            .keys
            .take()
            .ok_or_else(|| HandshakeError::Protocol("no negotiated keys".into()))?;
        let client_tag = parse_ack_tag(&body.ack_tag)?;
        verify_ack_tag(
            &*ack_key(&keys.shared_secret)?,
            Role::Initiator,
            &keys.transcript,
            &client_tag,
        )?;

        let session = self.sessions.create_session(
            keys.session_id.clone(),
            &keys.exporter_secret[..],
            Role::Responder,
            self.options.session,
        )?;
        let key_id = match &self.binder {
            Some(binder) => {
                let key_id = binder.issue(session.id());
                if let Err(err) = self.sessions.bind_key_id(key_id.clone(), session.id()) {
                    self.sessions.remove_session(session.id());
                    return Err(err.into());
                }
                Some(key_id)
            }
            None => None,
        };

        pending.state = ServerState::Established;
        info!(
            context_id,
            session_id = %keys.session_id,
            client_did = %pending.client_did,
            "handshake established"
        );
        Ok(HandshakeMessage::CompleteAck {
            context_id: context_id.to_string(),
            session_id: keys.session_id.clone(),
            key_id,
            header: pending.header(),
        })
    }

    fn on_abort(&self, context_id: &str, kind: ErrorKind, reason: &str) {
        if let Some(slot) = self.slot(context_id) {
            let mut pending = slot.lock();
            if !pending.is_settled() {
                pending.abort();
            }
        }
        warn!(context_id, %kind, reason, "client aborted handshake");
    }

    fn slot(&self, context_id: &str) -> Option<Arc<Mutex<PendingHandshake>>> {
        self.pending.lock().get(context_id).cloned()
    }

    /// Run one phase against the context's pending entry.
    ///
    /// The entry stays in the map, locked, while the phase runs. A second
    /// message for the same context arriving meanwhile is rejected without
    /// touching it, and a new invitation still sees the context as taken.
    fn advance<F>(&self, context_id: &str, phase: F) -> Result<HandshakeMessage, HandshakeError>
    where
        F: FnOnce(&mut PendingHandshake) -> Result<HandshakeMessage, HandshakeError>,
    {
        let slot = self
            .slot(context_id)
            .ok_or_else(|| HandshakeError::Protocol(format!("unknown context {context_id}")))?;
        let Some(mut entry) = slot.try_lock() else {
            return Err(HandshakeError::Protocol(format!("context {context_id} is busy")));
        };

        let result = phase(&mut *entry);
        if let Err(err) = &result {
            if !entry.is_settled() {
                warn!(context_id, error = %err, "handshake aborted");
                entry.abort();
            }
        }
        result
    }

    fn check_header(&self, header: &ControlHeader, context_id: &str) -> Result<(), HandshakeError> {
        self.validator
            .validate_message(header, context_id)
            .into_result()?;
        Ok(())
    }

    /// Drop handshakes older than the pending TTL, whatever their state.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.options.pending_ttl;
        let mut expired = Vec::new();
        self.pending.lock().retain(|context_id, slot| {
            // a phase in progress keeps its slot until the next sweep
            let keep = slot
                .try_lock()
                .map_or(true, |p| p.created_at.elapsed() <= ttl);
            if !keep {
                expired.push(context_id.clone());
            }
            keep
        });
        for context_id in &expired {
            self.validator.forget_session(context_id);
        }
        expired.len()
    }

    /// Sweep pending handshakes and replay state every `cleanup_interval`.
    pub fn spawn_cleanup(self: &Arc<Self>) -> SweeperHandle {
        let server: Weak<Self> = Arc::downgrade(self);
        spawn_sweeper("handshake", self.options.cleanup_interval, move || {
            server
                .upgrade()
                .map_or(0, |s| s.purge_expired() + s.validator.purge_expired())
        })
    }
}
