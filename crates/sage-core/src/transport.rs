//! Transport seam for handshake messages.
//!
//! The handshake only needs to push bytes for a context and pull the peer's
//! reply. Framing, HTTP/WebSocket/gRPC bindings and retries live behind
//! [`Transport`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sage_common::ErrorKind;
use thiserror::Error;
use tracing::{debug, warn};

use crate::handshake::{HandshakeMessage, Server};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("no reply queued for context {0}")]
    NoReply(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transport
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one handshake message for `context_id`.
    async fn send(&self, context_id: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Wait for the peer's next message for `context_id`.
    async fn receive(&self, context_id: &str) -> Result<Vec<u8>, TransportError>;

    /// The caller is done with `context_id`, whether it succeeded, failed or
    /// timed out. Anything still buffered for it can go.
    fn release(&self, _context_id: &str) {}
}

/// Drives a [`Server`] in-process.
///
/// Each `send` runs the server's `handle_message` immediately and queues the
/// reply for the matching `receive`. Server errors come back as `Abort`
/// messages, the same way a network adapter would report them.
pub struct LoopbackTransport {
    server: Arc<Server>,
    replies: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
}

impl LoopbackTransport {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            replies: Mutex::new(HashMap::new()),
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Replies waiting to be received across all contexts.
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, context_id: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let reply = match self.server.handle_message(&payload).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(context_id, error = %err, "server rejected handshake message");
                err.to_abort(context_id)
                    .to_bytes()
                    .map_err(|e| TransportError::Send(e.to_string()))?
            }
        };

        if reply.is_empty() {
            debug!(context_id, "no reply to queue");
            return Ok(());
        }
        self.replies
            .lock()
            .entry(context_id.to_string())
            .or_default()
            .push_back(reply);
        Ok(())
    }

    async fn receive(&self, context_id: &str) -> Result<Vec<u8>, TransportError> {
        let mut replies = self.replies.lock();
        let reply = replies
            .get_mut(context_id)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| TransportError::NoReply(context_id.to_string()))?;
        if replies.get(context_id).is_some_and(VecDeque::is_empty) {
            replies.remove(context_id);
        }
        Ok(reply)
    }

    fn release(&self, context_id: &str) {
        if let Some(stale) = self.replies.lock().remove(context_id) {
            debug!(context_id, dropped = stale.len(), "discarding unread replies");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did::InMemoryResolver;
    use crate::handshake::ServerOptions;
    use sage_crypto::{KeyAlgorithm, KeyPair, SessionManager};

    fn loopback() -> LoopbackTransport {
        let server = Server::new(
            "did:sage:ethereum:0xserver",
            KeyPair::generate(KeyAlgorithm::Ed25519).unwrap(),
            KeyPair::generate(KeyAlgorithm::X25519).unwrap(),
            Arc::new(InMemoryResolver::new()),
            Arc::new(SessionManager::default()),
            ServerOptions::default(),
        )
        .unwrap();
        LoopbackTransport::new(Arc::new(server))
    }

    #[tokio::test]
    async fn test_receive_without_reply() {
        let transport = loopback();
        let err = transport.receive("ctx-1").await.unwrap_err();
        assert!(matches!(err, TransportError::NoReply(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_server_error_becomes_abort() {
        let transport = loopback();
        transport.send("ctx-1", b"not json".to_vec()).await.unwrap();
        assert_eq!(transport.pending_replies(), 1);

        let raw = transport.receive("ctx-1").await.unwrap();
        match HandshakeMessage::from_bytes(&raw).unwrap() {
            HandshakeMessage::Abort { kind, .. } => assert_eq!(kind, ErrorKind::Protocol),
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(transport.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_release_drops_unread_replies() {
        let transport = loopback();
        transport.send("ctx-1", b"not json".to_vec()).await.unwrap();
        transport.send("ctx-2", b"not json".to_vec()).await.unwrap();
        assert_eq!(transport.pending_replies(), 2);

        // the receiver for ctx-1 gave up before reading its reply
        transport.release("ctx-1");
        assert_eq!(transport.pending_replies(), 1);
        assert!(matches!(
            transport.receive("ctx-1").await,
            Err(TransportError::NoReply(_))
        ));
        assert!(transport.receive("ctx-2").await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_produces_no_reply() {
        let transport = loopback();
        let abort = HandshakeMessage::Abort {
            context_id: "ctx-1".into(),
            kind: ErrorKind::Timeout,
            reason: "gave up".into(),
        };
        transport.send("ctx-1", abort.to_bytes().unwrap()).await.unwrap();
        assert_eq!(transport.pending_replies(), 0);
    }
}
