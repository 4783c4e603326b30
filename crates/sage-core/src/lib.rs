//! SAGE handshake protocol and message-level defenses.
//!
//! This crate provides:
//! - The four-message client/server handshake that ends in a shared
//!   [`SecureSession`](sage_crypto::SecureSession)
//! - Anti-replay checks (nonce TTL, duplicate detection, sequence and
//!   timestamp ordering)
//! - The async seams the handshake depends on: DID resolution and transport
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(client: sage_core::Client) -> Result<(), Box<dyn std::error::Error>> {
//! let session_id = client
//!     .initiate("ctx-1", "did:sage:ethereum:0xclient", "did:sage:ethereum:0xserver")
//!     .await?;
//! let session = client.sessions().get_session(&session_id).expect("just created");
//! let ciphertext = session.encrypt(b"hello, secure world")?;
//! # let _ = ciphertext;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod did;
pub mod handshake;
pub mod message;
pub mod transport;

pub use did::{DidResolver, InMemoryResolver, ResolveError, ResolvedIdentity};
pub use handshake::{
    Client, ClientOptions, ClientState, HandshakeError, HandshakeMessage, KeyIdBinder, Server,
    ServerOptions, ServerState,
};
pub use message::{ControlHeader, MessageValidator, ValidationError, ValidatorConfig};
pub use transport::{LoopbackTransport, Transport, TransportError};
