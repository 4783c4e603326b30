//! DID resolution seam.
//!
//! The handshake only needs three facts about a peer: its signing key, its
//! optional KEM key, and whether the identity is still active. Where those
//! come from (a chain registry, a cache, a fixture) is the resolver's business.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sage_common::ErrorKind;
use sage_crypto::PublicKey;
use thiserror::Error;

/// What a resolver knows about one DID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub did: String,
    pub signing_key: PublicKey,
    /// X25519 key for the static KEM leg, if the agent published one.
    pub kem_key: Option<[u8; 32]>,
    pub active: bool,
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("DID not found: {0}")]
    NotFound(String),

    #[error("DID is inactive: {0}")]
    Inactive(String),

    #[error("resolver backend error: {0}")]
    Backend(String),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::IdentityResolution
    }
}

#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<ResolvedIdentity, ResolveError>;

    /// Resolve and reject deactivated identities.
    async fn resolve_active(&self, did: &str) -> Result<ResolvedIdentity, ResolveError> {
        let identity = self.resolve(did).await?;
        if !identity.active {
            return Err(ResolveError::Inactive(did.to_string()));
        }
        Ok(identity)
    }
}

/// Resolver backed by a map. Used by tests and the demo agent.
#[derive(Debug, Default)]
pub struct InMemoryResolver {
    identities: RwLock<HashMap<String, ResolvedIdentity>>,
}

impl InMemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an active identity.
    pub fn register(
        &self,
        did: impl Into<String>,
        signing_key: PublicKey,
        kem_key: Option<[u8; 32]>,
    ) {
        let did = did.into();
        self.identities.write().insert(
            did.clone(),
            ResolvedIdentity {
                did,
                signing_key,
                kem_key,
                active: true,
            },
        );
    }

    /// Returns false if the DID was never registered.
    pub fn deactivate(&self, did: &str) -> bool {
        match self.identities.write().get_mut(did) {
            Some(identity) => {
                identity.active = false;
                true
            }
            None => false,
        }
    }

    pub fn set_kem_key(&self, did: &str, kem_key: Option<[u8; 32]>) -> bool {
        match self.identities.write().get_mut(did) {
            Some(identity) => {
                identity.kem_key = kem_key;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.identities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.read().is_empty()
    }
}

#[async_trait]
impl DidResolver for InMemoryResolver {
    async fn resolve(&self, did: &str) -> Result<ResolvedIdentity, ResolveError> {
        self.identities
            .read()
            .get(did)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(did.to_string()))
    }
}
