//! Session store.
//!
//! Sessions live behind `Arc` in a `RwLock<HashMap>`. The map lock is only
//! held to insert, look up or remove; all crypto happens on the session's
//! own mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use sage_common::sweep::{spawn_sweeper, SweeperHandle};
use sage_common::ErrorKind;
use thiserror::Error;
use tracing::{debug, info};

use crate::schedule::{Role, SessionId};
use crate::session::{SecureSession, SessionConfig, SessionError, SessionState};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session already exists: {0}")]
    Duplicate(SessionId),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session manager closed")]
    Closed,

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::Duplicate(_) | ManagerError::NotFound(_) => ErrorKind::Protocol,
            ManagerError::Closed => ErrorKind::SessionClosed,
            ManagerError::Session(e) => e.kind(),
        }
    }
}

/// Point-in-time counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<SecureSession>>>,
    key_ids: RwLock<HashMap<String, SessionId>>,
    default_config: SessionConfig,
    closed: AtomicBool,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionManager {
    pub fn new(default_config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            key_ids: RwLock::new(HashMap::new()),
            default_config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn default_config(&self) -> &SessionConfig {
        &self.default_config
    }

    /// Create a session; fails if the id is already present.
    pub fn create_session(
        &self,
        id: SessionId,
        exporter_secret: &[u8],
        role: Role,
        config: Option<SessionConfig>,
    ) -> Result<Arc<SecureSession>, ManagerError> {
        self.ensure_open()?;
        if self.sessions.read().contains_key(&id) {
            return Err(ManagerError::Duplicate(id));
        }

        let session = Arc::new(SecureSession::new(
            id.clone(),
            exporter_secret,
            role,
            config.unwrap_or(self.default_config),
        )?);

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(ManagerError::Duplicate(id));
        }
        sessions.insert(id.clone(), session.clone());
        drop(sessions);

        debug!(session_id = %id, ?role, "session created");
        Ok(session)
    }

    /// Return the live session for `id`, creating it if absent.
    ///
    /// An expired or closed session under the same id is replaced.
    pub fn ensure_session(
        &self,
        id: SessionId,
        exporter_secret: &[u8],
        role: Role,
        config: Option<SessionConfig>,
    ) -> Result<Arc<SecureSession>, ManagerError> {
        self.ensure_open()?;
        if let Some(existing) = self.live(&id) {
            return Ok(existing);
        }

        let fresh = Arc::new(SecureSession::new(
            id.clone(),
            exporter_secret,
            role,
            config.unwrap_or(self.default_config),
        )?);

        let mut sessions = self.sessions.write();
        // another caller may have won the race while we derived keys
        if let Some(existing) = sessions
            .get(&id)
            .filter(|s| s.state() == SessionState::Active)
            .cloned()
        {
            return Ok(existing);
        }
        if let Some(stale) = sessions.insert(id.clone(), fresh.clone()) {
            stale.close();
        }
        drop(sessions);

        debug!(session_id = %id, ?role, "session ensured");
        Ok(fresh)
    }

    /// Live session for `id`. Expired or closed sessions are evicted.
    pub fn get_session(&self, id: &SessionId) -> Option<Arc<SecureSession>> {
        let session = self.sessions.read().get(id).cloned()?;
        if session.state() == SessionState::Active {
            return Some(session);
        }
        self.evict(id);
        None
    }

    /// Remove and close a session. Returns whether it existed.
    pub fn remove_session(&self, id: &SessionId) -> bool {
        self.evict(id)
    }

    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Drop every session that is no longer active. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = Vec::new();
        self.sessions.write().retain(|id, session| {
            let keep = session.state() == SessionState::Active;
            if !keep {
                removed.push((id.clone(), session.clone()));
            }
            keep
        });

        if removed.is_empty() {
            return 0;
        }

        self.key_ids
            .write()
            .retain(|_, sid| !removed.iter().any(|(id, _)| id == sid));
        for (_, session) in &removed {
            session.close();
        }
        debug!(removed = removed.len(), "expired sessions cleaned up");
        removed.len()
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read();
        let mut stats = SessionStats {
            total: sessions.len(),
            ..SessionStats::default()
        };
        for session in sessions.values() {
            match session.state() {
                SessionState::Active => stats.active += 1,
                SessionState::Expired | SessionState::Closed => stats.expired += 1,
            }
        }
        stats
    }

    /// Associate an opaque key id with a live session.
    pub fn bind_key_id(
        &self,
        key_id: impl Into<String>,
        id: &SessionId,
    ) -> Result<(), ManagerError> {
        if self.live(id).is_none() {
            return Err(ManagerError::NotFound(id.clone()));
        }
        self.key_ids.write().insert(key_id.into(), id.clone());
        Ok(())
    }

    pub fn get_by_key_id(&self, key_id: &str) -> Option<Arc<SecureSession>> {
        let id = self.key_ids.read().get(key_id).cloned()?;
        let session = self.get_session(&id);
        if session.is_none() {
            self.key_ids.write().remove(key_id);
        }
        session
    }

    pub fn unbind_key_id(&self, key_id: &str) -> bool {
        self.key_ids.write().remove(key_id).is_some()
    }

    /// Close every session and refuse new ones.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        self.key_ids.write().clear();
        for session in &drained {
            session.close();
        }
        info!(closed = drained.len(), "session manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sweep expired sessions every `interval` until the handle is dropped.
    ///
    /// The task holds only a weak reference to the manager.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let manager: Weak<Self> = Arc::downgrade(self);
        spawn_sweeper("sessions", interval, move || {
            manager.upgrade().map_or(0, |m| m.cleanup_expired())
        })
    }

    fn ensure_open(&self) -> Result<(), ManagerError> {
        if self.is_closed() {
            Err(ManagerError::Closed)
        } else {
            Ok(())
        }
    }

    fn live(&self, id: &SessionId) -> Option<Arc<SecureSession>> {
        self.sessions
            .read()
            .get(id)
            .filter(|s| s.state() == SessionState::Active)
            .cloned()
    }

    fn evict(&self, id: &SessionId) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };
        self.key_ids.write().retain(|_, sid| sid != id);
        session.close();
        debug!(session_id = %id, "session removed");
        true
    }
}
