//! Session routing.
//!
//! Maps caller-assigned session ids to isolated sessions. Each session sits
//! behind its own mutex, so requests on the same id are serialized while
//! requests on different ids run fully in parallel.
//!
//! A session with an open stream is claimed by that stream: its mutex is held
//! on the stream's worker thread, so other requests on the id are refused with
//! [`EngineError::SessionBusy`] instead of waiting on a consumer that may be
//! the caller itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::engine::CacheEngine;
use crate::error::{EngineError, Result};
use crate::session::Session;

pub type SessionHandle = Arc<Mutex<Session>>;

pub struct SessionRouter {
    engine: Arc<dyn CacheEngine>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    streaming: Mutex<HashSet<String>>,
}

/// Marks a session as owned by an open stream until dropped.
pub(crate) struct StreamClaim {
    router: Arc<SessionRouter>,
    session_id: String,
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        self.router.streaming.lock().remove(&self.session_id);
    }
}

impl SessionRouter {
    pub fn new(engine: Arc<dyn CacheEngine>) -> Self {
        Self {
            engine,
            sessions: RwLock::new(HashMap::new()),
            streaming: Mutex::new(HashSet::new()),
        }
    }

    /// Look up a session, creating it with an empty cache on first use.
    pub fn get_or_create(&self, session_id: &str) -> SessionHandle {
        if let Some(session) = self.sessions.read().get(session_id) {
            return session.clone();
        }

        let mut sessions = self.sessions.write();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(session_id, mode = %self.engine.cache_mode(), "session created");
                Arc::new(Mutex::new(Session::new(session_id, self.engine.allocate())))
            })
            .clone()
    }

    /// Look up an existing session.
    pub fn get(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Whether an open stream currently owns the session.
    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.streaming.lock().contains(session_id)
    }

    /// Fail with `SessionBusy` if an open stream owns the session.
    pub fn ensure_idle(&self, session_id: &str) -> Result<()> {
        if self.is_streaming(session_id) {
            return Err(EngineError::SessionBusy(session_id.to_string()));
        }
        Ok(())
    }

    /// Reserve a session for a stream.
    pub(crate) fn claim_stream(self: &Arc<Self>, session_id: &str) -> Result<StreamClaim> {
        if !self.streaming.lock().insert(session_id.to_string()) {
            return Err(EngineError::SessionBusy(session_id.to_string()));
        }
        Ok(StreamClaim {
            router: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    /// A session that is never registered; the caller releases it.
    pub fn ephemeral(&self) -> Session {
        Session::new(format!("ephemeral-{}", Uuid::new_v4()), self.engine.allocate())
    }

    /// Free an unregistered session's cache.
    pub fn release(&self, session: &Session) {
        self.engine.release(session.cache());
    }

    /// Drop a session and free its cache.
    pub fn remove(&self, session_id: &str) -> Result<()> {
        self.ensure_idle(session_id)?;
        let session = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        self.engine.release(session.lock().cache());
        tracing::debug!(session_id, "session removed");
        Ok(())
    }

    /// Clear a session's cache and counters, keeping its id registered.
    pub fn reset(&self, session_id: &str) -> Result<()> {
        self.ensure_idle(session_id)?;
        let handle = self.get(session_id)?;
        let mut session = handle.lock();
        self.engine.release(session.cache());
        session.reset(self.engine.allocate());
        tracing::debug!(session_id, "session reset");
        Ok(())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
