use std::collections::HashMap;

use periscope_protocol::SessionInfo;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("session limit of {0} reached")]
    Full(usize),
}

struct Entry {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// Live sessions by id. The lock is held only while the map is touched.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Entry>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Whether another session would fit right now.
    pub async fn has_capacity(&self) -> bool {
        self.sessions.lock().await.len() < self.max_sessions
    }

    /// Register a session. `cancel` is fired by [`terminate`](Self::terminate).
    pub async fn insert(
        &self,
        info: SessionInfo,
        cancel: CancellationToken,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full(self.max_sessions));
        }
        info!(session_id = %info.id, username = %info.username, "Session registered");
        sessions.insert(info.id, Entry { info, cancel });
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<SessionInfo, RegistryError> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .map(|e| e.info.clone())
            .ok_or(RegistryError::NotFound(id))
    }

    /// All sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        list.sort_by_key(|s| (s.created_at, s.id));
        list
    }

    pub async fn set_state(&self, id: Uuid, state: &str) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        entry.info.state = state.to_string();
        Ok(())
    }

    pub async fn remove(&self, id: Uuid) -> Result<SessionInfo, RegistryError> {
        let entry = self
            .sessions
            .lock()
            .await
            .remove(&id)
            .ok_or(RegistryError::NotFound(id))?;
        info!(session_id = %id, "Session unregistered");
        Ok(entry.info)
    }

    /// Ask a session to close. The session removes itself once teardown
    /// completes.
    pub async fn terminate(&self, id: Uuid) -> Result<(), RegistryError> {
        let cancel = self
            .sessions
            .lock()
            .await
            .get(&id)
            .map(|e| e.cancel.clone())
            .ok_or(RegistryError::NotFound(id))?;
        info!(session_id = %id, "Terminating session");
        cancel.cancel();
        Ok(())
    }

    /// Ask every session to close. Returns how many were signalled.
    pub async fn terminate_all(&self) -> usize {
        let tokens: Vec<CancellationToken> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|e| e.cancel.clone())
            .collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }
}
