//! Session store.
//!
//! Sessions are cached in memory keyed by `sessionId`; the canonical record is a
//! JSON file under a per-project directory (`<root>/<projectKey>/sessions/<id>.json`).
//! Exclusivity is a per-session `tokio::sync::Mutex` acquired with
//! `try_lock_owned`: a second concurrent turn on the same session fails immediately
//! instead of queuing behind the first.

use crate::errors::CoreError;
use crate::part::{Session, SessionStatus};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

pub struct SessionStore {
    base_path: PathBuf,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

/// Held for the duration of one assistant turn. Dropping it (or calling `finish`)
/// releases the per-session exclusivity lock.
#[derive(Debug)]
pub struct TurnGuard {
    guard: OwnedMutexGuard<Session>,
}

impl std::ops::Deref for TurnGuard {
    type Target = Session;
    fn deref(&self) -> &Session {
        &self.guard
    }
}

impl std::ops::DerefMut for TurnGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.guard
    }
}

impl SessionStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            sessions: DashMap::new(),
        }
    }

    fn project_dir(&self, project_key: &str) -> PathBuf {
        self.base_path.join(project_key).join("sessions")
    }

    fn session_path(&self, project_key: &str, session_id: &str) -> PathBuf {
        self.project_dir(project_key).join(format!("{session_id}.json"))
    }

    /// Resolve (and lazily create) the in-memory handle for a session. An empty
    /// `session_id` always allocates a fresh session and id.
    async fn handle_for(&self, session_id: &str, project_key: &str) -> (String, Arc<Mutex<Session>>) {
        if session_id.is_empty() {
            let session = Session::new(project_key);
            let id = session.id.clone();
            let handle = Arc::new(Mutex::new(session));
            self.sessions.insert(id.clone(), handle.clone());
            return (id, handle);
        }

        if let Some(existing) = self.sessions.get(session_id) {
            return (session_id.to_string(), existing.clone());
        }

        let loaded = self.load_from_disk(project_key, session_id).await;
        let session = loaded.unwrap_or_else(|| Session::new(project_key).with_id(session_id));
        let handle = Arc::new(Mutex::new(session));
        // Another task may have raced us through the disk load above and already
        // inserted its own handle; `entry` makes the insert atomic so exactly one
        // handle wins and every caller ends up sharing it.
        let winner = self.sessions.entry(session_id.to_string()).or_insert_with(|| handle).clone();
        (session_id.to_string(), winner)
    }

    async fn load_from_disk(&self, project_key: &str, session_id: &str) -> Option<Session> {
        let path = self.session_path(project_key, session_id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<Session>(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(session_id, error = %e, "failed to parse persisted session, starting fresh");
                None
            }
        }
    }

    /// Begin a new turn on the named session, creating it if `session_id` is empty
    /// or unknown. Fails with `SessionBusy` if a turn is already in flight.
    pub async fn begin_turn(
        &self,
        session_id: &str,
        project_key: &str,
    ) -> Result<(String, TurnGuard), CoreError> {
        let (id, handle) = self.handle_for(session_id, project_key).await;
        let guard = handle.try_lock_owned().map_err(|_| {
            CoreError::SessionBusy(format!("session {id} already has an in-flight turn"))
        })?;
        let mut turn = TurnGuard { guard };
        turn.status = SessionStatus::Busy;
        Ok((id, turn))
    }

    /// Persist the session and release the turn lock (status is set to IDLE first).
    pub async fn end_turn(&self, project_key: &str, mut turn: TurnGuard) {
        turn.status = SessionStatus::Idle;
        if let Err(e) = self.persist(project_key, &turn).await {
            warn!(session_id = %turn.id, error = %e, "failed to persist session after turn");
        }
        // Dropping `turn` releases the per-session mutex.
    }

    async fn persist(&self, project_key: &str, session: &Session) -> anyhow::Result<()> {
        let dir = self.project_dir(project_key);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.session_path(project_key, &session.id);
        let json = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    /// Best-effort flush of every cached session; called on graceful shutdown and
    /// on eviction. Failures are logged, never propagated.
    pub async fn persist_all(&self) {
        for entry in self.sessions.iter() {
            let session = entry.value().lock().await;
            let project_key = session.project_key.clone();
            if let Err(e) = self.persist(&project_key, &session).await {
                warn!(session_id = %session.id, error = %e, "persist_all: failed to persist session");
            }
        }
        info!(count = self.sessions.len(), "persisted all cached sessions");
    }

    pub fn unload(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_turn_allocates_id_on_empty_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let (id, turn) = store.begin_turn("", "P1").await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(turn.status, SessionStatus::Busy);
    }

    #[tokio::test]
    async fn concurrent_begin_turn_on_same_session_fails_busy() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let (id, _turn) = store.begin_turn("", "P1").await.unwrap();

        let err = store.begin_turn(&id, "P1").await.unwrap_err();
        assert!(matches!(err, CoreError::SessionBusy(_)));
    }

    #[tokio::test]
    async fn end_turn_releases_lock_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let (id, turn) = store.begin_turn("", "P1").await.unwrap();
        store.end_turn("P1", turn).await;

        let (_, turn2) = store.begin_turn(&id, "P1").await.unwrap();
        assert_eq!(turn2.status, SessionStatus::Busy);

        let path = dir.path().join("P1").join("sessions").join(format!("{id}.json"));
        assert!(path.exists());
    }
}
