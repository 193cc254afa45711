//! Session registry: the authoritative map of live sessions.
//!
//! The registry creates, looks up, resizes, attaches to and destroys
//! sessions. It is an ordinary value owned by whoever serves requests, not
//! process-wide state, so tests can run any number of independent registries.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::pty::{
    Attachment, Session, SessionError, SessionId, SessionStatus, SpawnEnvironment, TerminalSize,
};
use crate::config::SessionConfig;

/// Snapshot of a session's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Process status.
    pub status: SessionStatus,
    /// Whether a client is attached.
    pub attached: bool,
    /// Bytes of scrollback held.
    pub scrollback_len: usize,
}

/// Thread-safe registry of PTY sessions.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    /// Shell, cwd and environment for every spawned process.
    environment: SpawnEnvironment,
    /// Geometry used when a request leaves a dimension unset.
    default_size: TerminalSize,
    /// Upper bound on live sessions.
    max_sessions: usize,
    /// Serializes the limit check with the insert.
    create_lock: Mutex<()>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: &SessionConfig, environment: SpawnEnvironment) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            environment,
            default_size: TerminalSize::new(config.default_cols, config.default_rows),
            max_sessions: config.max_sessions,
            create_lock: Mutex::new(()),
        }
    }

    /// Spawns a shell and registers it.
    ///
    /// Each dimension falls back to the configured default when it is absent,
    /// not positive, or too large for a terminal. Output capture is active
    /// from the moment the session exists. When the shell exits the session
    /// is removed from the registry.
    pub async fn create(
        &self,
        cols: Option<i64>,
        rows: Option<i64>,
    ) -> Result<SessionId, SessionError> {
        let size = TerminalSize::new(
            dimension(cols, self.default_size.cols),
            dimension(rows, self.default_size.rows),
        );

        let _guard = self.create_lock.lock().await;

        if self.sessions.len() >= self.max_sessions {
            tracing::warn!(max_sessions = self.max_sessions, "Session limit reached");
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let session = match Session::spawn(&self.environment, size) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::error!(error = %e, shell = %self.environment.shell, "Failed to create session");
                return Err(e);
            }
        };
        let session_id = session.id();

        self.sessions.insert(session_id, Arc::clone(&session));
        self.spawn_reaper(Arc::clone(&session));

        tracing::info!(
            session_id = session_id,
            cols = size.cols,
            rows = size.rows,
            term = %session.term_name(),
            cwd = %session.cwd().display(),
            "Created terminal"
        );

        Ok(session_id)
    }

    /// Removes the session once its process exits.
    ///
    /// Only the exact session watched is removed, so a later session that
    /// happens to reuse the same process id is left alone.
    fn spawn_reaper(&self, session: Arc<Session>) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let status = session.wait().await;
            let session_id = session.id();
            if sessions
                .remove_if(&session_id, |_, entry| Arc::ptr_eq(entry, &session))
                .is_some()
            {
                tracing::info!(
                    session_id = session_id,
                    status = ?status,
                    "Removed exited session"
                );
            }
        });
    }

    /// Looks up a session.
    pub fn get(&self, session_id: SessionId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::NotFound(session_id))
    }

    /// Applies new geometry to a session's terminal.
    pub async fn resize(
        &self,
        session_id: SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidSize { cols, rows });
        }

        let session = self.get(session_id)?;
        session.resize(TerminalSize::new(cols, rows)).await?;

        tracing::info!(
            session_id = session_id,
            cols = cols,
            rows = rows,
            "Resized terminal"
        );

        Ok(())
    }

    /// Attaches a client to a session.
    ///
    /// Returns the session itself alongside the attachment so the caller can
    /// later tear down exactly this session with [`destroy_session`], even if
    /// its id has been reused in the meantime.
    ///
    /// [`destroy_session`]: Self::destroy_session
    pub async fn attach(
        &self,
        session_id: SessionId,
    ) -> Result<(Arc<Session>, Attachment), SessionError> {
        let session = self.get(session_id)?;
        let attachment = session.attach().await?;

        tracing::info!(
            session_id = session_id,
            scrollback = attachment.scrollback.len(),
            "Connected to terminal"
        );

        Ok((session, attachment))
    }

    /// Kills a session's process and removes it.
    ///
    /// Destroying an unknown or already removed session is a no-op. The entry
    /// is removed even if the kill signal fails.
    pub async fn destroy(&self, session_id: SessionId) -> Result<(), SessionError> {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            tracing::debug!(session_id = session_id, "Session already removed");
            return Ok(());
        };

        terminate(&session).await
    }

    /// Kills the given session and removes its entry.
    ///
    /// The entry under the session's id is only removed if it still refers to
    /// this session; a newer session that reused the id is left untouched.
    pub async fn destroy_session(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        let session_id = session.id();
        if self
            .sessions
            .remove_if(&session_id, |_, entry| Arc::ptr_eq(entry, session))
            .is_none()
        {
            tracing::debug!(session_id = session_id, "Session already removed");
        }

        terminate(session).await
    }

    /// Destroys every session. Used at daemon shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for session_id in ids {
            let _ = self.destroy(session_id).await;
        }
    }

    /// Lists all registered sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        // Collect first so no map guard is held across an await.
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            let size = session.size();
            infos.push(SessionInfo {
                id: session.id(),
                cols: size.cols,
                rows: size.rows,
                status: session.status(),
                attached: session.output().is_attached().await,
                scrollback_len: session.output().len().await,
            });
        }
        infos
    }

    /// Checks if a session is registered.
    pub fn exists(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Points `session_id` at another session, as if the id had been reused.
    #[cfg(test)]
    pub(crate) fn reassign(&self, session_id: SessionId, session: Arc<Session>) {
        self.sessions.insert(session_id, session);
    }
}

/// Sends the kill signal. A process that already exited is left alone.
async fn terminate(session: &Session) -> Result<(), SessionError> {
    let session_id = session.id();
    if !session.is_running() {
        return Ok(());
    }

    if let Err(e) = session.kill().await {
        tracing::warn!(session_id = session_id, error = %e, "Failed to kill session");
        return Err(e);
    }

    tracing::info!(session_id = session_id, "Closed terminal");
    Ok(())
}

/// Resolves a requested dimension against its default.
fn dimension(requested: Option<i64>, default: u16) -> u16 {
    requested
        .filter(|value| *value > 0)
        .and_then(|value| u16::try_from(value).ok())
        .unwrap_or(default)
}
