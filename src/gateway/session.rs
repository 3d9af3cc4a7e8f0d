use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::shared_types::{AuthStage, Role, SessionId, SessionToken};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// -----------------------------------------------------------------------------
// ----- SessionSettings -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Session ---------------------------------------------------------------

/// Snapshot of a registered session. The registry owns the live record;
/// callers get copies and refer back to it by id or token.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub client_address: String,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub stage: AuthStage,
    pub user_id: Option<u64>,
    pub username: Option<String>,
    pub role: Option<Role>,
    pub token: SessionToken,
}

/// Identity attached to a session by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub user_id: u64,
    pub username: String,
    pub role: Role,
}

impl Session {
    fn new(client_address: &str, now: Instant) -> Self {
        Self {
            session_id: SessionId::generate(),
            client_address: client_address.to_string(),
            created_at: now,
            last_activity_at: now,
            stage: AuthStage::Anonymous,
            user_id: None,
            username: None,
            role: None,
            token: SessionToken::generate(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.stage.is_authenticated()
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_some_and(Role::is_admin)
    }

    fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity_at) > idle_timeout
    }

    fn touch(&mut self, now: Instant) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,

    #[error("session expired")]
    Expired,
}

// -----------------------------------------------------------------------------
// ----- SessionRegistry -------------------------------------------------------

/// In-memory session store with idle-timeout expiry.
///
/// Both indexes live behind one lock, so a session is never reachable by
/// token after its removal by id (or the other way round).
#[derive(Debug)]
pub struct SessionRegistry {
    settings: SessionSettings,
    inner: RwLock<SessionMaps>,
}

#[derive(Debug, Default)]
struct SessionMaps {
    by_id: HashMap<SessionId, Session>,
    by_token: HashMap<SessionToken, SessionId>,
}

impl SessionMaps {
    fn insert(&mut self, session: Session) {
        self.by_token
            .insert(session.token.clone(), session.session_id.clone());
        self.by_id.insert(session.session_id.clone(), session);
    }

    fn remove(&mut self, session_id: &SessionId) -> Option<Session> {
        let session = self.by_id.remove(session_id)?;
        self.by_token.remove(&session.token);
        Some(session)
    }

    /// Lazy expiry: evicts the session if it is stale, refreshes it otherwise.
    fn live_mut(
        &mut self,
        session_id: &SessionId,
        now: Instant,
        idle_timeout: Duration,
    ) -> Result<&mut Session, SessionError> {
        let expired = self
            .by_id
            .get(session_id)
            .ok_or(SessionError::NotFound)?
            .is_expired(now, idle_timeout);

        if expired {
            self.remove(session_id);
            debug!(session = %session_id, "session expired and removed");
            return Err(SessionError::Expired);
        }

        let session = self.by_id.get_mut(session_id).ok_or(SessionError::NotFound)?;
        session.touch(now);
        Ok(session)
    }
}

// -----------------------------------------------------------------------------
// ----- SessionRegistry: Static -----------------------------------------------

impl SessionRegistry {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            inner: RwLock::new(SessionMaps::default()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionRegistry: Public -----------------------------------------------

impl SessionRegistry {
    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    pub fn create(&self, client_address: &str) -> Session {
        let session = Session::new(client_address, Instant::now());
        self.inner.write().insert(session.clone());
        debug!(session = %session.session_id, client = client_address, "session created");
        session
    }

    /// For flows that authenticate before any session exists (token login).
    pub fn create_authenticated(&self, client_address: &str, user_id: u64) -> Session {
        let mut session = Session::new(client_address, Instant::now());
        session.stage = AuthStage::Authenticated;
        session.user_id = Some(user_id);

        self.inner.write().insert(session.clone());
        debug!(
            session = %session.session_id,
            client = client_address,
            user_id,
            "authenticated session created"
        );
        session
    }

    /// Returns the session if it is still live and refreshes its activity.
    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.resolve(session_id).ok()
    }

    /// Like `get`, but tells an expired session apart from an unknown one.
    pub fn resolve(&self, session_id: &SessionId) -> Result<Session, SessionError> {
        let now = Instant::now();
        let mut maps = self.inner.write();
        maps.live_mut(session_id, now, self.settings.idle_timeout)
            .map(|session| session.clone())
    }

    pub fn get_by_token(&self, token: &SessionToken) -> Option<Session> {
        let now = Instant::now();
        let mut maps = self.inner.write();
        let session_id = maps.by_token.get(token)?.clone();
        maps.live_mut(&session_id, now, self.settings.idle_timeout)
            .ok()
            .map(|session| session.clone())
    }

    pub fn touch(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let now = Instant::now();
        let mut maps = self.inner.write();
        maps.live_mut(session_id, now, self.settings.idle_timeout)
            .map(|_| ())
    }

    /// Marks the session authenticated. Re-authenticating an already
    /// authenticated session replaces its identity.
    pub fn authenticate(
        &self,
        session_id: &SessionId,
        login: &Login,
    ) -> Result<Session, SessionError> {
        let now = Instant::now();
        let mut maps = self.inner.write();
        let session = maps.live_mut(session_id, now, self.settings.idle_timeout)?;

        session.stage = AuthStage::Authenticated;
        session.user_id = Some(login.user_id);
        session.username = Some(login.username.clone());
        session.role = Some(login.role);

        debug!(
            session = %session_id,
            username = %login.username,
            role = %login.role,
            "session authenticated"
        );
        Ok(session.clone())
    }

    pub fn remove(&self, session_id: &SessionId) -> bool {
        let removed = self.inner.write().remove(session_id).is_some();
        if removed {
            debug!(session = %session_id, "session removed");
        }
        removed
    }

    pub fn invalidate_by_token(&self, token: &SessionToken) -> bool {
        let mut maps = self.inner.write();
        let Some(session_id) = maps.by_token.get(token).cloned() else {
            return false;
        };
        maps.remove(&session_id);
        drop(maps);

        debug!(session = %session_id, "session invalidated by token");
        true
    }

    /// Removes every session idle past the timeout. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.settings.idle_timeout;

        let mut maps = self.inner.write();
        let before = maps.by_id.len();

        let SessionMaps { by_id, by_token } = &mut *maps;
        by_id.retain(|_, session| {
            let keep = !session.is_expired(now, idle_timeout);
            if !keep {
                by_token.remove(&session.token);
            }
            keep
        });

        let removed = before - by_id.len();
        drop(maps);

        if removed > 0 {
            info!(removed, "cleaned up expired sessions");
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let mut maps = self.inner.write();
        let count = maps.by_id.len();
        maps.by_id.clear();
        maps.by_token.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
