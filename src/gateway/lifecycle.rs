use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::admission::{AdmissionController, AdmissionSettings};
use super::janitor::Janitor;
use super::pool::{PoolError, PoolSettings, PoolStats, ResourcePool};
use super::session::{Login, Session, SessionError, SessionRegistry, SessionSettings};
use crate::analytics::{Analytics, AnalyticsSnapshot};
use crate::shared_types::SessionId;
use crate::store::{Connector, StoreError};

// -----------------------------------------------------------------------------
// ----- GatewaySettings -------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewaySettings {
    pub pool: PoolSettings,
    pub sessions: SessionSettings,
    pub admission: AdmissionSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStats {
    pub pool: PoolStats,
    pub sessions: usize,
    pub tracked_clients: usize,
    pub analytics: AnalyticsSnapshot,
}

// -----------------------------------------------------------------------------
// ----- Commands --------------------------------------------------------------

/// What a command asks the gateway to do once it has run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Effect {
    #[default]
    None,

    /// Authenticate the connection's current session.
    Login(Login),

    /// Drop the current session; the next request starts a fresh one.
    Logout,

    /// Switch the connection over to an existing session.
    Adopt(SessionId),

    /// Reply, then hang up.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub reply: String,
    pub effect: Effect,
}

impl Outcome {
    pub fn reply(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            effect: Effect::None,
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }

    pub fn closes(&self) -> bool {
        self.effect == Effect::Close
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("permission denied")]
    Forbidden,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a command can see while it runs.
pub struct CommandContext<'a, C: Connector> {
    pub client_id: &'a str,
    pub session: &'a Session,
    pub gateway: &'a Gateway<C>,
}

/// The application-specific part of request handling. The gateway decides
/// when it runs and what it gets; the handler only decides what it does.
pub trait CommandHandler<C: Connector>: Send + Sync {
    type Request: Send + Sync;

    /// Whether this request needs a pooled handle. Only consulted after the
    /// request has been admitted.
    fn needs_store(&self, request: &Self::Request, session: &Session) -> bool;

    /// `store` is `Some` exactly when `needs_store` said so.
    fn execute(
        &self,
        request: &Self::Request,
        ctx: CommandContext<'_, C>,
        store: Option<&mut C::Handle>,
    ) -> impl Future<Output = Result<Outcome, CommandError>> + Send;
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

// -----------------------------------------------------------------------------
// ----- ClientContext ---------------------------------------------------------

/// Per-connection state carried between requests.
#[derive(Debug, Clone)]
pub struct ClientContext {
    client_id: String,
    session_id: Option<SessionId>,

    // False once the connection has adopted a session someone else created.
    owned: bool,
}

impl ClientContext {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }
}

// -----------------------------------------------------------------------------
// ----- Gateway ---------------------------------------------------------------

/// Composes the pool, the session registry and the admission controller into
/// the per-request lifecycle. Each component is shared by `Arc` so it can be
/// built, injected and inspected on its own.
#[derive(Debug)]
pub struct Gateway<C: Connector> {
    pool: Arc<ResourcePool<C>>,
    sessions: Arc<SessionRegistry>,
    admission: Arc<AdmissionController>,
    analytics: Analytics,
}

// -----------------------------------------------------------------------------
// ----- Gateway: Static -------------------------------------------------------

impl<C: Connector> Gateway<C> {
    pub fn new(
        pool: Arc<ResourcePool<C>>,
        sessions: Arc<SessionRegistry>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            pool,
            sessions,
            admission,
            analytics: Analytics::default(),
        }
    }

    /// Builds every component from settings. Fails if the pool cannot open
    /// its initial handles.
    pub async fn start(connector: C, settings: GatewaySettings) -> Result<Self, PoolError> {
        let pool = ResourcePool::start(connector, settings.pool).await?;

        Ok(Self::new(
            pool,
            Arc::new(SessionRegistry::new(settings.sessions)),
            Arc::new(AdmissionController::new(settings.admission)),
        ))
    }
}

// -----------------------------------------------------------------------------
// ----- Gateway: Public -------------------------------------------------------

impl<C: Connector> Gateway<C> {
    pub fn pool(&self) -> &Arc<ResourcePool<C>> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    /// Starts the periodic sweep over this gateway's sessions and admission
    /// state, on the configured sweep interval.
    pub fn spawn_janitor(&self) -> Janitor {
        Janitor::spawn(
            self.sessions.clone(),
            self.admission.clone(),
            self.sessions.settings().sweep_interval,
        )
    }

    pub fn open_client(&self, client_id: impl Into<String>) -> ClientContext {
        self.analytics.inc_connections_opened();

        ClientContext {
            client_id: client_id.into(),
            session_id: None,
            owned: true,
        }
    }

    /// Forgets the connection. Sessions it created go with it; adopted ones
    /// stay for whoever holds their token.
    pub fn close_client(&self, ctx: &mut ClientContext) {
        if let Some(session_id) = ctx.session_id.take() {
            if ctx.owned {
                self.sessions.remove(&session_id);
            }
        }
        self.analytics.inc_connections_closed();
    }

    /// Runs one request through the lifecycle:
    ///
    /// 1. resolve the connection's session, creating a fresh one if needed
    /// 2. admission control; a rejected request does nothing else
    /// 3. acquire a pooled handle if the command needs one, run the command,
    ///    and release the handle on every path
    /// 4. refresh the session and apply the command's effect
    pub async fn dispatch<H>(
        &self,
        handler: &H,
        ctx: &mut ClientContext,
        request: &H::Request,
    ) -> Result<Outcome, RequestError>
    where
        H: CommandHandler<C>,
    {
        self.analytics.inc_requests();

        let session = self.current_session(ctx);

        if !self.admission.is_allowed(&ctx.client_id) {
            self.analytics.inc_rate_limited();
            return Err(RequestError::RateLimited);
        }

        let command_ctx = CommandContext {
            client_id: &ctx.client_id,
            session: &session,
            gateway: self,
        };

        let result = if handler.needs_store(request, &session) {
            let mut guard = match self.pool.acquire().await {
                Ok(guard) => guard,
                Err(err) => {
                    if err.is_exhausted() {
                        self.analytics.inc_pool_exhausted();
                    }
                    self.analytics.inc_failed();
                    warn!(client = %ctx.client_id, error = %err, "no backing-store handle");
                    return Err(err.into());
                }
            };

            let result = handler
                .execute(request, command_ctx, guard.handle_mut())
                .await;
            guard.release();
            result
        } else {
            handler.execute(request, command_ctx, None).await
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                if err == CommandError::InvalidCredentials {
                    self.analytics.inc_auth_failures();
                }
                self.analytics.inc_failed();
                debug!(client = %ctx.client_id, error = %err, "command failed");
                return Err(err.into());
            }
        };

        self.finish(ctx, &session, &outcome.effect)
            .inspect_err(|_| self.analytics.inc_failed())?;

        Ok(outcome)
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            pool: self.pool.stats(),
            sessions: self.sessions.len(),
            tracked_clients: self.admission.tracked_clients(),
            analytics: self.analytics.snapshot(),
        }
    }

    /// Shuts the pool down and drops every session. Connections still being
    /// served see `PoolError::Shutdown` on their next store request.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        let cleared = self.sessions.clear();
        info!(cleared, "gateway shut down");
    }
}

// -----------------------------------------------------------------------------
// ----- Gateway: Private ------------------------------------------------------

impl<C: Connector> Gateway<C> {
    fn current_session(&self, ctx: &mut ClientContext) -> Session {
        if let Some(session) = ctx
            .session_id
            .as_ref()
            .and_then(|session_id| self.sessions.get(session_id))
        {
            return session;
        }

        let session = self.sessions.create(&ctx.client_id);
        ctx.session_id = Some(session.session_id.clone());
        ctx.owned = true;
        session
    }

    fn finish(
        &self,
        ctx: &mut ClientContext,
        session: &Session,
        effect: &Effect,
    ) -> Result<(), SessionError> {
        match effect {
            Effect::None | Effect::Close => {
                // The command may have removed its own session; that is fine.
                let _ = self.sessions.touch(&session.session_id);
            }

            Effect::Login(login) => {
                self.sessions.authenticate(&session.session_id, login)?;
                info!(client = %ctx.client_id, username = %login.username, "client logged in");
            }

            Effect::Logout => {
                self.sessions.remove(&session.session_id);
                ctx.session_id = None;
                ctx.owned = true;
            }

            Effect::Adopt(session_id) => {
                if ctx.owned && *session_id != session.session_id {
                    self.sessions.remove(&session.session_id);
                }
                ctx.session_id = Some(session_id.clone());
                ctx.owned = false;
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
