use tracing::debug;

use crate::admin;
use crate::config::UsersConfig;
use crate::gateway::{
    CommandContext, CommandError, CommandHandler, Effect, Login, Outcome, Session, SessionError,
};
use crate::shared_types::SessionToken;
use crate::store::{MemoryConnector, MemoryHandle, StoreError};

// -----------------------------------------------------------------------------
// ----- Command ---------------------------------------------------------------

/// One parsed request line. Lines that do not parse still become a command
/// (`Malformed`) so they go through admission like everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Login { username: String, password: String },
    WhoAmI,
    Token,
    Resume(String),
    Revoke(String),
    Get(String),
    Set { key: String, value: String },
    Del(String),
    Stats,
    Logout,
    Quit,
    Malformed(CommandError),
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let mut parts = line.splitn(2, '|');
        let verb = parts.next().unwrap_or_default().trim().to_ascii_uppercase();
        let rest = parts.next();

        match (verb.as_str(), rest) {
            ("PING", None) => Command::Ping,
            ("WHOAMI", None) => Command::WhoAmI,
            ("TOKEN", None) => Command::Token,
            ("STATS", None) => Command::Stats,
            ("LOGOUT", None) => Command::Logout,
            ("QUIT", None) => Command::Quit,

            ("LOGIN", Some(rest)) => match rest.split_once('|') {
                Some((username, password)) if !username.is_empty() => Command::Login {
                    username: username.to_string(),
                    password: password.to_string(),
                },
                _ => malformed("usage: LOGIN|<username>|<password>"),
            },

            ("RESUME", Some(token)) if !token.is_empty() => Command::Resume(token.to_string()),
            ("REVOKE", Some(token)) if !token.is_empty() => Command::Revoke(token.to_string()),

            ("GET", Some(key)) if valid_key(key) => Command::Get(key.to_string()),
            ("DEL", Some(key)) if valid_key(key) => Command::Del(key.to_string()),
            ("SET", Some(rest)) => match rest.split_once('|') {
                Some((key, value)) if valid_key(key) => Command::Set {
                    key: key.to_string(),
                    value: value.to_string(),
                },
                _ => malformed("usage: SET|<key>|<value>"),
            },

            (
                "PING" | "WHOAMI" | "TOKEN" | "STATS" | "LOGOUT" | "QUIT" | "LOGIN" | "RESUME"
                | "REVOKE" | "GET" | "SET" | "DEL",
                _,
            ) => malformed(&format!("wrong number of arguments for {verb}")),

            ("", _) => malformed("empty command"),
            _ => Command::Malformed(CommandError::UnknownCommand(verb)),
        }
    }

    fn needs_auth(&self) -> bool {
        matches!(
            self,
            Command::Token
                | Command::Revoke(_)
                | Command::Get(_)
                | Command::Set { .. }
                | Command::Del(_)
                | Command::Stats
        )
    }
}

fn malformed(message: &str) -> Command {
    Command::Malformed(CommandError::BadRequest(message.to_string()))
}

fn valid_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('|')
}

// -----------------------------------------------------------------------------
// ----- BuiltinCommands -------------------------------------------------------

/// The command set served by the binary, backed by the in-memory store.
#[derive(Debug, Clone)]
pub struct BuiltinCommands {
    users: UsersConfig,
}

impl BuiltinCommands {
    pub fn new(users: UsersConfig) -> Self {
        Self { users }
    }
}

impl CommandHandler<MemoryConnector> for BuiltinCommands {
    type Request = Command;

    fn needs_store(&self, request: &Command, session: &Session) -> bool {
        session.is_authenticated()
            && matches!(
                request,
                Command::Get(_) | Command::Set { .. } | Command::Del(_)
            )
    }

    async fn execute(
        &self,
        request: &Command,
        ctx: CommandContext<'_, MemoryConnector>,
        store: Option<&mut MemoryHandle>,
    ) -> Result<Outcome, CommandError> {
        let session = ctx.session;

        if request.needs_auth() && !session.is_authenticated() {
            return Err(CommandError::Unauthenticated);
        }

        match request {
            Command::Ping => Ok(Outcome::reply("OK|PONG")),

            Command::Login { username, password } => {
                let user = self.users.authenticate(username, password).map_err(|err| {
                    debug!(client = ctx.client_id, username = %username, "login rejected: {err}");
                    CommandError::InvalidCredentials
                })?;

                let reply = format!("OK|LOGGED_IN|{}|{}", user.username, user.role);
                Ok(Outcome::reply(reply).with_effect(Effect::Login(Login {
                    user_id: user.id,
                    username: user.username,
                    role: user.role,
                })))
            }

            Command::WhoAmI => {
                let reply = match (&session.username, session.role) {
                    (Some(username), Some(role)) if session.is_authenticated() => {
                        format!("OK|{username}|{role}|{}", session.session_id)
                    }
                    _ => format!("OK|anonymous|{}", session.session_id),
                };
                Ok(Outcome::reply(reply))
            }

            Command::Token => {
                let login = login_of(session)?;
                let sessions = ctx.gateway.sessions();

                let minted = sessions.create_authenticated(ctx.client_id, login.user_id);
                sessions.authenticate(&minted.session_id, &login)?;

                Ok(Outcome::reply(format!("OK|{}", minted.token.as_str())))
            }

            Command::Resume(raw) => {
                let token = SessionToken::from_client(raw)
                    .ok_or_else(|| CommandError::BadRequest("empty token".to_string()))?;
                let resumed = ctx
                    .gateway
                    .sessions()
                    .get_by_token(&token)
                    .ok_or(CommandError::Session(SessionError::NotFound))?;

                let who = resumed.username.as_deref().unwrap_or("anonymous");
                let reply = format!("OK|RESUMED|{who}");
                Ok(Outcome::reply(reply).with_effect(Effect::Adopt(resumed.session_id)))
            }

            Command::Revoke(raw) => {
                let revoked = SessionToken::from_client(raw)
                    .is_some_and(|token| ctx.gateway.sessions().invalidate_by_token(&token));

                Ok(Outcome::reply(if revoked {
                    "OK|REVOKED"
                } else {
                    "OK|NOT_FOUND"
                }))
            }

            Command::Get(key) => {
                let value = handle(store)?.get(key)?;
                Ok(Outcome::reply(match value {
                    Some(value) => format!("OK|VALUE|{value}"),
                    None => "OK|NOT_FOUND".to_string(),
                }))
            }

            Command::Set { key, value } => {
                handle(store)?.set(key, value)?;
                Ok(Outcome::reply("OK|STORED"))
            }

            Command::Del(key) => {
                let existed = handle(store)?.delete(key)?;
                Ok(Outcome::reply(if existed {
                    "OK|DELETED"
                } else {
                    "OK|NOT_FOUND"
                }))
            }

            Command::Stats => {
                if !session.is_admin() {
                    return Err(CommandError::Forbidden);
                }
                let stats = ctx.gateway.stats();
                Ok(Outcome::reply(format!(
                    "OK|{}",
                    admin::format_stats(&stats, "|")
                )))
            }

            Command::Logout => Ok(Outcome::reply("OK|LOGGED_OUT").with_effect(Effect::Logout)),

            Command::Quit => Ok(Outcome::reply("OK|BYE").with_effect(Effect::Close)),

            Command::Malformed(err) => Err(err.clone()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn handle(store: Option<&mut MemoryHandle>) -> Result<&mut MemoryHandle, CommandError> {
    store.ok_or_else(|| {
        CommandError::Store(StoreError::Unavailable("no handle checked out".into()))
    })
}

fn login_of(session: &Session) -> Result<Login, CommandError> {
    match (session.user_id, &session.username, session.role) {
        (Some(user_id), Some(username), Some(role)) => Ok(Login {
            user_id,
            username: username.clone(),
            role,
        }),
        _ => Err(CommandError::Unauthenticated),
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
