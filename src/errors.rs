use bytes::{BufMut, Bytes, BytesMut};

use crate::gateway::{CommandError, PoolError, RequestError, SessionError};

// -----------------------------------------------------------------------------
// ----- ErrorResponse ---------------------------------------------------------

/// An error reply on the line protocol: `ERROR|<CODE>|<message>[|<detail>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub detail: Option<String>,

    /// Whether the connection is closed after this reply.
    pub fatal: bool,
}

// -----------------------------------------------------------------------------
// ----- ErrorResponse: Static -------------------------------------------------

impl ErrorResponse {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
            fatal: false,
        }
    }

    pub fn rate_limited() -> Self {
        Self::new("RATE_LIMITED", "too many requests, slow down")
    }

    pub fn service_busy(message: impl Into<String>) -> Self {
        Self::new("SERVICE_BUSY", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("UNAVAILABLE", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::new("PROTOCOL_VIOLATION", message)
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }
}

// -----------------------------------------------------------------------------
// ----- ErrorResponse: Builder ------------------------------------------------

impl ErrorResponse {
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

// -----------------------------------------------------------------------------
// ----- ErrorResponse: Public -------------------------------------------------

impl ErrorResponse {
    /// The complete reply line, newline included.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.message.len());

        buf.put_slice(b"ERROR|");
        buf.put_slice(self.code.as_bytes());
        buf.put_u8(b'|');
        put_field(&mut buf, &self.message);

        if let Some(detail) = self.detail.as_deref() {
            buf.put_u8(b'|');
            put_field(&mut buf, detail);
        }

        buf.put_u8(b'\n');
        buf.freeze()
    }
}

impl From<&RequestError> for ErrorResponse {
    fn from(err: &RequestError) -> Self {
        match err {
            RequestError::RateLimited => Self::rate_limited(),

            RequestError::Pool(PoolError::Exhausted(cause)) => {
                Self::service_busy("no backing-store handle available")
                    .with_detail(cause.to_string())
            }
            RequestError::Pool(PoolError::Shutdown) => Self::unavailable("server is shutting down"),
            RequestError::Pool(PoolError::Startup(store)) => Self::unavailable(store.to_string()),

            RequestError::Session(err) | RequestError::Command(CommandError::Session(err)) => {
                session_error(*err)
            }

            RequestError::Command(err) => command_error(err),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn session_error(err: SessionError) -> ErrorResponse {
    match err {
        SessionError::Expired => {
            ErrorResponse::new("SESSION_EXPIRED", "session expired, log in again")
        }
        SessionError::NotFound => ErrorResponse::new("SESSION_NOT_FOUND", "no such session"),
    }
}

fn command_error(err: &CommandError) -> ErrorResponse {
    match err {
        CommandError::UnknownCommand(verb) => {
            ErrorResponse::new("UNKNOWN_COMMAND", format!("unknown command '{verb}'"))
        }
        CommandError::BadRequest(message) => ErrorResponse::bad_request(message.clone()),
        CommandError::Unauthenticated => {
            ErrorResponse::new("AUTH_REQUIRED", "log in first")
        }
        CommandError::Forbidden => ErrorResponse::new("FORBIDDEN", "permission denied"),
        CommandError::InvalidCredentials => {
            ErrorResponse::new("INVALID_CREDENTIALS", "invalid username or password")
        }
        CommandError::Session(err) => session_error(*err),
        CommandError::Store(err) => ErrorResponse::new("STORE_ERROR", err.to_string()),
    }
}

// Field separators and line breaks would change the shape of the reply.
#[inline]
fn put_field(buf: &mut BytesMut, val: &str) {
    for byte in val.bytes() {
        match byte {
            b'|' => buf.put_u8(b'/'),
            b'\r' | b'\n' => buf.put_u8(b' '),
            other => buf.put_u8(other),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
