use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

// -----------------------------------------------------------------------------
// ----- Counters --------------------------------------------------------------

// Sequence numbers make ids unique for the lifetime of the process; the random
// suffix keeps them unguessable.
static SESSION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

// -----------------------------------------------------------------------------
// ----- SessionId -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let seq = SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let salt: u64 = rand::rng().random();
        SessionId(format!("S{seq:08x}{salt:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// -----------------------------------------------------------------------------
// ----- SessionToken ----------------------------------------------------------

/// Opaque bearer credential. Independent from the session id so that the id
/// can show up in logs while the token never does.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let hi: u128 = rng.random();
        let lo: u128 = rng.random();
        SessionToken(format!("{hi:032x}{lo:032x}"))
    }

    /// Wraps a token presented by a client. No validation beyond non-emptiness
    /// happens here; an unknown token simply matches no session.
    pub fn from_client(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(SessionToken(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

// -----------------------------------------------------------------------------
// ----- HandleId --------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
