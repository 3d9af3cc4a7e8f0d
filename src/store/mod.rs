// Backing-store seam. The pool only ever talks to these two traits, so any
// native handle type can sit behind it.

pub mod memory;

pub use memory::{MemoryConnector, MemoryHandle};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

// -----------------------------------------------------------------------------
// ----- Traits ----------------------------------------------------------------

/// A live connection to the backing store.
pub trait StoreHandle: Send + 'static {
    /// Liveness check used before a pooled handle is handed out again.
    fn is_closed(&self) -> bool;

    /// Brings the handle back to its default per-use state (auto-commit, no
    /// open transaction). Called on every return to the pool.
    fn reset(&mut self) -> Result<(), StoreError>;

    /// Closes the underlying native handle. Must be safe to call twice.
    fn close(&mut self);

    /// A way to close this handle while someone else holds it. Used by pool
    /// shutdown for handles that are checked out.
    fn remote_close(&self) -> RemoteClose;
}

/// Opens new native handles for the pool.
pub trait Connector: Send + Sync + 'static {
    type Handle: StoreHandle;

    fn connect(&self) -> impl Future<Output = Result<Self::Handle, StoreError>> + Send;
}

// -----------------------------------------------------------------------------
// ----- RemoteClose -----------------------------------------------------------

/// Shareable close switch for one native handle. Firing it after the handle
/// was already closed is a no-op.
#[derive(Clone)]
pub struct RemoteClose(Arc<dyn Fn() + Send + Sync>);

impl RemoteClose {
    pub fn new(close: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(close))
    }

    pub fn close(&self) {
        (self.0)()
    }
}

impl fmt::Debug for RemoteClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RemoteClose")
    }
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("handle is closed")]
    Closed,

    #[error("a transaction is already open")]
    TransactionOpen,

    #[error("no transaction is open")]
    NoTransaction,
}
