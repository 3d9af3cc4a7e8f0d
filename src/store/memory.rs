use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use super::{Connector, RemoteClose, StoreError, StoreHandle};

// -----------------------------------------------------------------------------
// ----- MemoryConnector -------------------------------------------------------

/// In-process key/value store that stands in for the database.
///
/// Every handle shares the same map. Handles remember the store generation
/// they were opened in; `restart()` bumps the generation, which makes every
/// existing handle report itself closed, the way a database restart would.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    data: Arc<RwLock<BTreeMap<String, String>>>,
    generation: Arc<AtomicU64>,
    attempts: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    connect_limit: Option<usize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose first `limit` connection attempts succeed and every
    /// later one fails.
    pub fn failing_after(limit: usize) -> Self {
        Self {
            connect_limit: Some(limit),
            ..Self::default()
        }
    }

    /// Number of native handles opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    pub fn restart(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "memory store restarted");
    }

    /// Reads a committed value, bypassing any handle.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }
}

impl Connector for MemoryConnector {
    type Handle = MemoryHandle;

    async fn connect(&self) -> Result<MemoryHandle, StoreError> {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel);
        if let Some(limit) = self.connect_limit {
            if attempt >= limit {
                return Err(StoreError::Unavailable(format!(
                    "connection limit of {limit} reached"
                )));
            }
        }

        self.opened.fetch_add(1, Ordering::AcqRel);

        Ok(MemoryHandle {
            data: self.data.clone(),
            opened_in: self.generation.load(Ordering::Acquire),
            generation: self.generation.clone(),
            pending: None,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryHandle ----------------------------------------------------------

#[derive(Debug)]
pub struct MemoryHandle {
    data: Arc<RwLock<BTreeMap<String, String>>>,
    opened_in: u64,
    generation: Arc<AtomicU64>,

    // Some(..) while a transaction is open; writes are buffered until commit.
    pending: Option<Vec<(String, Option<String>)>>,

    // Shared with `RemoteClose` so the pool can close a handle it lent out.
    closed: Arc<AtomicBool>,
}

// -----------------------------------------------------------------------------
// ----- MemoryHandle: Public --------------------------------------------------

impl MemoryHandle {
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_open()?;

        if let Some(pending) = &self.pending {
            if let Some((_, value)) = pending.iter().rev().find(|(k, _)| k == key) {
                return Ok(value.clone());
            }
        }

        Ok(self.data.read().get(key).cloned())
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(key, Some(value.to_string()))
    }

    /// Returns whether the key held a value before the delete.
    pub fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        let existed = self.get(key)?.is_some();
        self.write(key, None)?;
        Ok(existed)
    }

    pub fn begin(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        if self.pending.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        let pending = self.pending.take().ok_or(StoreError::NoTransaction)?;

        let mut data = self.data.write();
        for (key, value) in pending {
            apply(&mut data, key, value);
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        self.pending.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    pub fn is_auto_commit(&self) -> bool {
        self.pending.is_none()
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryHandle: Private -------------------------------------------------

impl MemoryHandle {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn write(&mut self, key: &str, value: Option<String>) -> Result<(), StoreError> {
        self.check_open()?;

        match self.pending.as_mut() {
            Some(pending) => pending.push((key.to_string(), value)),
            None => apply(&mut self.data.write(), key.to_string(), value),
        }
        Ok(())
    }
}

impl StoreHandle for MemoryHandle {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self.opened_in != self.generation.load(Ordering::Acquire)
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        if self.pending.take().is_some() {
            debug!("rolled back transaction left open on returned handle");
        }
        Ok(())
    }

    fn close(&mut self) {
        self.pending = None;
        self.closed.store(true, Ordering::Release);
    }

    fn remote_close(&self) -> RemoteClose {
        let closed = self.closed.clone();
        RemoteClose::new(move || closed.store(true, Ordering::Release))
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn apply(data: &mut BTreeMap<String, String>, key: String, value: Option<String>) {
    match value {
        Some(value) => {
            data.insert(key, value);
        }
        None => {
            data.remove(&key);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_are_shared_between_handles() {
        let connector = MemoryConnector::new();
        let mut a = connector.connect().await.unwrap();
        let b = connector.connect().await.unwrap();

        a.set("title", "Dune").unwrap();
        assert_eq!(b.get("title").unwrap().as_deref(), Some("Dune"));
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn transaction_buffers_until_commit() {
        let connector = MemoryConnector::new();
        let mut handle = connector.connect().await.unwrap();

        handle.begin().unwrap();
        assert!(!handle.is_auto_commit());
        handle.set("k", "v").unwrap();
        assert_eq!(handle.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(connector.peek("k"), None);

        handle.commit().unwrap();
        assert_eq!(connector.peek("k").as_deref(), Some("v"));
        assert!(handle.is_auto_commit());
    }

    #[tokio::test]
    async fn reset_discards_open_transaction() {
        let connector = MemoryConnector::new();
        let mut handle = connector.connect().await.unwrap();

        handle.begin().unwrap();
        handle.set("k", "v").unwrap();
        handle.reset().unwrap();

        assert!(handle.is_auto_commit());
        assert_eq!(handle.get("k").unwrap(), None);
        assert_eq!(handle.rollback(), Err(StoreError::NoTransaction));
    }

    #[tokio::test]
    async fn restart_invalidates_existing_handles() {
        let connector = MemoryConnector::new();
        let mut old = connector.connect().await.unwrap();
        connector.restart();
        let fresh = connector.connect().await.unwrap();

        assert!(old.is_closed());
        assert!(!fresh.is_closed());
        assert_eq!(old.set("k", "v"), Err(StoreError::Closed));
    }

    #[tokio::test]
    async fn remote_close_reaches_the_holder() {
        let connector = MemoryConnector::new();
        let mut held = connector.connect().await.unwrap();
        let other = connector.connect().await.unwrap();

        let switch = held.remote_close();
        held.begin().unwrap();
        switch.close();
        switch.close();

        assert!(held.is_closed());
        assert!(!other.is_closed());
        assert_eq!(held.set("k", "v"), Err(StoreError::Closed));
    }

    #[tokio::test]
    async fn failing_after_limit() {
        let connector = MemoryConnector::failing_after(1);
        assert!(connector.connect().await.is_ok());
        assert!(matches!(
            connector.connect().await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn delete_reports_previous_presence() {
        let connector = MemoryConnector::new();
        let mut handle = connector.connect().await.unwrap();
        handle.set("k", "v").unwrap();

        assert!(handle.delete("k").unwrap());
        assert!(!handle.delete("k").unwrap());
    }
}
