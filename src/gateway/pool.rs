use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::shared_types::HandleId;
use crate::store::{Connector, RemoteClose, StoreError, StoreHandle};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const DEFAULT_INITIAL_SIZE: usize = 5;
pub const DEFAULT_MAX_SIZE: usize = 20;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// ----- PoolSettings ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub initial_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_INITIAL_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl PoolSettings {
    fn normalized(self) -> Self {
        let max_size = self.max_size.max(1);
        Self {
            initial_size: self.initial_size.min(max_size),
            max_size,
            acquire_timeout: self.acquire_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub opening: usize,
    pub total: usize,
    pub initial: usize,
    pub max: usize,
    pub shut_down: bool,
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool exhausted: {0}")]
    Exhausted(ExhaustedCause),

    #[error("pool is shut down")]
    Shutdown,

    #[error("failed to open initial backing-store handles: {0}")]
    Startup(StoreError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExhaustedCause {
    #[error("no handle became available within {0:?}")]
    Timeout(Duration),

    #[error("could not open an additional handle: {0}")]
    GrowthFailed(StoreError),
}

impl PoolError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::Exhausted(_))
    }
}

// -----------------------------------------------------------------------------
// ----- ResourcePool ----------------------------------------------------------

/// Bounded pool of backing-store handles.
///
/// Capacity is tracked with a semaphore holding `max_size` permits. A caller
/// owns one permit for as long as it holds a checked-out handle; the permit is
/// handed back together with the handle. Holding a permit therefore guarantees
/// that either an idle handle exists or there is room to open a new one.
pub struct ResourcePool<C: Connector> {
    connector: C,
    settings: PoolSettings,
    permits: Semaphore,
    state: Mutex<PoolState<C::Handle>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

struct PoolState<H> {
    idle: VecDeque<IdleHandle<H>>,
    checked_out: HashMap<HandleId, RemoteClose>,
    opening: usize,
}

struct IdleHandle<H> {
    id: HandleId,
    handle: H,
    created_at: Instant,
}

struct Checkout<H> {
    id: HandleId,
    handle: H,
    created_at: Instant,
}

impl<C: Connector> fmt::Debug for ResourcePool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ----- ResourcePool: Static --------------------------------------------------

impl<C: Connector> ResourcePool<C> {
    /// Opens `initial_size` handles eagerly. Failing to do so is fatal for the
    /// caller: a pool below its minimum is never handed out.
    pub async fn start(connector: C, settings: PoolSettings) -> Result<Arc<Self>, PoolError> {
        let settings = settings.normalized();

        let pool = Self {
            connector,
            settings,
            permits: Semaphore::new(settings.max_size),
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(settings.max_size),
                checked_out: HashMap::with_capacity(settings.max_size),
                opening: 0,
            }),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        };

        for _ in 0..settings.initial_size {
            match pool.connector.connect().await {
                Ok(handle) => {
                    let id = pool.next_handle_id();
                    pool.state.lock().idle.push_back(IdleHandle {
                        id,
                        handle,
                        created_at: Instant::now(),
                    });
                }
                Err(err) => {
                    pool.shutdown();
                    return Err(PoolError::Startup(err));
                }
            }
        }

        info!(
            initial = settings.initial_size,
            max = settings.max_size,
            "resource pool ready"
        );

        Ok(Arc::new(pool))
    }
}

// -----------------------------------------------------------------------------
// ----- ResourcePool: Public --------------------------------------------------

impl<C: Connector> ResourcePool<C> {
    /// Waits up to the configured timeout for a handle. The deadline covers
    /// both the wait for capacity and opening a new handle.
    ///
    /// Dropping the returned future at any point leaves the pool untouched:
    /// the permit goes back to the semaphore and a half-opened slot is
    /// released by its reservation guard.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledHandle<C>, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::Shutdown);
        }

        let wait = self.settings.acquire_timeout;
        let deadline = Instant::now() + wait;

        let permit = match timeout_at(deadline, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(PoolError::Shutdown),
            Err(_elapsed) => {
                debug!(waited = ?wait, "timed out waiting for a pooled handle");
                return Err(PoolError::Exhausted(ExhaustedCause::Timeout(wait)));
            }
        };

        let checkout = match timeout_at(deadline, self.checkout()).await {
            Ok(checkout) => checkout?,
            Err(_elapsed) => {
                warn!(waited = ?wait, "timed out opening a new pooled handle");
                return Err(PoolError::Exhausted(ExhaustedCause::Timeout(wait)));
            }
        };

        // From here on the permit travels with the handle and is restored by
        // `give_back`.
        permit.forget();

        Ok(PooledHandle {
            pool: self.clone(),
            id: checkout.id,
            created_at: checkout.created_at,
            handle: Some(checkout.handle),
        })
    }

    /// Returns a handle to this pool. Handles that belong to another pool are
    /// left alone (they go home when dropped), and releasing twice is a no-op.
    pub fn release(&self, mut handle: PooledHandle<C>) {
        if !std::ptr::eq(Arc::as_ptr(&handle.pool), self) {
            warn!(handle = %handle.id, "ignoring release of a handle owned by another pool");
            return;
        }

        handle.release();
    }

    /// Closes every idle and every checked-out handle. Holders of a
    /// checked-out handle find it closed; their guard returns nothing to the
    /// pool. Later `acquire()` calls fail fast.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.permits.close();

        let (idle, outstanding) = {
            let mut state = self.state.lock();
            let idle = std::mem::take(&mut state.idle);
            let outstanding: Vec<RemoteClose> =
                state.checked_out.drain().map(|(_, close)| close).collect();
            (idle, outstanding)
        };

        let closed = idle.len();
        for mut entry in idle {
            entry.handle.close();
        }

        for close in &outstanding {
            close.close();
        }
        let outstanding = outstanding.len();

        info!(closed, outstanding, "resource pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let idle = state.idle.len();
        let in_use = state.checked_out.len();

        PoolStats {
            idle,
            in_use,
            opening: state.opening,
            total: idle + in_use + state.opening,
            initial: self.settings.initial_size,
            max: self.settings.max_size,
            shut_down: self.is_shut_down(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- ResourcePool: Private -------------------------------------------------

impl<C: Connector> ResourcePool<C> {
    fn next_handle_id(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Caller must hold a permit.
    async fn checkout(&self) -> Result<Checkout<C::Handle>, PoolError> {
        let reservation = {
            let mut state = self.state.lock();
            if self.is_shut_down() {
                return Err(PoolError::Shutdown);
            }

            while let Some(mut entry) = state.idle.pop_front() {
                if entry.handle.is_closed() {
                    warn!(handle = %entry.id, "discarding dead idle handle");
                    entry.handle.close();
                    continue;
                }

                state.checked_out.insert(entry.id, entry.handle.remote_close());
                debug!(handle = %entry.id, "checked out idle handle");

                return Ok(Checkout {
                    id: entry.id,
                    handle: entry.handle,
                    created_at: entry.created_at,
                });
            }

            state.opening += 1;
            Reservation {
                pool: self,
                committed: false,
            }
        };

        let mut handle = match self.connector.connect().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "failed to grow resource pool");
                return Err(PoolError::Exhausted(ExhaustedCause::GrowthFailed(err)));
            }
        };

        let id = self.next_handle_id();
        let created_at = Instant::now();

        {
            let mut state = self.state.lock();
            if !self.is_shut_down() {
                state.opening -= 1;
                state.checked_out.insert(id, handle.remote_close());
                reservation.commit();
                debug!(handle = %id, "opened new handle");

                return Ok(Checkout {
                    id,
                    handle,
                    created_at,
                });
            }
        }

        handle.close();
        Err(PoolError::Shutdown)
    }

    fn give_back(&self, id: HandleId, mut handle: C::Handle, created_at: Instant) {
        let healthy = !handle.is_closed()
            && match handle.reset() {
                Ok(()) => true,
                Err(err) => {
                    warn!(handle = %id, error = %err, "dropping handle after reset failure");
                    false
                }
            };

        let mut state = self.state.lock();

        if state.checked_out.remove(&id).is_none() {
            // The pool was shut down while this handle was out.
            drop(state);
            handle.close();
            debug!(handle = %id, "closed handle returned after shutdown");
            return;
        }

        if healthy {
            state.idle.push_back(IdleHandle {
                id,
                handle,
                created_at,
            });
            drop(state);
            debug!(handle = %id, "handle returned to pool");
        } else {
            drop(state);
            handle.close();
        }

        self.permits.add_permits(1);
    }
}

// -----------------------------------------------------------------------------
// ----- Reservation -----------------------------------------------------------

// Holds an `opening` slot while a new handle is being connected. Dropping it
// without committing (error, shutdown, or the acquire future being dropped)
// gives the slot back.
struct Reservation<'a, C: Connector> {
    pool: &'a ResourcePool<C>,
    committed: bool,
}

impl<C: Connector> Reservation<'_, C> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.state.lock().opening -= 1;
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PooledHandle ----------------------------------------------------------

/// A checked-out handle. Returns itself to the pool on `release()` or drop,
/// whichever happens first.
pub struct PooledHandle<C: Connector> {
    pool: Arc<ResourcePool<C>>,
    id: HandleId,
    created_at: Instant,
    handle: Option<C::Handle>,
}

impl<C: Connector> PooledHandle<C> {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    /// `None` once the handle has been released.
    pub fn handle_mut(&mut self) -> Option<&mut C::Handle> {
        self.handle.as_mut()
    }

    pub fn handle(&self) -> Option<&C::Handle> {
        self.handle.as_ref()
    }

    pub fn release(&mut self) {
        match self.handle.take() {
            Some(handle) => self.pool.give_back(self.id, handle, self.created_at),
            None => debug!(handle = %self.id, "handle already released"),
        }
    }
}

impl<C: Connector> fmt::Debug for PooledHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl<C: Connector> Drop for PooledHandle<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.give_back(self.id, handle, self.created_at);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConnector, MemoryHandle};
    use std::collections::HashSet;

    /// Connects only after `delay`, like a backing store that is slow to
    /// accept.
    struct SlowConnector {
        inner: MemoryConnector,
        delay: Duration,
    }

    impl Connector for SlowConnector {
        type Handle = MemoryHandle;

        async fn connect(&self) -> Result<MemoryHandle, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.connect().await
        }
    }

    fn settings(initial: usize, max: usize) -> PoolSettings {
        PoolSettings {
            initial_size: initial,
            max_size: max,
            acquire_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn opens_initial_handles_eagerly() {
        let connector = MemoryConnector::new();
        let pool = ResourcePool::start(connector.clone(), settings(3, 5))
            .await
            .unwrap();

        assert_eq!(connector.opened(), 3);
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn startup_failure_is_fatal() {
        let err = ResourcePool::start(MemoryConnector::failing_after(2), settings(3, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Startup(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn grows_lazily_up_to_max() {
        let connector = MemoryConnector::new();
        let pool = ResourcePool::start(connector.clone(), settings(1, 3))
            .await
            .unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();

        assert_eq!(connector.opened(), 3);
        assert_eq!(pool.stats().in_use, 3);
        assert_eq!(pool.stats().total, 3);

        drop((a, b, c));
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_exhausted() {
        let pool = ResourcePool::start(MemoryConnector::new(), settings(1, 1))
            .await
            .unwrap();
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(
            err,
            PoolError::Exhausted(ExhaustedCause::Timeout(Duration::from_secs(1)))
        );
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = ResourcePool::start(MemoryConnector::new(), settings(1, 2))
            .await
            .unwrap();

        let mut handle = pool.acquire().await.unwrap();
        handle.release();
        handle.release();
        assert!(handle.is_released());
        drop(handle);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 0);
        assert_eq!(pool.permits.available_permits(), 2);
    }

    #[tokio::test]
    async fn releasing_into_the_wrong_pool_is_ignored() {
        let home = ResourcePool::start(MemoryConnector::new(), settings(1, 1))
            .await
            .unwrap();
        let other = ResourcePool::start(MemoryConnector::new(), settings(1, 1))
            .await
            .unwrap();

        let handle = home.acquire().await.unwrap();
        other.release(handle);

        assert_eq!(other.stats().idle, 1);
        assert_eq!(other.stats().total, 1);
        // The handle found its way back to the pool that issued it.
        assert_eq!(home.stats().idle, 1);
        assert_eq!(home.stats().in_use, 0);
    }

    #[tokio::test]
    async fn returned_handles_are_reset() {
        let pool = ResourcePool::start(MemoryConnector::new(), settings(1, 1))
            .await
            .unwrap();

        let mut first = pool.acquire().await.unwrap();
        let id = first.id();
        first.handle_mut().unwrap().begin().unwrap();
        first.handle_mut().unwrap().set("k", "v").unwrap();
        pool.release(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), id);
        assert!(second.handle().unwrap().is_auto_commit());
        assert_eq!(second.handle().unwrap().get("k").unwrap(), None);
    }

    #[tokio::test]
    async fn dead_idle_handles_are_replaced() {
        let connector = MemoryConnector::new();
        let pool = ResourcePool::start(connector.clone(), settings(2, 2))
            .await
            .unwrap();

        connector.restart();

        let handle = pool.acquire().await.unwrap();
        assert!(!handle.handle().unwrap().is_closed());
        assert_eq!(connector.opened(), 3);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn dead_checked_out_handles_are_not_reused() {
        let connector = MemoryConnector::new();
        let pool = ResourcePool::start(connector.clone(), settings(1, 1))
            .await
            .unwrap();

        let handle = pool.acquire().await.unwrap();
        connector.restart();
        drop(handle);

        assert_eq!(pool.stats().total, 0);
        let fresh = pool.acquire().await.unwrap();
        assert!(!fresh.handle().unwrap().is_closed());
    }

    #[tokio::test]
    async fn growth_failure_is_recoverable() {
        let pool = ResourcePool::start(MemoryConnector::failing_after(1), settings(1, 2))
            .await
            .unwrap();

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_exhausted());
        assert!(matches!(
            err,
            PoolError::Exhausted(ExhaustedCause::GrowthFailed(_))
        ));
        assert_eq!(pool.stats().opening, 0);
        assert_eq!(pool.permits.available_permits(), 1);

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_fails_fast_and_closes_returns() {
        let pool = ResourcePool::start(MemoryConnector::new(), settings(2, 2))
            .await
            .unwrap();
        let held = pool.acquire().await.unwrap();

        pool.shutdown();
        pool.shutdown();

        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Shutdown);
        drop(held);

        let stats = pool.stats();
        assert!(stats.shut_down);
        assert_eq!(stats.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_growth_is_bounded_by_the_acquire_timeout() {
        let connector = SlowConnector {
            inner: MemoryConnector::new(),
            delay: Duration::from_secs(600),
        };
        let pool = ResourcePool::start(connector, settings(0, 2)).await.unwrap();

        let started = Instant::now();
        let err = pool.acquire().await.unwrap_err();

        assert_eq!(
            err,
            PoolError::Exhausted(ExhaustedCause::Timeout(Duration::from_secs(1)))
        );
        assert!(started.elapsed() <= Duration::from_secs(2));

        let stats = pool.stats();
        assert_eq!(stats.opening, 0);
        assert_eq!(stats.total, 0);
        assert_eq!(pool.permits.available_permits(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_handles_still_checked_out() {
        let connector = MemoryConnector::new();
        let pool = ResourcePool::start(connector.clone(), settings(2, 2))
            .await
            .unwrap();
        let mut held = pool.acquire().await.unwrap();

        pool.shutdown();

        assert!(held.handle().unwrap().is_closed());
        assert_eq!(
            held.handle_mut().unwrap().set("k", "v"),
            Err(StoreError::Closed)
        );
        assert_eq!(pool.stats().in_use, 0);

        drop(held);
        assert_eq!(pool.stats().total, 0);
        assert_eq!(connector.peek("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_leaves_no_trace() {
        let pool = ResourcePool::start(MemoryConnector::new(), settings(1, 1))
            .await
            .unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|h| h.id()) })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.opening, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquirers_never_share_a_handle() {
        let pool = ResourcePool::start(MemoryConnector::new(), settings(2, 4))
            .await
            .unwrap();
        let out: Arc<Mutex<HashSet<HandleId>>> = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let out = out.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let mut handle = pool.acquire().await.unwrap();
                    assert!(out.lock().insert(handle.id()), "handle issued twice");
                    tokio::task::yield_now().await;
                    assert!(out.lock().remove(&handle.id()));
                    handle.release();
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert!(stats.total <= 4);
    }
}
