use std::sync::atomic::{AtomicU64, Ordering};

// -----------------------------------------------------------------------------
// ----- Analytics -------------------------------------------------------------

/// Request counters for one gateway. Relaxed atomics: the numbers are for
/// reporting, nothing synchronizes on them.
#[derive(Debug, Default)]
pub struct Analytics {
    requests: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    auth_failures: AtomicU64,
    pool_exhausted: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnalyticsSnapshot {
    pub requests: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub auth_failures: u64,
    pub pool_exhausted: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

impl AnalyticsSnapshot {
    pub fn active_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}

impl Analytics {
    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_auth_failures(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }
}
