use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const SECOND_WINDOW: Duration = Duration::from_secs(1);
const MINUTE_WINDOW: Duration = Duration::from_secs(60);

pub const DEFAULT_PER_SECOND: u32 = 10;
pub const DEFAULT_PER_MINUTE: u32 = 60;
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(5 * 60);

// -----------------------------------------------------------------------------
// ----- AdmissionSettings -----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub per_second: u32,
    pub per_minute: u32,

    /// Per-client state untouched for longer than this is dropped by `cleanup`.
    pub idle_grace: Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            per_second: DEFAULT_PER_SECOND,
            per_minute: DEFAULT_PER_MINUTE,
            idle_grace: DEFAULT_IDLE_GRACE,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- AdmissionController ---------------------------------------------------

/// Per-client request throttle built from two fixed windows (one second, one
/// minute). Windows are anchored at the client's first request and advance in
/// whole multiples of their length, so each elapsed window resets its counter
/// exactly once.
#[derive(Debug)]
pub struct AdmissionController {
    settings: AdmissionSettings,
    clients: Mutex<HashMap<String, AdmissionState>>,
}

#[derive(Debug, Clone)]
struct AdmissionState {
    second: FixedWindow,
    minute: FixedWindow,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
struct FixedWindow {
    started_at: Instant,
    count: u32,
}

impl FixedWindow {
    fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            count: 0,
        }
    }

    fn roll(&mut self, now: Instant, length: Duration) {
        let elapsed = now.saturating_duration_since(self.started_at);
        if elapsed < length {
            return;
        }

        let into_current = elapsed.as_nanos() % length.as_nanos();
        let into_current = Duration::from_nanos(into_current as u64);
        self.started_at = now.checked_sub(into_current).unwrap_or(now);
        self.count = 0;
    }
}

impl AdmissionState {
    fn new(now: Instant) -> Self {
        Self {
            second: FixedWindow::new(now),
            minute: FixedWindow::new(now),
            last_seen: now,
        }
    }

    fn admit(&mut self, now: Instant, settings: &AdmissionSettings) -> bool {
        self.last_seen = now;
        self.second.roll(now, SECOND_WINDOW);
        self.minute.roll(now, MINUTE_WINDOW);

        if self.second.count >= settings.per_second || self.minute.count >= settings.per_minute {
            return false;
        }

        self.second.count += 1;
        self.minute.count += 1;
        true
    }
}

// -----------------------------------------------------------------------------
// ----- AdmissionController: Static -------------------------------------------

impl AdmissionController {
    pub fn new(settings: AdmissionSettings) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- AdmissionController: Public -------------------------------------------

impl AdmissionController {
    pub fn settings(&self) -> AdmissionSettings {
        self.settings
    }

    pub fn is_allowed(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock();

        let allowed = match clients.get_mut(client_id) {
            Some(state) => state.admit(now, &self.settings),
            None => {
                let mut state = AdmissionState::new(now);
                let allowed = state.admit(now, &self.settings);
                clients.insert(client_id.to_string(), state);
                allowed
            }
        };
        drop(clients);

        if !allowed {
            debug!(client = client_id, "request rejected by admission control");
        }
        allowed
    }

    /// Forgets clients that have been quiet for longer than the grace period.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let grace = self.settings.idle_grace;

        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, state| now.saturating_duration_since(state.last_seen) <= grace);
        let removed = before - clients.len();
        drop(clients);

        if removed > 0 {
            info!(removed, "dropped idle admission state");
        }
        removed
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn controller() -> AdmissionController {
        AdmissionController::new(AdmissionSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn eleventh_request_in_a_second_is_rejected() {
        let admission = controller();

        for _ in 0..10 {
            assert!(admission.is_allowed("10.0.0.1:555"));
        }
        assert!(!admission.is_allowed("10.0.0.1:555"));

        advance(Duration::from_millis(1_000)).await;
        assert!(admission.is_allowed("10.0.0.1:555"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_do_not_consume_quota() {
        let admission = controller();

        for _ in 0..10 {
            assert!(admission.is_allowed("a"));
        }
        for _ in 0..25 {
            assert!(!admission.is_allowed("a"));
        }

        advance(Duration::from_secs(1)).await;
        let admitted = (0..15).filter(|_| admission.is_allowed("a")).count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn minute_cap_applies_across_seconds() {
        let admission = controller();

        let mut admitted = 0;
        for _ in 0..10 {
            admitted += (0..10).filter(|_| admission.is_allowed("b")).count();
            advance(Duration::from_secs(1)).await;
        }
        assert_eq!(admitted, 60);

        advance(Duration::from_secs(50)).await;
        assert!(admission.is_allowed("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn windows_stay_on_their_grid() {
        let admission = controller();

        assert!(admission.is_allowed("c"));
        advance(Duration::from_millis(2_500)).await;

        // Window now runs from t=2.0s to t=3.0s.
        for _ in 0..10 {
            assert!(admission.is_allowed("c"));
        }
        assert!(!admission.is_allowed("c"));

        advance(Duration::from_millis(500)).await;
        assert!(admission.is_allowed("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_independent() {
        let admission = controller();

        for _ in 0..10 {
            assert!(admission.is_allowed("x"));
        }
        assert!(!admission.is_allowed("x"));
        assert!(admission.is_allowed("y"));
        assert_eq!(admission.tracked_clients(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_quiet_clients_only() {
        let admission = controller();
        admission.is_allowed("quiet");
        advance(Duration::from_secs(4 * 60)).await;
        admission.is_allowed("busy");
        advance(Duration::from_secs(61 + 60)).await;

        assert_eq!(admission.cleanup(), 1);
        assert_eq!(admission.tracked_clients(), 1);
        assert_eq!(admission.cleanup(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_budget() {
        let admission = std::sync::Arc::new(AdmissionController::new(AdmissionSettings {
            per_second: 1_000,
            per_minute: 50,
            idle_grace: DEFAULT_IDLE_GRACE,
        }));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let admission = admission.clone();
            tasks.push(tokio::spawn(async move {
                (0..20).filter(|_| admission.is_allowed("shared")).count()
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            admitted += task.await.unwrap();
        }
        assert_eq!(admitted, 50);
    }
}
