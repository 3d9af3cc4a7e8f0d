use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use super::admission::AdmissionController;
use super::session::SessionRegistry;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const MIN_PERIOD: Duration = Duration::from_millis(10);

// -----------------------------------------------------------------------------
// ----- Janitor ---------------------------------------------------------------

/// Periodic maintenance task: sweeps expired sessions and forgets idle
/// admission state. Runs until `stop()` is called or the handle is dropped.
#[derive(Debug)]
pub struct Janitor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Janitor {
    pub fn spawn(
        sessions: Arc<SessionRegistry>,
        admission: Arc<AdmissionController>,
        period: Duration,
    ) -> Self {
        let period = period.max(MIN_PERIOD);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(sessions, admission, period, shutdown_rx));
        info!(period = ?period, "janitor started");

        Self { shutdown, task }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);

        if let Err(err) = self.task.await {
            warn!("janitor task ended abnormally: {err}");
        }
        info!("janitor stopped");
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Task --------------------------------------------------------

async fn run(
    sessions: Arc<SessionRegistry>,
    admission: Arc<AdmissionController>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                // A dropped sender means nobody can stop us anymore; stop now.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let expired = sessions.sweep();
                let forgotten = admission.cleanup();
                debug!(expired, forgotten, "janitor pass complete");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
