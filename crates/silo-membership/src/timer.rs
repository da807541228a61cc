//! Periodic background tasks with liveness tracking.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::Result;

/// Extra time granted on top of two periods before a timer counts as stuck.
const HEALTH_SLACK: Duration = Duration::from_secs(1);

/// A handler invoked every `period` after an initial delay.
///
/// Runs never overlap: the next tick waits for the previous handler to
/// finish. Handler errors are logged and the ticker keeps going. The task
/// is aborted on [`dispose`](Self::dispose) or drop.
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    started: Instant,
    last_tick: Arc<Mutex<Option<Instant>>>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        mut handler: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let last_tick = Arc::new(Mutex::new(None));
        let ticks = Arc::clone(&last_tick);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                *ticks.lock() = Some(Instant::now());
                if let Err(e) = handler().await {
                    warn!("{name} timer tick failed: {e}");
                }
            }
        });
        debug!("started {name} timer, period {period:?}, first tick after {initial_delay:?}");
        Self {
            name,
            period,
            started: Instant::now(),
            last_tick,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Checks that the timer has ticked recently enough.
    ///
    /// Returns a description of the problem when the last tick (or the
    /// spawn time, before the first tick) is older than two periods.
    pub fn check_health(&self, now: Instant) -> Option<String> {
        if self.handle.is_finished() {
            return Some(format!("{} timer is no longer running", self.name));
        }
        let reference = (*self.last_tick.lock()).unwrap_or(self.started);
        let allowed = self.period * 2 + HEALTH_SLACK;
        let since = now.saturating_duration_since(reference);
        if since > allowed {
            return Some(format!(
                "{} timer has not ticked for {:?} (period {:?})",
                self.name, since, self.period
            ));
        }
        None
    }

    pub fn dispose(&self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
