//! Deferred flush firing: spawns a task that sleeps, then runs, checking an atomic
//! "stopped" flag before it fires rather than unconditionally running into a
//! torn-down session.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fires a single deferred task after `delay`, unless `stop()` was called first.
///
/// Only one-shot `after` firings are needed here — each `apply` that starts a fresh
/// accumulating batch arms its own one-shot timer — so there's no repeating
/// interval/loop, just a spawn-sleep-check-run sequence per call.
#[derive(Clone)]
pub struct Scheduler {
    stopped: Arc<AtomicBool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Schedules `task` to run after `delay`. A no-op if `stop()` was already called,
    /// or is called before the timer fires.
    pub fn after<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            task.await;
        });
    }

    /// Stops future firings. Tasks already past their sleep are not cancelled —
    /// `close()` stops further timer firings but does not cancel outstanding work.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
