use std::time::Duration;

use chrono::{DateTime, Utc};

/// A callback run by the scheduler when a timer fires.
pub type Task = Box<dyn FnMut() + Send>;

/// Time source plus delayed/periodic callbacks.
///
/// Every timer in the system (away timer, typing auto-stop, typing
/// receiver expiry, rate-limiter sweep, presence db sync) is armed through
/// this trait so tests can substitute a virtual clock.
pub trait Scheduler: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once after `delay`.
    fn after(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Run `task` every `period`, starting one period from now.
    fn every(&self, period: Duration, task: Task) -> TimerHandle;
}

/// Handle to an armed timer. Cancels on [`TimerHandle::cancel`] and on drop,
/// so replacing a stored handle guarantees at most one outstanding timer per
/// logical slot.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Production scheduler backed by the tokio runtime. Must be used from
/// within a runtime context; timers are spawned tasks and cancellation
/// aborts them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn after(&self, delay: Duration, mut task: Task) -> TimerHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(move || handle.abort())
    }

    fn every(&self, period: Duration, mut task: Task) -> TimerHandle {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the task
            // first runs one full period from arming.
            interval.tick().await;
            loop {
                interval.tick().await;
                task();
            }
        });
        TimerHandle::new(move || handle.abort())
    }
}
