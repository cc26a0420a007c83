use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use amoria_core::config::RateLimitSettings;
use amoria_core::scheduler::{Scheduler, TimerHandle};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            window: settings.window(),
            max_requests: settings.max_requests,
        }
    }
}

/// Outcome of a rate-limit check. Denial is a value, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// When the oldest retained request exits the window.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Retry-after hint for a denied request, zero when allowed.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        if self.allowed {
            Duration::ZERO
        } else {
            (self.reset_at - now).to_std().unwrap_or_default()
        }
    }
}

struct Bucket {
    timestamps: VecDeque<DateTime<Utc>>,
    window: Duration,
}

impl Bucket {
    fn prune(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        while let Some(&oldest) = self.timestamps.front() {
            if now - oldest >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window rate limiter, one bucket per `(identifier, route)`.
/// Buckets prune lazily on each check; a periodic sweep drops fully-expired
/// buckets to bound memory.
pub struct RateLimiter {
    scheduler: Arc<dyn Scheduler>,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record one request for `identifier` on `route`. The route's
    /// limits come from the caller, so strict and loose route classes share
    /// one limiter.
    pub fn try_acquire(
        &self,
        identifier: &str,
        route: &str,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        let now = self.scheduler.now();
        let window = chrono::Duration::from_std(config.window).unwrap_or(chrono::Duration::MAX);

        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry((identifier.to_string(), route.to_string()))
            .or_insert_with(|| Bucket {
                timestamps: VecDeque::new(),
                window: config.window,
            });
        bucket.window = config.window;
        bucket.prune(now);

        let count = bucket.timestamps.len() as u32;
        if count < config.max_requests {
            bucket.timestamps.push_back(now);
            let oldest = *bucket.timestamps.front().unwrap_or(&now);
            RateLimitDecision {
                allowed: true,
                remaining: config.max_requests - (count + 1),
                reset_at: oldest + window,
            }
        } else {
            let oldest = *bucket.timestamps.front().unwrap_or(&now);
            let decision = RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: oldest + window,
            };
            debug!(
                identifier,
                route,
                reset_at = %decision.reset_at,
                "rate limit exceeded"
            );
            decision
        }
    }

    /// Arm the periodic bucket sweep. The interval is independent of any
    /// route's window; dropping the returned handle stops the sweep.
    pub fn start_sweep(self: &Arc<Self>, interval: Duration) -> TimerHandle {
        let limiter = Arc::downgrade(self);
        self.scheduler.every(
            interval,
            Box::new(move || {
                if let Some(limiter) = limiter.upgrade() {
                    limiter.sweep();
                }
            }),
        )
    }

    fn sweep(&self) {
        let now = self.scheduler.now();
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.prune(now);
            !bucket.timestamps.is_empty()
        });
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, retained = buckets.len(), "swept expired rate-limit buckets");
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}
