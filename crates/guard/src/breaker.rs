use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use amoria_core::config::BreakerSettings;
use amoria_core::scheduler::Scheduler;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` that trip the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing.
    pub recovery_timeout: Duration,
    /// Consecutive successes in `HalfOpen` that close the circuit.
    pub success_threshold: u32,
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: settings.recovery_timeout(),
            success_threshold: settings.success_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E: std::error::Error + 'static> {
    #[error("circuit '{name}' is open, retry in {}ms", retry_after.as_millis())]
    Open { name: String, retry_after: Duration },

    #[error(transparent)]
    Downstream(#[from] E),
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<DateTime<Utc>>,
}

/// Per-dependency circuit breaker. Failure accounting is shared by every
/// call site holding the same instance; get instances through
/// [`BreakerRegistry`] so a dependency name maps to exactly one circuit.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    scheduler: Arc<dyn Scheduler>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            name: name.to_string(),
            config,
            scheduler,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// Run `operation` under the circuit's state machine. While `Open` and
    /// inside the recovery timeout the operation is not invoked at all; the
    /// first call after the timeout probes in `HalfOpen`.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.before_call()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure();
                Err(BreakerError::Downstream(error))
            }
        }
    }

    fn before_call<E: std::error::Error + 'static>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Open {
            return Ok(());
        }

        let elapsed = inner
            .last_failure
            .map(|at| (self.scheduler.now() - at).to_std().unwrap_or_default())
            .unwrap_or(self.config.recovery_timeout);

        if elapsed < self.config.recovery_timeout {
            return Err(BreakerError::Open {
                name: self.name.clone(),
                retry_after: self.config.recovery_timeout - elapsed,
            });
        }

        inner.state = BreakerState::HalfOpen;
        inner.consecutive_successes = 0;
        info!(circuit = %self.name, "circuit half-open, probing");
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = BreakerState::Closed;
                inner.consecutive_successes = 0;
                info!(circuit = %self.name, "circuit closed");
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(self.scheduler.now());

        match inner.state {
            // One failed probe reopens immediately.
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                warn!(circuit = %self.name, "probe failed, circuit reopened");
            }
            BreakerState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.state = BreakerState::Open;
                warn!(
                    circuit = %self.name,
                    failures = inner.consecutive_failures,
                    "failure threshold reached, circuit opened"
                );
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

/// Run `operation` through `breaker`, degrading any failure (open circuit or
/// downstream error) to the `fallback` value when one is supplied. UI-facing
/// read paths use this to return an empty result instead of an error.
pub async fn with_circuit_breaker<T, E, F, Fut, FB>(
    breaker: &CircuitBreaker,
    operation: F,
    fallback: Option<FB>,
) -> Result<T, BreakerError<E>>
where
    E: std::error::Error + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    FB: FnOnce() -> T,
{
    match breaker.execute(operation).await {
        Ok(value) => Ok(value),
        Err(error) => match fallback {
            Some(fallback) => {
                debug!(circuit = %breaker.name(), error = %error, "degrading to fallback");
                Ok(fallback())
            }
            None => Err(error),
        },
    }
}

/// Maps a dependency name to its singleton circuit. First access creates the
/// breaker from the registry defaults; later accesses return the same
/// instance so every call site shares failure accounting.
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    scheduler: Arc<dyn Scheduler>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            defaults,
            scheduler,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.defaults.clone(),
                    self.scheduler.clone(),
                ))
            })
            .clone()
    }
}
