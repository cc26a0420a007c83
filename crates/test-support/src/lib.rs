//! Deterministic test doubles: a hand-cranked scheduler and a store wrapper
//! that injects failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use amoria_core::scheduler::{Scheduler, Task, TimerHandle};
use amoria_storage::{Filter, Store, StoreError};

struct ScheduledTask {
    task: Arc<Mutex<Task>>,
    period: Option<Duration>,
}

struct ManualInner {
    now: DateTime<Utc>,
    next_id: u64,
    // Keyed by (fire time, arming order) so simultaneous timers run in the
    // order they were armed.
    timers: BTreeMap<(DateTime<Utc>, u64), ScheduledTask>,
}

/// Scheduler with a virtual clock. Time only moves when a test calls
/// [`ManualScheduler::advance`], which runs every due task in fire-time
/// order, re-arming periodic ones.
#[derive(Clone)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualInner>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        // An arbitrary fixed epoch; tests reason in offsets from it.
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Self::starting_at(start)
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualInner {
                now,
                next_id: 0,
                timers: BTreeMap::new(),
            })),
        }
    }

    /// Move the clock forward, firing every timer due within `delta`. Tasks
    /// run outside the internal lock, so they may arm or cancel timers.
    pub fn advance(&self, delta: Duration) {
        let target = {
            let inner = self.inner.lock().unwrap();
            inner.now + chrono::Duration::from_std(delta).unwrap()
        };

        loop {
            let due = {
                let mut inner = self.inner.lock().unwrap();
                match inner.timers.keys().next().copied() {
                    Some(key) if key.0 <= target => {
                        let entry = inner.timers.remove(&key).unwrap();
                        inner.now = key.0;
                        if let Some(period) = entry.period {
                            let next_fire = key.0 + chrono::Duration::from_std(period).unwrap();
                            inner.timers.insert(
                                (next_fire, key.1),
                                ScheduledTask {
                                    task: entry.task.clone(),
                                    period: entry.period,
                                },
                            );
                        }
                        Some(entry.task)
                    }
                    _ => None,
                }
            };

            match due {
                Some(task) => (task.lock().unwrap())(),
                None => break,
            }
        }

        self.inner.lock().unwrap().now = target;
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.lock().unwrap().timers.len()
    }

    fn arm(&self, delay: Duration, task: Task, period: Option<Duration>) -> TimerHandle {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            let fire_at = inner.now + chrono::Duration::from_std(delay).unwrap();
            inner.timers.insert(
                (fire_at, id),
                ScheduledTask {
                    task: Arc::new(Mutex::new(task)),
                    period,
                },
            );
            id
        };

        let inner = self.inner.clone();
        TimerHandle::new(move || {
            let mut inner = inner.lock().unwrap();
            inner.timers.retain(|&(_, timer_id), _| timer_id != id);
        })
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().now
    }

    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        self.arm(delay, task, None)
    }

    fn every(&self, period: Duration, task: Task) -> TimerHandle {
        self.arm(period, task, Some(period))
    }
}

/// Store wrapper that fails the next `n` calls with
/// [`StoreError::Unavailable`], then delegates. Used to drive circuit
/// breakers through their failure thresholds.
pub struct FlakyStore<S> {
    inner: S,
    remaining_failures: AtomicU32,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S, failures: u32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(failures),
        }
    }

    /// Re-arm the failure counter.
    pub fn fail_next(&self, failures: u32) {
        self.remaining_failures.store(failures, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        let took_one = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took_one {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl<S: Store> Store for FlakyStore<S> {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        self.check()?;
        self.inner.insert(table, row).await
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        self.check()?;
        self.inner.select(table, filter).await
    }

    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        patch: Value,
    ) -> Result<Vec<Value>, StoreError> {
        self.check()?;
        self.inner.update(table, filter, patch).await
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError> {
        self.check()?;
        self.inner.rpc(name, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amoria_storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn advance_fires_due_timers_in_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay_ms) in [("b", 200u64), ("a", 100)] {
            let order = order.clone();
            // Handles leak intentionally; dropping them would cancel.
            std::mem::forget(scheduler.after(
                Duration::from_millis(delay_ms),
                Box::new(move || order.lock().unwrap().push(label)),
            ));
        }

        scheduler.advance(Duration::from_millis(50));
        assert!(order.lock().unwrap().is_empty());

        scheduler.advance(Duration::from_millis(200));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let handle = scheduler.after(
            Duration::from_millis(100),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();

        scheduler.advance(Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn periodic_timer_reschedules_until_dropped() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let handle = scheduler.every(
            Duration::from_secs(1),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        scheduler.advance(Duration::from_millis(3500));
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        drop(handle);
        scheduler.advance(Duration::from_secs(5));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn tasks_may_arm_new_timers_while_firing() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_fired = fired.clone();
        let rearm_scheduler = scheduler.clone();
        std::mem::forget(scheduler.after(
            Duration::from_millis(100),
            Box::new(move || {
                let inner_fired = inner_fired.clone();
                std::mem::forget(rearm_scheduler.after(
                    Duration::from_millis(100),
                    Box::new(move || {
                        inner_fired.fetch_add(1, Ordering::SeqCst);
                    }),
                ));
            }),
        ));

        scheduler.advance(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flaky_store_fails_then_recovers() {
        let store = FlakyStore::new(MemoryStore::new(), 2);

        for _ in 0..2 {
            let result = store.insert("messages", json!({"id": "m1"})).await;
            assert!(matches!(result, Err(StoreError::Unavailable(_))));
        }

        store
            .insert(
                "messages",
                json!({
                    "id": "m1",
                    "conversation_id": "c1",
                    "sender_id": "alice",
                }),
            )
            .await
            .unwrap();
    }
}
