//! Presence tracking: one locally authoritative record for the current
//! user, plus an observed map of everyone else's presence aggregated from
//! the event bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use amoria_core::config::PresenceSettings;
use amoria_core::event::{
    Channel, Event, EventBus, EventPayload, EventSource, PresenceRecord, PresenceStatus,
};
use amoria_core::scheduler::{Scheduler, TimerHandle};
use amoria_core::EventBusError;
use amoria_guard::{with_circuit_breaker, BreakerError, CircuitBreaker};
use amoria_storage::{Filter, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error(transparent)]
    Bus(#[from] EventBusError),

    #[error(transparent)]
    Store(#[from] BreakerError<StoreError>),
}

/// Internal commands from timer callbacks into the run loop. Timer tasks
/// are synchronous, so durable writes they trigger are queued here and
/// awaited by [`PresenceTracker::run`].
enum Command {
    WentAway,
    Persist,
}

struct LocalState {
    status: PresenceStatus,
    last_seen: DateTime<Utc>,
    started: bool,
    stopped: bool,
    away_timer: Option<TimerHandle>,
    sync_timer: Option<TimerHandle>,
}

/// Tracks presence for one local user and aggregates presence events for
/// everyone else.
///
/// Spawn [`PresenceTracker::run`] before calling [`PresenceTracker::start`];
/// the run loop owns every durable write, so without it persistence (but
/// not realtime publishing) silently stalls.
pub struct PresenceTracker<S: Store> {
    user_id: String,
    store: Arc<S>,
    bus: Arc<dyn EventBus>,
    breaker: Arc<CircuitBreaker>,
    scheduler: Arc<dyn Scheduler>,
    settings: PresenceSettings,
    state: Mutex<LocalState>,
    observed: RwLock<HashMap<String, PresenceRecord>>,
    commands: UnboundedSender<Command>,
    command_receiver: Mutex<Option<UnboundedReceiver<Command>>>,
}

impl<S: Store> PresenceTracker<S> {
    pub fn new(
        user_id: &str,
        store: Arc<S>,
        bus: Arc<dyn EventBus>,
        breaker: Arc<CircuitBreaker>,
        scheduler: Arc<dyn Scheduler>,
        settings: PresenceSettings,
    ) -> Self {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let now = scheduler.now();
        Self {
            user_id: user_id.to_string(),
            store,
            bus,
            breaker,
            scheduler,
            settings,
            state: Mutex::new(LocalState {
                status: PresenceStatus::Offline,
                last_seen: now,
                started: false,
                stopped: false,
                away_timer: None,
                sync_timer: None,
            }),
            observed: RwLock::new(HashMap::new()),
            commands,
            command_receiver: Mutex::new(Some(command_receiver)),
        }
    }

    /// Go online: publish the joined record, queue a best-effort persist,
    /// and arm the away and db-sync timers.
    pub fn start(&self) -> Result<(), PresenceError> {
        let now = self.scheduler.now();
        {
            let mut state = self.state.lock().unwrap();
            state.status = PresenceStatus::Online;
            state.last_seen = now;
            state.started = true;
            state.stopped = false;
            state.sync_timer = Some(self.arm_sync_timer());
            state.away_timer = Some(self.arm_away_timer());
        }

        self.publish_joined(PresenceStatus::Online, now)?;
        let _ = self.commands.send(Command::Persist);
        info!(user = %self.user_id, "presence started");
        Ok(())
    }

    /// Qualifying local activity. Re-arms the single away timer; if the
    /// user had gone away, republishes online immediately.
    pub fn record_activity(&self) -> Result<(), PresenceError> {
        let now = self.scheduler.now();
        let was_away = {
            let mut state = self.state.lock().unwrap();
            if !state.started || state.stopped {
                return Ok(());
            }
            // Replacing the handle cancels the previous timer, so at most
            // one away timer is ever outstanding.
            state.away_timer = Some(self.arm_away_timer());
            state.last_seen = now;
            let was_away = state.status == PresenceStatus::Away;
            if was_away {
                state.status = PresenceStatus::Online;
            }
            was_away
        };

        if was_away {
            debug!(user = %self.user_id, "activity while away, back online");
            self.publish_joined(PresenceStatus::Online, now)?;
            let _ = self.commands.send(Command::Persist);
        }
        Ok(())
    }

    /// Explicit status change; publishes and queues a persist.
    pub fn update_status(&self, status: PresenceStatus) -> Result<(), PresenceError> {
        let now = self.scheduler.now();
        {
            let mut state = self.state.lock().unwrap();
            if !state.started || state.stopped {
                return Ok(());
            }
            state.status = status;
            state.last_seen = now;
            if status == PresenceStatus::Online {
                state.away_timer = Some(self.arm_away_timer());
            }
        }

        self.publish_joined(status, now)?;
        let _ = self.commands.send(Command::Persist);
        Ok(())
    }

    /// Go offline. Idempotent; cancels both timers and publishes the leave
    /// before anything else can fail. Also runs on drop so abnormal
    /// teardown still emits offline.
    pub fn stop(&self) -> Result<(), PresenceError> {
        let now = self.scheduler.now();
        {
            let mut state = self.state.lock().unwrap();
            if !state.started || state.stopped {
                return Ok(());
            }
            state.stopped = true;
            state.status = PresenceStatus::Offline;
            state.last_seen = now;
            state.away_timer = None;
            state.sync_timer = None;
        }

        let event = Event::new(
            Channel::new("presence.left")?,
            EventSource::User(self.user_id.clone()),
            EventPayload::PresenceLeft {
                user_id: self.user_id.clone(),
                last_seen: now,
            },
        );
        self.bus.publish(event)?;
        self.apply_observed(PresenceRecord::offline(&self.user_id, now));
        let _ = self.commands.send(Command::Persist);
        info!(user = %self.user_id, "presence stopped");
        Ok(())
    }

    /// Last observed presence for any user; never-seen users read as
    /// offline.
    pub fn presence_of(&self, user_id: &str) -> PresenceRecord {
        self.observed
            .read()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| PresenceRecord::offline(user_id, DateTime::UNIX_EPOCH))
    }

    /// Every record currently observed, the local user's included.
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.observed.read().unwrap().values().cloned().collect()
    }

    /// Backfill the observed map from the store, e.g. after a reconnect.
    /// Degrades to no-op when the store breaker is open.
    pub async fn load_persisted(&self, user_ids: &[&str]) {
        for user_id in user_ids {
            let filter = Filter::new().eq("user_id", *user_id);
            let rows = with_circuit_breaker(
                &self.breaker,
                || async { self.store.select("presence_status", &filter).await },
                Some(Vec::new),
            )
            .await
            .unwrap_or_default();

            for row in rows {
                match parse_record(&row) {
                    Ok(record) => self.apply_observed(record),
                    Err(error) => warn!(user = %user_id, %error, "skipping persisted presence row"),
                }
            }
        }
    }

    /// Consume presence and transport-health events, and execute the
    /// durable writes queued by the synchronous API.
    pub async fn run(self: Arc<Self>) -> Result<(), PresenceError> {
        let Some(mut commands) = self.command_receiver.lock().unwrap().take() else {
            warn!(user = %self.user_id, "presence run loop already taken");
            return Ok(());
        };
        let mut subscription = self.bus.subscribe("{presence,system}.**")?;

        loop {
            tokio::select! {
                received = subscription.recv() => match received {
                    Ok(event) => self.handle_event(event),
                    Err(EventBusError::Lagged(count)) => {
                        warn!(user = %self.user_id, count, "presence subscription lagged");
                    }
                    Err(EventBusError::ChannelClosed) => {
                        debug!(user = %self.user_id, "event bus closed, presence loop exiting");
                        break;
                    }
                    Err(error) => {
                        warn!(user = %self.user_id, %error, "presence subscription error");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::WentAway) => self.handle_away_fired().await,
                    Some(Command::Persist) => self.persist_status().await,
                    None => break,
                },
            }
        }
        Ok(())
    }

    fn handle_event(&self, event: Event) {
        match event.payload {
            EventPayload::PresenceSnapshot { records } => {
                for record in records {
                    self.apply_observed(record);
                }
            }
            EventPayload::PresenceJoined { record } => self.apply_observed(record),
            EventPayload::PresenceLeft { user_id, last_seen } => {
                self.apply_observed(PresenceRecord::offline(&user_id, last_seen));
            }
            EventPayload::ConnectionLost { reason } => {
                warn!(user = %self.user_id, %reason, "transport lost, resolving observed presence to offline");
                let now = self.scheduler.now();
                let mut observed = self.observed.write().unwrap();
                for record in observed.values_mut() {
                    record.status = PresenceStatus::Offline;
                    record.last_seen = now;
                }
            }
            EventPayload::ConnectionRestored => {
                debug!(user = %self.user_id, "transport restored");
            }
            _ => {}
        }
    }

    /// Last write wins on `last_seen`: a stale join never overrides a
    /// fresher leave.
    fn apply_observed(&self, record: PresenceRecord) {
        let mut observed = self.observed.write().unwrap();
        match observed.get(&record.user_id) {
            Some(existing) if existing.last_seen > record.last_seen => {}
            _ => {
                observed.insert(record.user_id.clone(), record);
            }
        }
    }

    async fn handle_away_fired(&self) {
        let now = self.scheduler.now();
        let transitioned = {
            let mut state = self.state.lock().unwrap();
            if state.stopped || state.status != PresenceStatus::Online {
                false
            } else {
                state.status = PresenceStatus::Away;
                state.last_seen = now;
                true
            }
        };

        if transitioned {
            debug!(user = %self.user_id, "inactivity timeout, now away");
            if let Err(error) = self.publish_joined(PresenceStatus::Away, now) {
                warn!(user = %self.user_id, %error, "failed to publish away transition");
            }
            self.persist_status().await;
        }
    }

    async fn persist_status(&self) {
        let (status, last_seen) = {
            let state = self.state.lock().unwrap();
            (state.status, state.last_seen)
        };
        let row = json!({
            "user_id": self.user_id,
            "status": status,
            "last_seen": last_seen,
        });
        let filter = Filter::new().eq("user_id", self.user_id.as_str());

        let result = self
            .breaker
            .execute(|| async {
                let updated = self
                    .store
                    .update("presence_status", &filter, row.clone())
                    .await?;
                if updated.is_empty() {
                    self.store.insert("presence_status", row.clone()).await?;
                }
                Ok::<(), StoreError>(())
            })
            .await;

        if let Err(error) = result {
            warn!(user = %self.user_id, %error, "presence persist failed");
        }
    }

    fn publish_joined(
        &self,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<(), PresenceError> {
        let record = PresenceRecord {
            user_id: self.user_id.clone(),
            status,
            last_seen,
        };
        let event = Event::new(
            Channel::new("presence.joined")?,
            EventSource::User(self.user_id.clone()),
            EventPayload::PresenceJoined {
                record: record.clone(),
            },
        );
        self.bus.publish(event)?;
        // The local record is authoritative; reflect it in the observed map
        // without waiting for the event to come back around.
        self.apply_observed(record);
        Ok(())
    }

    fn arm_away_timer(&self) -> TimerHandle {
        let commands = self.commands.clone();
        self.scheduler.after(
            self.settings.away_timeout(),
            Box::new(move || {
                let _ = commands.send(Command::WentAway);
            }),
        )
    }

    fn arm_sync_timer(&self) -> TimerHandle {
        let commands = self.commands.clone();
        self.scheduler.every(
            self.settings.db_sync_interval(),
            Box::new(move || {
                let _ = commands.send(Command::Persist);
            }),
        )
    }
}

impl<S: Store> Drop for PresenceTracker<S> {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            warn!(user = %self.user_id, %error, "failed to publish offline on teardown");
        }
    }
}

/// Store rows use snake_case column names, so the record is assembled
/// field by field rather than deserialized wholesale.
fn parse_record(row: &serde_json::Value) -> Result<PresenceRecord, StoreError> {
    let field = |name: &str| {
        row.get(name)
            .cloned()
            .ok_or_else(|| StoreError::BadRow(format!("missing column '{name}'")))
    };
    let user_id = field("user_id")?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| StoreError::BadRow("user_id is not a string".to_string()))?;
    let status: PresenceStatus = serde_json::from_value(field("status")?)
        .map_err(|error| StoreError::BadRow(format!("bad status: {error}")))?;
    let last_seen: DateTime<Utc> = serde_json::from_value(field("last_seen")?)
        .map_err(|error| StoreError::BadRow(format!("bad last_seen: {error}")))?;

    Ok(PresenceRecord {
        user_id,
        status,
        last_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use amoria_core::event::BroadcastEventBus;
    use amoria_guard::BreakerConfig;
    use amoria_storage::MemoryStore;
    use amoria_test_support::{FlakyStore, ManualScheduler};

    struct Fixture {
        tracker: Arc<PresenceTracker<MemoryStore>>,
        bus: Arc<BroadcastEventBus>,
        scheduler: ManualScheduler,
        store: Arc<MemoryStore>,
    }

    fn settings() -> PresenceSettings {
        PresenceSettings {
            away_timeout_ms: 300_000,
            db_sync_interval_ms: 60_000,
        }
    }

    async fn fixture(user_id: &str) -> Fixture {
        let scheduler = ManualScheduler::new();
        let bus = Arc::new(BroadcastEventBus::default());
        let store = Arc::new(MemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            "store",
            BreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(30),
                success_threshold: 2,
            },
            Arc::new(scheduler.clone()),
        ));
        let tracker = Arc::new(PresenceTracker::new(
            user_id,
            store.clone(),
            bus.clone(),
            breaker,
            Arc::new(scheduler.clone()),
            settings(),
        ));
        tokio::spawn(tracker.clone().run());
        // Let the run loop subscribe before the test publishes anything.
        settle().await;
        Fixture {
            tracker,
            bus,
            scheduler,
            store,
        }
    }

    async fn settle() {
        // Let the run loop drain queued commands and bus events.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn joined(user_id: &str, status: PresenceStatus, last_seen: DateTime<Utc>) -> Event {
        Event::new(
            Channel::new("presence.joined").unwrap(),
            EventSource::User(user_id.to_string()),
            EventPayload::PresenceJoined {
                record: PresenceRecord {
                    user_id: user_id.to_string(),
                    status,
                    last_seen,
                },
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_publishes_online_and_persists() {
        let fx = fixture("alice").await;
        let mut subscription = fx.bus.subscribe("presence.**").unwrap();

        fx.tracker.start().unwrap();
        settle().await;

        let event = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::PresenceJoined { ref record }
                if record.user_id == "alice" && record.status == PresenceStatus::Online
        ));

        let rows = fx
            .store
            .select("presence_status", &Filter::new().eq("user_id", "alice"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "online");
    }

    #[tokio::test(start_paused = true)]
    async fn away_timer_fires_exactly_once() {
        let fx = fixture("alice").await;
        fx.tracker.start().unwrap();
        settle().await;

        fx.scheduler.advance(Duration::from_secs(300));
        settle().await;
        assert_eq!(
            fx.tracker.presence_of("alice").status,
            PresenceStatus::Away
        );

        // No further transition without activity.
        fx.scheduler.advance(Duration::from_secs(300));
        settle().await;
        assert_eq!(
            fx.tracker.presence_of("alice").status,
            PresenceStatus::Away
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activity_rearms_the_away_timer() {
        let fx = fixture("alice").await;
        fx.tracker.start().unwrap();
        settle().await;

        fx.scheduler.advance(Duration::from_secs(200));
        fx.tracker.record_activity().unwrap();
        fx.scheduler.advance(Duration::from_secs(200));
        settle().await;
        assert_eq!(
            fx.tracker.presence_of("alice").status,
            PresenceStatus::Online
        );

        fx.scheduler.advance(Duration::from_secs(100));
        settle().await;
        assert_eq!(
            fx.tracker.presence_of("alice").status,
            PresenceStatus::Away
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activity_while_away_republishes_online() {
        let fx = fixture("alice").await;
        fx.tracker.start().unwrap();
        settle().await;
        fx.scheduler.advance(Duration::from_secs(300));
        settle().await;
        assert_eq!(fx.tracker.presence_of("alice").status, PresenceStatus::Away);

        fx.tracker.record_activity().unwrap();
        settle().await;
        assert_eq!(
            fx.tracker.presence_of("alice").status,
            PresenceStatus::Online
        );
    }

    #[tokio::test(start_paused = true)]
    async fn update_status_publishes_and_persists() {
        let fx = fixture("alice").await;
        fx.tracker.start().unwrap();
        settle().await;

        fx.tracker.update_status(PresenceStatus::Away).unwrap();
        settle().await;
        assert_eq!(fx.tracker.presence_of("alice").status, PresenceStatus::Away);

        let rows = fx
            .store
            .select("presence_status", &Filter::new().eq("user_id", "alice"))
            .await
            .unwrap();
        assert_eq!(rows[0]["status"], "away");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_publishes_left_once_and_persists_offline() {
        let fx = fixture("alice").await;
        fx.tracker.start().unwrap();
        settle().await;

        let mut subscription = fx.bus.subscribe("presence.left").unwrap();
        fx.tracker.stop().unwrap();
        fx.tracker.stop().unwrap();
        settle().await;

        let event = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.payload, EventPayload::PresenceLeft { ref user_id, .. } if user_id == "alice"));
        let second = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
        assert!(second.is_err(), "stop must be idempotent");

        let rows = fx
            .store
            .select("presence_status", &Filter::new().eq("user_id", "alice"))
            .await
            .unwrap();
        assert_eq!(rows[0]["status"], "offline");
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_tracker_fires_no_away_transition() {
        let fx = fixture("alice").await;
        let mut subscription = fx.bus.subscribe("presence.**").unwrap();
        fx.tracker.start().unwrap();
        fx.tracker.stop().unwrap();
        settle().await;

        // Drain the join and leave events.
        subscription.recv().await.unwrap();
        subscription.recv().await.unwrap();

        fx.scheduler.advance(Duration::from_secs(600));
        settle().await;
        let next = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
        assert!(next.is_err(), "no events after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_join_never_overrides_fresher_leave() {
        let fx = fixture("alice").await;
        let now = fx.scheduler.now();

        fx.bus
            .publish(Event::new(
                Channel::new("presence.left").unwrap(),
                EventSource::User("bob".to_string()),
                EventPayload::PresenceLeft {
                    user_id: "bob".to_string(),
                    last_seen: now,
                },
            ))
            .unwrap();
        settle().await;

        // A join that was delayed in flight carries an older timestamp.
        fx.bus
            .publish(joined(
                "bob",
                PresenceStatus::Online,
                now - chrono::Duration::seconds(5),
            ))
            .unwrap();
        settle().await;

        assert_eq!(fx.tracker.presence_of("bob").status, PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_merges_and_left_keeps_record() {
        let fx = fixture("alice").await;
        let now = fx.scheduler.now();

        fx.bus
            .publish(Event::new(
                Channel::new("presence.snapshot").unwrap(),
                EventSource::System("transport".to_string()),
                EventPayload::PresenceSnapshot {
                    records: vec![
                        PresenceRecord {
                            user_id: "bob".to_string(),
                            status: PresenceStatus::Online,
                            last_seen: now,
                        },
                        PresenceRecord {
                            user_id: "carol".to_string(),
                            status: PresenceStatus::Away,
                            last_seen: now,
                        },
                    ],
                },
            ))
            .unwrap();
        settle().await;
        assert_eq!(fx.tracker.snapshot().len(), 2);

        fx.bus
            .publish(Event::new(
                Channel::new("presence.left").unwrap(),
                EventSource::User("bob".to_string()),
                EventPayload::PresenceLeft {
                    user_id: "bob".to_string(),
                    last_seen: now + chrono::Duration::seconds(1),
                },
            ))
            .unwrap();
        settle().await;

        let bob = fx.tracker.presence_of("bob");
        assert_eq!(bob.status, PresenceStatus::Offline);
        assert_eq!(fx.tracker.snapshot().len(), 2, "left keeps last-known-good record");
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_resolves_observed_to_offline() {
        let fx = fixture("alice").await;
        let now = fx.scheduler.now();
        fx.bus
            .publish(joined("bob", PresenceStatus::Online, now))
            .unwrap();
        settle().await;
        assert_eq!(fx.tracker.presence_of("bob").status, PresenceStatus::Online);

        fx.bus
            .publish(Event::new(
                Channel::new("system.transport").unwrap(),
                EventSource::System("transport".to_string()),
                EventPayload::ConnectionLost {
                    reason: "socket reset".to_string(),
                },
            ))
            .unwrap();
        settle().await;
        assert_eq!(fx.tracker.presence_of("bob").status, PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_user_reads_offline() {
        let fx = fixture("alice").await;
        assert_eq!(
            fx.tracker.presence_of("stranger").status,
            PresenceStatus::Offline
        );
    }

    #[tokio::test(start_paused = true)]
    async fn load_persisted_backfills_observed_map() {
        let fx = fixture("alice").await;
        fx.store
            .insert(
                "presence_status",
                json!({
                    "user_id": "bob",
                    "status": "away",
                    "last_seen": "2026-01-01T00:00:00Z",
                }),
            )
            .await
            .unwrap();

        fx.tracker.load_persisted(&["bob", "nobody"]).await;
        assert_eq!(fx.tracker.presence_of("bob").status, PresenceStatus::Away);
        assert_eq!(
            fx.tracker.presence_of("nobody").status,
            PresenceStatus::Offline
        );
    }

    #[tokio::test(start_paused = true)]
    async fn load_persisted_degrades_when_store_is_down() {
        let scheduler = ManualScheduler::new();
        let bus: Arc<BroadcastEventBus> = Arc::new(BroadcastEventBus::default());
        let store = Arc::new(FlakyStore::new(MemoryStore::new(), u32::MAX));
        let breaker = Arc::new(CircuitBreaker::new(
            "store",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(30),
                success_threshold: 1,
            },
            Arc::new(scheduler.clone()),
        ));
        let tracker = Arc::new(PresenceTracker::new(
            "alice",
            store,
            bus,
            breaker,
            Arc::new(scheduler),
            settings(),
        ));

        tracker.load_persisted(&["bob"]).await;
        assert_eq!(tracker.presence_of("bob").status, PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_failure_does_not_block_publish() {
        let scheduler = ManualScheduler::new();
        let bus = Arc::new(BroadcastEventBus::default());
        let store = Arc::new(FlakyStore::new(MemoryStore::new(), u32::MAX));
        let breaker = Arc::new(CircuitBreaker::new(
            "store",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(30),
                success_threshold: 1,
            },
            Arc::new(scheduler.clone()),
        ));
        let tracker = Arc::new(PresenceTracker::new(
            "alice",
            store,
            bus.clone(),
            breaker,
            Arc::new(scheduler),
            settings(),
        ));
        tokio::spawn(tracker.clone().run());

        let mut subscription = bus.subscribe("presence.joined").unwrap();
        tracker.start().unwrap();
        settle().await;

        let event = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.payload, EventPayload::PresenceJoined { .. }));
    }
}
