use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use amoria_core::config::TypingSettings;
use amoria_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use amoria_core::scheduler::{Scheduler, TimerHandle};
use amoria_core::EventBusError;

use crate::MessagingError;

const TYPING_CHANNEL: &str = "typing.changed";

/// Typing indicators for one local user.
///
/// Sender side: each `is_typing=true` broadcast arms a per-conversation
/// auto-stop timer; a refresh replaces the timer rather than stacking a
/// second one, so at most one `false` is ever auto-broadcast. Observer side:
/// a receiver-side expiry timer of the same duration bounds staleness even
/// when the sender's stop message is lost.
///
/// Nothing here ever touches the durable store; typing state is volatile by
/// design.
pub struct TypingTracker {
    user_id: String,
    bus: Arc<dyn EventBus>,
    scheduler: Arc<dyn Scheduler>,
    settings: TypingSettings,
    /// Conversations this user is currently typing in, with their auto-stop
    /// timers.
    sending: Mutex<HashMap<String, TimerHandle>>,
    /// Observed typers per conversation, each with a receiver-side expiry
    /// timer.
    active: Mutex<HashMap<String, HashMap<String, TimerHandle>>>,
}

impl TypingTracker {
    pub fn new(
        user_id: &str,
        bus: Arc<dyn EventBus>,
        scheduler: Arc<dyn Scheduler>,
        settings: TypingSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.to_string(),
            bus,
            scheduler,
            settings,
            sending: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Broadcast the local user's typing state for a conversation.
    pub fn set_typing(
        self: &Arc<Self>,
        conversation_id: &str,
        is_typing: bool,
    ) -> Result<(), MessagingError> {
        if is_typing {
            let timer = self.arm_auto_stop(conversation_id);
            self.sending
                .lock()
                .unwrap()
                .insert(conversation_id.to_string(), timer);
            self.broadcast(conversation_id, true)?;
        } else {
            // Dropping the handle cancels any pending auto-stop.
            self.sending.lock().unwrap().remove(conversation_id);
            self.broadcast(conversation_id, false)?;
        }
        Ok(())
    }

    /// Users currently observed typing in a conversation, sorted.
    pub fn typing_in(&self, conversation_id: &str) -> Vec<String> {
        let active = self.active.lock().unwrap();
        let mut users: Vec<String> = active
            .get(conversation_id)
            .map(|typers| typers.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Broadcast `false` for every conversation this user was still typing
    /// in and cancel all timers. Used on unmount/disconnect.
    pub fn stop(self: &Arc<Self>) {
        let conversations: Vec<String> = {
            let mut sending = self.sending.lock().unwrap();
            sending.drain().map(|(conversation, _)| conversation).collect()
        };
        for conversation in conversations {
            if let Err(error) = self.broadcast(&conversation, false) {
                warn!(user = %self.user_id, %conversation, %error, "failed to broadcast typing stop");
            }
        }
        self.active.lock().unwrap().clear();
    }

    /// Consume typing broadcasts from other users. Own events are excluded
    /// at the transport, so there is no self special-casing here.
    pub async fn run(self: Arc<Self>) -> Result<(), MessagingError> {
        let mut subscription = self
            .bus
            .subscribe("typing.**")?
            .excluding(EventSource::User(self.user_id.clone()));

        loop {
            match subscription.recv().await {
                Ok(event) => {
                    if let EventPayload::TypingChanged {
                        conversation_id,
                        user_id,
                        is_typing,
                        ..
                    } = event.payload
                    {
                        self.observe(&conversation_id, &user_id, is_typing);
                    }
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(user = %self.user_id, count, "typing subscription lagged");
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!(user = %self.user_id, "event bus closed, typing loop exiting");
                    break;
                }
                Err(error) => {
                    warn!(user = %self.user_id, %error, "typing subscription error");
                    break;
                }
            }
        }
        Ok(())
    }

    fn observe(self: &Arc<Self>, conversation_id: &str, user_id: &str, is_typing: bool) {
        let mut active = self.active.lock().unwrap();
        if is_typing {
            debug!(conversation = %conversation_id, user = %user_id, "typing started");
            let timer = self.arm_expiry(conversation_id, user_id);
            active
                .entry(conversation_id.to_string())
                .or_default()
                .insert(user_id.to_string(), timer);
        } else {
            debug!(conversation = %conversation_id, user = %user_id, "typing stopped");
            if let Some(typers) = active.get_mut(conversation_id) {
                typers.remove(user_id);
                if typers.is_empty() {
                    active.remove(conversation_id);
                }
            }
        }
    }

    fn broadcast(&self, conversation_id: &str, is_typing: bool) -> Result<(), MessagingError> {
        let event = Event::new(
            Channel::new(TYPING_CHANNEL)?,
            EventSource::User(self.user_id.clone()),
            EventPayload::TypingChanged {
                conversation_id: conversation_id.to_string(),
                user_id: self.user_id.clone(),
                is_typing,
                sent_at: self.scheduler.now(),
            },
        );
        self.bus.publish(event)?;
        Ok(())
    }

    fn arm_auto_stop(self: &Arc<Self>, conversation_id: &str) -> TimerHandle {
        let tracker = Arc::downgrade(self);
        let conversation = conversation_id.to_string();
        self.scheduler.after(
            self.settings.auto_stop(),
            Box::new(move || {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.auto_stop_fired(&conversation);
                }
            }),
        )
    }

    fn auto_stop_fired(self: &Arc<Self>, conversation_id: &str) {
        // Drop the handle outside the broadcast so a failed publish cannot
        // leave a spent timer in the map.
        self.sending.lock().unwrap().remove(conversation_id);
        debug!(user = %self.user_id, conversation = %conversation_id, "typing auto-stop");
        if let Err(error) = self.broadcast(conversation_id, false) {
            warn!(user = %self.user_id, %error, "failed to broadcast typing auto-stop");
        }
    }

    fn arm_expiry(self: &Arc<Self>, conversation_id: &str, user_id: &str) -> TimerHandle {
        let tracker = Arc::downgrade(self);
        let conversation = conversation_id.to_string();
        let user = user_id.to_string();
        self.scheduler.after(
            self.settings.auto_stop(),
            Box::new(move || {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.expire(&conversation, &user);
                }
            }),
        )
    }

    fn expire(self: &Arc<Self>, conversation_id: &str, user_id: &str) {
        debug!(conversation = %conversation_id, user = %user_id, "typing entry expired");
        let mut active = self.active.lock().unwrap();
        if let Some(typers) = active.get_mut(conversation_id) {
            if let Some(handle) = typers.remove(user_id) {
                // Already fired; nothing left to cancel.
                handle.cancel();
            }
            if typers.is_empty() {
                active.remove(conversation_id);
            }
        }
    }
}
