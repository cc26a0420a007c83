use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        let parts: Vec<&str> = name.split('.').collect();
        if parts.is_empty() {
            return false;
        }

        matches!(parts[0], "presence" | "typing" | "store" | "system")
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "presence.joined")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Component or user that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event.
///
/// `User` sources are compared for self-broadcast exclusion: a typing
/// subscription created with [`EventSubscription::excluding`] never sees the
/// events its own user published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core system component
    System(String),
    /// A connected user (by user id)
    User(String),
}

/// Ephemeral per-user connectivity status shared across clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// One user's presence, as published on the bus and mirrored to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn offline(user_id: &str, last_seen: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            last_seen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Presence events ──────────────────────────────────────────
    /// Full state of everyone currently tracked on a presence channel.
    PresenceSnapshot {
        records: Vec<PresenceRecord>,
    },
    /// A user joined the channel or re-published their status.
    PresenceJoined {
        record: PresenceRecord,
    },
    /// A user's subscription ended (including abnormal disconnect).
    PresenceLeft {
        user_id: String,
        last_seen: DateTime<Utc>,
    },

    // ── Typing events (volatile broadcast, never persisted) ─────
    TypingChanged {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
        sent_at: DateTime<Utc>,
    },

    // ── Store change notifications ───────────────────────────────
    /// A row was inserted into a watched table.
    RowInserted {
        table: String,
        row: serde_json::Value,
    },

    // ── Transport health ─────────────────────────────────────────
    ConnectionLost {
        reason: String,
    },
    ConnectionRestored,
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// In-process pub/sub transport: one broadcast channel per domain, with
/// glob-filtered subscriptions. Delivery is FIFO within a domain.
#[derive(Clone)]
pub struct BroadcastEventBus {
    presence_sender: broadcast::Sender<Event>,
    typing_sender: broadcast::Sender<Event>,
    store_sender: broadcast::Sender<Event>,
    system_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (presence_sender, _) = broadcast::channel(capacity);
        let (typing_sender, _) = broadcast::channel(capacity);
        let (store_sender, _) = broadcast::channel(capacity);
        let (system_sender, _) = broadcast::channel(capacity);

        Self {
            presence_sender,
            typing_sender,
            store_sender,
            system_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "presence" => Some(&self.presence_sender),
            "typing" => Some(&self.typing_sender),
            "store" => Some(&self.store_sender),
            "system" => Some(&self.system_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(&self, pattern: &str) -> Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                presence: Some(self.presence_sender.subscribe()),
                typing: Some(self.typing_sender.subscribe()),
                store: Some(self.store_sender.subscribe()),
                system: Some(self.system_sender.subscribe()),
            });
        }

        match first_segment {
            "presence" => Ok(DomainReceivers {
                presence: Some(self.presence_sender.subscribe()),
                typing: None,
                store: None,
                system: None,
            }),
            "typing" => Ok(DomainReceivers {
                presence: None,
                typing: Some(self.typing_sender.subscribe()),
                store: None,
                system: None,
            }),
            "store" => Ok(DomainReceivers {
                presence: None,
                typing: None,
                store: Some(self.store_sender.subscribe()),
                system: None,
            }),
            "system" => Ok(DomainReceivers {
                presence: None,
                typing: None,
                store: None,
                system: Some(self.system_sender.subscribe()),
            }),
            _ => Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription {
            matcher,
            receivers,
            exclude: None,
        })
    }
}

struct DomainReceivers {
    presence: Option<broadcast::Receiver<Event>>,
    typing: Option<broadcast::Receiver<Event>>,
    store: Option<broadcast::Receiver<Event>>,
    system: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
    exclude: Option<EventSource>,
}

impl EventSubscription {
    /// Drop events published by `source` instead of delivering them. Used by
    /// typing channels so a sender never sees its own broadcasts.
    pub fn excluding(mut self, source: EventSource) -> Self {
        self.exclude = Some(source);
        self
    }

    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let presence_receiver = self.receivers.presence.as_mut();
            let typing_receiver = self.receivers.typing.as_mut();
            let store_receiver = self.receivers.store.as_mut();
            let system_receiver = self.receivers.system.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(presence_receiver) => result,
                result = recv_from_domain(typing_receiver) => result,
                result = recv_from_domain(store_receiver) => result,
                result = recv_from_domain(system_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => {
                    if self.exclude.as_ref() == Some(&event.source) {
                        continue;
                    }
                    return Ok(event);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_validation() {
        assert!(Channel::is_valid("presence.joined"));
        assert!(Channel::is_valid("typing.changed"));
        assert!(Channel::is_valid("store.row.inserted"));
        assert!(Channel::is_valid("system.connection.lost"));

        assert!(!Channel::is_valid("invalid.domain.event"));
        assert!(!Channel::is_valid("presence..double.dot"));
        assert!(!Channel::is_valid(".starts.with.dot"));
        assert!(!Channel::is_valid("ends.with.dot."));
        assert!(!Channel::is_valid("UpperCase"));
        assert!(!Channel::is_valid("with-hyphen"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn channel_domain() {
        let c = Channel::new("presence.joined").unwrap();
        assert_eq!(c.domain(), "presence");
    }

    #[test]
    fn channel_new_rejects_invalid() {
        let result = Channel::new("bad.domain.event");
        assert!(matches!(
            result.unwrap_err(),
            EventBusError::InvalidChannel(_)
        ));
    }

    #[test]
    fn channel_as_str_and_display() {
        let c = Channel::new("typing.changed").unwrap();
        assert_eq!(c.as_str(), "typing.changed");
        assert_eq!(c.to_string(), "typing.changed");
    }

    #[test]
    fn event_new_fields() {
        let channel = Channel::new("system.connection.restored").unwrap();
        let event = Event::new(
            channel.clone(),
            EventSource::System("test".into()),
            EventPayload::ConnectionRestored,
        );

        assert_eq!(event.channel, channel);
        assert!(!event.id.is_nil());
    }

    #[test]
    fn event_unique_ids() {
        let channel = Channel::new("system.connection.restored").unwrap();
        let e1 = Event::new(
            channel.clone(),
            EventSource::System("test".into()),
            EventPayload::ConnectionRestored,
        );
        let e2 = Event::new(
            channel,
            EventSource::System("test".into()),
            EventPayload::ConnectionRestored,
        );
        assert_ne!(e1.id, e2.id);
    }

    #[test]
    fn has_glob_meta_detects_metacharacters() {
        assert!(has_glob_meta("*"));
        assert!(has_glob_meta("?"));
        assert!(has_glob_meta("[a]"));
        assert!(has_glob_meta("{a,b}"));
        assert!(has_glob_meta("**"));
        assert!(!has_glob_meta("presence"));
        assert!(!has_glob_meta("typing"));
    }
}
