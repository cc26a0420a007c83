use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use amoria_core::event::{EventBus, EventPayload};
use amoria_core::scheduler::Scheduler;
use amoria_core::EventBusError;
use amoria_guard::{with_circuit_breaker, CircuitBreaker};
use amoria_storage::{Filter, Store, StoreError};

use crate::MessagingError;

#[derive(Debug, Clone, PartialEq)]
pub struct ReadReceipt {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

/// Aggregated read state for one message, from the local cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadStatus {
    pub is_read: bool,
    pub read_by: Vec<ReadReceipt>,
}

/// Durable read receipts for one local user, with a receipt cache for the
/// conversations this instance observes.
///
/// All store traffic goes through the shared `"store"` circuit breaker.
/// Duplicate receipts are swallowed inside the wrapped operation, so a
/// re-read neither errors nor counts against the breaker.
pub struct ReadReceiptTracker<S: Store> {
    user_id: String,
    store: Arc<S>,
    bus: Arc<dyn EventBus>,
    breaker: Arc<CircuitBreaker>,
    scheduler: Arc<dyn Scheduler>,
    /// message_id -> receipts, for observed conversations.
    cache: RwLock<HashMap<String, Vec<ReadReceipt>>>,
    observed: RwLock<HashSet<String>>,
}

impl<S: Store> ReadReceiptTracker<S> {
    pub fn new(
        user_id: &str,
        store: Arc<S>,
        bus: Arc<dyn EventBus>,
        breaker: Arc<CircuitBreaker>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            store,
            bus,
            breaker,
            scheduler,
            cache: RwLock::new(HashMap::new()),
            observed: RwLock::new(HashSet::new()),
        }
    }

    /// Record that the local user has read a message. Idempotent: a receipt
    /// that already exists is a success, not an error.
    pub async fn mark_as_read(
        &self,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<(), MessagingError> {
        let read_at = self.scheduler.now();
        let row = json!({
            "message_id": message_id,
            "conversation_id": conversation_id,
            "user_id": self.user_id,
            "read_at": read_at,
        });

        self.breaker
            .execute(|| async {
                match self.store.insert("read_receipts", row.clone()).await {
                    Ok(_) => Ok(()),
                    // Already marked read; benign, and must not count as a
                    // breaker failure.
                    Err(StoreError::ConstraintViolation { .. }) => {
                        debug!(message = %message_id, user = %self.user_id, "receipt already exists");
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            })
            .await?;

        self.cache_receipt(ReadReceipt {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            user_id: self.user_id.clone(),
            read_at,
        });
        Ok(())
    }

    /// Mark every unread message in a conversation as read, server-side in
    /// one operation. Returns how many receipts were created.
    pub async fn mark_conversation_as_read(
        &self,
        conversation_id: &str,
    ) -> Result<u64, MessagingError> {
        let args = json!({
            "conversation_id": conversation_id,
            "user_id": self.user_id,
            "read_at": self.scheduler.now(),
        });

        let inserted = self
            .breaker
            .execute(|| async { self.store.rpc("mark_conversation_read", args.clone()).await })
            .await?;

        inserted
            .as_u64()
            .ok_or_else(|| MessagingError::BadResponse(format!("non-numeric rpc result {inserted}")))
    }

    /// Start watching a conversation: backfill its receipts from the store
    /// (degrading to an empty cache when the breaker is open) and keep it
    /// fresh through row-change events.
    pub async fn observe_conversation(&self, conversation_id: &str) {
        self.observed
            .write()
            .unwrap()
            .insert(conversation_id.to_string());

        let filter = Filter::new().eq("conversation_id", conversation_id);
        let rows = with_circuit_breaker(
            &self.breaker,
            || async { self.store.select("read_receipts", &filter).await },
            Some(Vec::new),
        )
        .await
        .unwrap_or_default();

        for row in &rows {
            match parse_receipt(row) {
                Ok(receipt) => self.cache_receipt(receipt),
                Err(error) => {
                    warn!(conversation = %conversation_id, %error, "skipping malformed receipt row");
                }
            }
        }
        debug!(conversation = %conversation_id, receipts = rows.len(), "conversation observed");
    }

    /// Read state of a message from the cache. Only meaningful for observed
    /// conversations.
    pub fn read_status(&self, message_id: &str) -> ReadStatus {
        let read_by = self
            .cache
            .read()
            .unwrap()
            .get(message_id)
            .cloned()
            .unwrap_or_default();
        ReadStatus {
            is_read: !read_by.is_empty(),
            read_by,
        }
    }

    /// Unread-message count for the local user, derived by the store: a
    /// message is unread iff it has no receipt from this user and this user
    /// is not its sender.
    pub async fn unread_count(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<u64, MessagingError> {
        let mut args = json!({ "user_id": self.user_id });
        if let Some(conversation_id) = conversation_id {
            args["conversation_id"] = Value::from(conversation_id);
        }

        let count = self
            .breaker
            .execute(|| async { self.store.rpc("unread_count", args.clone()).await })
            .await?;

        count
            .as_u64()
            .ok_or_else(|| MessagingError::BadResponse(format!("non-numeric rpc result {count}")))
    }

    /// Consume row-change events and refresh the cache for observed
    /// conversations.
    pub async fn run(self: Arc<Self>) -> Result<(), MessagingError> {
        let mut subscription = self.bus.subscribe("store.**")?;

        loop {
            match subscription.recv().await {
                Ok(event) => {
                    if let EventPayload::RowInserted { table, row } = event.payload {
                        if table == "read_receipts" {
                            self.handle_inserted_receipt(&row);
                        }
                    }
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(user = %self.user_id, count, "receipt subscription lagged");
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!(user = %self.user_id, "event bus closed, receipt loop exiting");
                    break;
                }
                Err(error) => {
                    warn!(user = %self.user_id, %error, "receipt subscription error");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_inserted_receipt(&self, row: &Value) {
        let receipt = match parse_receipt(row) {
            Ok(receipt) => receipt,
            Err(error) => {
                warn!(%error, "ignoring malformed receipt event");
                return;
            }
        };
        if !self
            .observed
            .read()
            .unwrap()
            .contains(&receipt.conversation_id)
        {
            return;
        }
        debug!(
            message = %receipt.message_id,
            user = %receipt.user_id,
            "receipt cache refreshed from event"
        );
        self.cache_receipt(receipt);
    }

    fn cache_receipt(&self, receipt: ReadReceipt) {
        let mut cache = self.cache.write().unwrap();
        let receipts = cache.entry(receipt.message_id.clone()).or_default();
        let duplicate = receipts.iter().any(|existing| {
            existing.message_id == receipt.message_id && existing.user_id == receipt.user_id
        });
        if !duplicate {
            receipts.push(receipt);
        }
    }
}

fn parse_receipt(row: &Value) -> Result<ReadReceipt, StoreError> {
    let text = |name: &str| {
        row.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::BadRow(format!("missing column '{name}'")))
    };
    let read_at: DateTime<Utc> = row
        .get("read_at")
        .cloned()
        .ok_or_else(|| StoreError::BadRow("missing column 'read_at'".to_string()))
        .and_then(|value| {
            serde_json::from_value(value)
                .map_err(|error| StoreError::BadRow(format!("bad read_at: {error}")))
        })?;

    Ok(ReadReceipt {
        message_id: text("message_id")?,
        conversation_id: text("conversation_id")?,
        user_id: text("user_id")?,
        read_at,
    })
}
