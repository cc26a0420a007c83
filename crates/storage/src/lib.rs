use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected the write. Callers that rely on
    /// idempotent inserts match on this variant; it is never encoded in an
    /// error message string.
    #[error("unique constraint violated on {table}: {detail}")]
    ConstraintViolation { table: String, detail: String },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed row: {0}")]
    BadRow(String),
}

/// Conjunctive equality conditions over row columns.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((column.to_string(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

/// The durable store collaborator. Rows are JSON documents; unique
/// constraint violations surface as [`StoreError::ConstraintViolation`] so
/// callers can treat re-inserts as no-ops.
#[allow(async_fn_in_trait)]
pub trait Store: Send + Sync + 'static {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError>;

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, StoreError>;

    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        patch: Value,
    ) -> Result<Vec<Value>, StoreError>;

    /// Server-side operation: bulk or derived queries that must not be
    /// decomposed into per-row calls (e.g. mark-conversation-read).
    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError>;
}

/// Called with `(table, row)` after every successful insert. The host wires
/// this to the event bus to produce row-change notifications.
pub type ChangeListener = Box<dyn Fn(&str, &Value) + Send + Sync>;

/// In-memory reference backend. Enforces the same unique constraints as the
/// sqlite schema and drives row-change notifications through an optional
/// listener.
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    unique: RwLock<HashMap<String, Vec<Vec<String>>>>,
    listener: RwLock<Option<ChangeListener>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self {
            tables: RwLock::new(HashMap::new()),
            unique: RwLock::new(HashMap::new()),
            listener: RwLock::new(None),
        };
        store.register_unique("read_receipts", &["message_id", "user_id"]);
        store.register_unique("presence_status", &["user_id"]);
        store.register_unique("messages", &["id"]);
        store
    }

    /// Register an additional unique constraint for a table.
    pub fn register_unique(&self, table: &str, columns: &[&str]) {
        self.unique
            .write()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|c| c.to_string()).collect());
    }

    pub fn set_change_listener(&self, listener: ChangeListener) {
        *self.listener.write().unwrap() = Some(listener);
    }

    fn notify(&self, table: &str, row: &Value) {
        if let Some(listener) = self.listener.read().unwrap().as_ref() {
            listener(table, row);
        }
    }

    fn check_unique(
        &self,
        table: &str,
        rows: &[Value],
        candidate: &Value,
    ) -> Result<(), StoreError> {
        let unique = self.unique.read().unwrap();
        let Some(constraints) = unique.get(table) else {
            return Ok(());
        };
        for columns in constraints {
            let conflict = rows.iter().any(|row| {
                columns
                    .iter()
                    .all(|col| row.get(col).is_some() && row.get(col) == candidate.get(col))
            });
            if conflict {
                return Err(StoreError::ConstraintViolation {
                    table: table.to_string(),
                    detail: columns.join(", "),
                });
            }
        }
        Ok(())
    }

    fn mark_conversation_read(&self, args: &Value) -> Result<Value, StoreError> {
        let conversation_id = required_str(args, "conversation_id")?;
        let user_id = required_str(args, "user_id")?;
        let read_at = required_str(args, "read_at")?;

        let mut tables = self.tables.write().unwrap();

        let unread: Vec<String> = {
            let messages = tables.get("messages").map(Vec::as_slice).unwrap_or(&[]);
            let receipts = tables
                .get("read_receipts")
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            messages
                .iter()
                .filter(|m| {
                    m.get("conversation_id").and_then(Value::as_str) == Some(conversation_id)
                        && m.get("sender_id").and_then(Value::as_str) != Some(user_id)
                })
                .filter_map(|m| m.get("id").and_then(Value::as_str))
                .filter(|message_id| {
                    !receipts.iter().any(|r| {
                        r.get("message_id").and_then(Value::as_str) == Some(*message_id)
                            && r.get("user_id").and_then(Value::as_str) == Some(user_id)
                    })
                })
                .map(str::to_string)
                .collect()
        };

        let mut inserted = Vec::with_capacity(unread.len());
        for message_id in unread {
            let receipt = serde_json::json!({
                "message_id": message_id,
                "conversation_id": conversation_id,
                "user_id": user_id,
                "read_at": read_at,
            });
            tables
                .entry("read_receipts".to_string())
                .or_default()
                .push(receipt.clone());
            inserted.push(receipt);
        }
        drop(tables);

        for receipt in &inserted {
            self.notify("read_receipts", receipt);
        }

        Ok(Value::from(inserted.len() as u64))
    }

    fn unread_count(&self, args: &Value) -> Result<Value, StoreError> {
        let user_id = required_str(args, "user_id")?;
        let conversation_id = args.get("conversation_id").and_then(Value::as_str);

        let tables = self.tables.read().unwrap();
        let messages = tables.get("messages").map(Vec::as_slice).unwrap_or(&[]);
        let receipts = tables
            .get("read_receipts")
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let count = messages
            .iter()
            .filter(|m| {
                conversation_id.is_none()
                    || m.get("conversation_id").and_then(Value::as_str) == conversation_id
            })
            .filter(|m| m.get("sender_id").and_then(Value::as_str) != Some(user_id))
            .filter(|m| {
                let message_id = m.get("id").and_then(Value::as_str);
                !receipts.iter().any(|r| {
                    r.get("message_id").and_then(Value::as_str) == message_id
                        && r.get("user_id").and_then(Value::as_str) == Some(user_id)
                })
            })
            .count();

        Ok(Value::from(count as u64))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, StoreError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::BadRow(format!("missing argument '{key}'")))
}

impl Store for MemoryStore {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        if !row.is_object() {
            return Err(StoreError::BadRow("row must be a JSON object".to_string()));
        }

        {
            let mut tables = self.tables.write().unwrap();
            let rows = tables.entry(table.to_string()).or_default();
            self.check_unique(table, rows, &row)?;
            rows.push(row.clone());
        }

        self.notify(table, &row);
        Ok(row)
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        patch: Value,
    ) -> Result<Vec<Value>, StoreError> {
        let Some(patch) = patch.as_object() else {
            return Err(StoreError::BadRow("patch must be a JSON object".to_string()));
        };

        let mut tables = self.tables.write().unwrap();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(Vec::new());
        };

        let mut updated = Vec::new();
        for row in rows.iter_mut().filter(|row| filter.matches(row)) {
            if let Some(object) = row.as_object_mut() {
                for (column, value) in patch {
                    object.insert(column.clone(), value.clone());
                }
            }
            updated.push(row.clone());
        }
        Ok(updated)
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError> {
        match name {
            "mark_conversation_read" => self.mark_conversation_read(&args),
            "unread_count" => self.unread_count(&args),
            _ => Err(StoreError::QueryFailed(format!("unknown rpc '{name}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: &str, conversation: &str, sender: &str) -> Value {
        json!({
            "id": id,
            "conversation_id": conversation,
            "sender_id": sender,
            "body": "hi",
            "sent_at": "2026-01-01T00:00:00Z",
        })
    }

    fn receipt(message_id: &str, conversation: &str, user: &str) -> Value {
        json!({
            "message_id": message_id,
            "conversation_id": conversation,
            "user_id": user,
            "read_at": "2026-01-01T00:00:01Z",
        })
    }

    #[tokio::test]
    async fn insert_and_select_round_trip() {
        let store = MemoryStore::new();
        store
            .insert("messages", message("m1", "c1", "alice"))
            .await
            .unwrap();

        let rows = store
            .select("messages", &Filter::new().eq("conversation_id", "c1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "m1");
    }

    #[tokio::test]
    async fn select_unknown_table_returns_empty() {
        let store = MemoryStore::new();
        let rows = store.select("nope", &Filter::new()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn duplicate_receipt_is_constraint_violation() {
        let store = MemoryStore::new();
        store
            .insert("read_receipts", receipt("m1", "c1", "bob"))
            .await
            .unwrap();

        let result = store.insert("read_receipts", receipt("m1", "c1", "bob")).await;
        assert!(matches!(
            result,
            Err(StoreError::ConstraintViolation { ref table, .. }) if table == "read_receipts"
        ));

        let rows = store
            .select("read_receipts", &Filter::new().eq("message_id", "m1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn same_message_different_user_is_allowed() {
        let store = MemoryStore::new();
        store
            .insert("read_receipts", receipt("m1", "c1", "bob"))
            .await
            .unwrap();
        store
            .insert("read_receipts", receipt("m1", "c1", "carol"))
            .await
            .unwrap();

        let rows = store
            .select("read_receipts", &Filter::new().eq("message_id", "m1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn update_patches_matching_rows() {
        let store = MemoryStore::new();
        store
            .insert(
                "presence_status",
                json!({"user_id": "alice", "status": "online", "last_seen": "t0"}),
            )
            .await
            .unwrap();

        let updated = store
            .update(
                "presence_status",
                &Filter::new().eq("user_id", "alice"),
                json!({"status": "away", "last_seen": "t1"}),
            )
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["status"], "away");

        let rows = store
            .select("presence_status", &Filter::new().eq("user_id", "alice"))
            .await
            .unwrap();
        assert_eq!(rows[0]["last_seen"], "t1");
    }

    #[tokio::test]
    async fn update_with_no_match_returns_empty() {
        let store = MemoryStore::new();
        let updated = store
            .update(
                "presence_status",
                &Filter::new().eq("user_id", "ghost"),
                json!({"status": "away"}),
            )
            .await
            .unwrap();
        assert!(updated.is_empty());
    }

    #[tokio::test]
    async fn change_listener_fires_on_insert() {
        let store = MemoryStore::new();
        let seen = std::sync::Arc::new(RwLock::new(Vec::new()));
        let seen_clone = seen.clone();
        store.set_change_listener(Box::new(move |table, row| {
            seen_clone
                .write()
                .unwrap()
                .push((table.to_string(), row.clone()));
        }));

        store
            .insert("read_receipts", receipt("m1", "c1", "bob"))
            .await
            .unwrap();

        let seen = seen.read().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "read_receipts");
        assert_eq!(seen[0].1["message_id"], "m1");
    }

    #[tokio::test]
    async fn mark_conversation_read_is_bulk_and_idempotent() {
        let store = MemoryStore::new();
        store
            .insert("messages", message("m1", "c1", "alice"))
            .await
            .unwrap();
        store
            .insert("messages", message("m2", "c1", "alice"))
            .await
            .unwrap();
        store
            .insert("messages", message("m3", "c1", "bob"))
            .await
            .unwrap();
        // m2 already read by bob
        store
            .insert("read_receipts", receipt("m2", "c1", "bob"))
            .await
            .unwrap();

        let args = json!({
            "conversation_id": "c1",
            "user_id": "bob",
            "read_at": "2026-01-01T00:00:02Z",
        });
        let inserted = store
            .rpc("mark_conversation_read", args.clone())
            .await
            .unwrap();
        // m1 gets a receipt; m2 already had one; m3 is bob's own message.
        assert_eq!(inserted, json!(1));

        let again = store.rpc("mark_conversation_read", args).await.unwrap();
        assert_eq!(again, json!(0));

        let rows = store
            .select("read_receipts", &Filter::new().eq("user_id", "bob"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn unread_count_excludes_own_and_read_messages() {
        let store = MemoryStore::new();
        store
            .insert("messages", message("m1", "c1", "alice"))
            .await
            .unwrap();
        store
            .insert("messages", message("m2", "c1", "alice"))
            .await
            .unwrap();
        store
            .insert("messages", message("m3", "c1", "bob"))
            .await
            .unwrap();
        store
            .insert("messages", message("m4", "c2", "alice"))
            .await
            .unwrap();
        store
            .insert("read_receipts", receipt("m1", "c1", "bob"))
            .await
            .unwrap();

        let in_c1 = store
            .rpc(
                "unread_count",
                json!({"user_id": "bob", "conversation_id": "c1"}),
            )
            .await
            .unwrap();
        assert_eq!(in_c1, json!(1));

        let everywhere = store
            .rpc("unread_count", json!({"user_id": "bob"}))
            .await
            .unwrap();
        assert_eq!(everywhere, json!(2));
    }

    #[tokio::test]
    async fn unknown_rpc_is_an_error() {
        let store = MemoryStore::new();
        let result = store.rpc("explode", json!({})).await;
        assert!(matches!(result, Err(StoreError::QueryFailed(_))));
    }
}
