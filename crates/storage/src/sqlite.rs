use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use serde_json::{Map, Value};
use tokio::task;
use tracing::info;

use crate::{Filter, Store, StoreError};

/// SQLite backend. A single connection guarded by a mutex; every call runs
/// on the blocking pool so the async runtime never blocks on disk I/O.
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let connection = task::spawn_blocking(move || {
            let connection = open_connection(&path)?;
            run_migrations(&connection)?;
            Ok::<_, StoreError>(connection)
        })
        .await
        .map_err(|error| StoreError::Unavailable(format!("setup task failed: {error}")))??;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Open an in-memory database, mainly for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let connection = task::spawn_blocking(|| {
            let connection = Connection::open_in_memory()
                .map_err(|error| StoreError::Unavailable(error.to_string()))?;
            run_migrations(&connection)?;
            Ok::<_, StoreError>(connection)
        })
        .await
        .map_err(|error| StoreError::Unavailable(format!("setup task failed: {error}")))??;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let connection = self.connection.clone();
        task::spawn_blocking(move || {
            let guard = connection.lock().unwrap();
            f(&guard)
        })
        .await
        .map_err(|error| StoreError::Unavailable(format!("blocking task failed: {error}")))?
    }
}

impl Store for SqliteStore {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        let table = validated_identifier(table)?;
        let object = as_object(&row)?.clone();

        self.with_connection(move |connection| {
            let columns: Vec<&str> = object.keys().map(String::as_str).collect();
            for column in &columns {
                validated_identifier(column)?;
            }
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );
            let params: Vec<rusqlite::types::Value> =
                object.values().map(json_to_sql).collect::<Result<_, _>>()?;

            connection
                .execute(&sql, params_from_iter(params.iter()))
                .map_err(|error| map_sqlite_error(error, &table))?;
            Ok(Value::Object(object))
        })
        .await
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let table = validated_identifier(table)?;
        let conditions = filter.conditions().to_vec();

        self.with_connection(move |connection| {
            let (sql, params) = build_select(&table, &conditions)?;
            query_rows(connection, &sql, &params)
        })
        .await
    }

    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        patch: Value,
    ) -> Result<Vec<Value>, StoreError> {
        let table = validated_identifier(table)?;
        let conditions = filter.conditions().to_vec();
        let patch = as_object(&patch)?.clone();

        self.with_connection(move |connection| {
            let mut assignments = Vec::with_capacity(patch.len());
            let mut params = Vec::new();
            for (column, value) in &patch {
                validated_identifier(column)?;
                params.push(json_to_sql(value)?);
                assignments.push(format!("{column} = ?{}", params.len()));
            }
            let mut clauses = Vec::with_capacity(conditions.len());
            for (column, value) in &conditions {
                validated_identifier(column)?;
                params.push(json_to_sql(value)?);
                clauses.push(format!("{column} = ?{}", params.len()));
            }

            let mut sql = format!("UPDATE {table} SET {}", assignments.join(", "));
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            connection
                .execute(&sql, params_from_iter(params.iter()))
                .map_err(|error| map_sqlite_error(error, &table))?;

            let (select_sql, select_params) = build_select(&table, &conditions)?;
            query_rows(connection, &select_sql, &select_params)
        })
        .await
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError> {
        match name {
            "mark_conversation_read" => {
                let conversation_id = required_arg(&args, "conversation_id")?;
                let user_id = required_arg(&args, "user_id")?;
                let read_at = required_arg(&args, "read_at")?;

                self.with_connection(move |connection| {
                    let inserted = connection
                        .execute(
                            "INSERT INTO read_receipts (message_id, conversation_id, user_id, read_at)
                             SELECT m.id, m.conversation_id, ?2, ?3
                             FROM messages m
                             WHERE m.conversation_id = ?1
                               AND m.sender_id != ?2
                               AND NOT EXISTS (
                                   SELECT 1 FROM read_receipts r
                                   WHERE r.message_id = m.id AND r.user_id = ?2
                               )",
                            params![conversation_id, user_id, read_at],
                        )
                        .map_err(|error| map_sqlite_error(error, "read_receipts"))?;
                    Ok(Value::from(inserted as u64))
                })
                .await
            }
            "unread_count" => {
                let user_id = required_arg(&args, "user_id")?;
                let conversation_id = args
                    .get("conversation_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                self.with_connection(move |connection| {
                    let count: i64 = connection
                        .query_row(
                            "SELECT COUNT(*)
                             FROM messages m
                             WHERE (?2 IS NULL OR m.conversation_id = ?2)
                               AND m.sender_id != ?1
                               AND NOT EXISTS (
                                   SELECT 1 FROM read_receipts r
                                   WHERE r.message_id = m.id AND r.user_id = ?1
                               )",
                            params![user_id, conversation_id],
                            |row| row.get(0),
                        )
                        .map_err(|error| map_sqlite_error(error, "messages"))?;
                    Ok(Value::from(count as u64))
                })
                .await
            }
            _ => Err(StoreError::QueryFailed(format!("unknown rpc '{name}'"))),
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|error| unavailable(path, &error.to_string()))?;
    }

    let connection =
        Connection::open(path).map_err(|error| unavailable(path, &error.to_string()))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|error| unavailable(path, &error.to_string()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .map_err(|error| unavailable(path, &error.to_string()))?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .map_err(|error| unavailable(path, &error.to_string()))?;
    Ok(connection)
}

fn unavailable(path: &Path, reason: &str) -> StoreError {
    StoreError::Unavailable(format!(
        "failed to open database at {}: {reason}",
        path.display()
    ))
}

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/001_initial.sql"),
}];

fn run_migrations(connection: &Connection) -> Result<(), StoreError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|error| {
            StoreError::QueryFailed(format!("failed to create _migrations table: {error}"))
        })?;

    for migration in MIGRATIONS {
        let is_applied: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                params![migration.version],
                |row| row.get(0),
            )
            .map_err(|error| {
                StoreError::QueryFailed(format!(
                    "failed to query state of migration {}: {error}",
                    migration.version
                ))
            })?;

        if is_applied != 0 {
            continue;
        }

        let tx = connection.unchecked_transaction().map_err(|error| {
            StoreError::QueryFailed(format!(
                "failed to begin migration {}: {error}",
                migration.version
            ))
        })?;
        tx.execute_batch(migration.sql).map_err(|error| {
            StoreError::QueryFailed(format!("migration {} failed: {error}", migration.version))
        })?;
        tx.execute(
            "INSERT INTO _migrations (version) VALUES (?1)",
            params![migration.version],
        )
        .map_err(|error| {
            StoreError::QueryFailed(format!(
                "failed to record migration {}: {error}",
                migration.version
            ))
        })?;
        tx.commit().map_err(|error| {
            StoreError::QueryFailed(format!(
                "failed to commit migration {}: {error}",
                migration.version
            ))
        })?;

        info!(version = migration.version, "applied migration");
    }

    Ok(())
}

fn build_select(
    table: &str,
    conditions: &[(String, Value)],
) -> Result<(String, Vec<rusqlite::types::Value>), StoreError> {
    let mut sql = format!("SELECT * FROM {table}");
    let mut params = Vec::with_capacity(conditions.len());
    let mut clauses = Vec::with_capacity(conditions.len());
    for (column, value) in conditions {
        validated_identifier(column)?;
        params.push(json_to_sql(value)?);
        clauses.push(format!("{column} = ?{}", params.len()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    Ok((sql, params))
}

fn query_rows(
    connection: &Connection,
    sql: &str,
    params: &[rusqlite::types::Value],
) -> Result<Vec<Value>, StoreError> {
    let mut statement = connection
        .prepare(sql)
        .map_err(|error| StoreError::QueryFailed(error.to_string()))?;
    let column_names: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut rows = statement
        .query(params_from_iter(params.iter()))
        .map_err(|error| StoreError::QueryFailed(error.to_string()))?;

    let mut output = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|error| StoreError::QueryFailed(error.to_string()))?
    {
        let mut object = Map::with_capacity(column_names.len());
        for (index, name) in column_names.iter().enumerate() {
            let value = row
                .get_ref(index)
                .map_err(|error| StoreError::QueryFailed(error.to_string()))?;
            object.insert(name.clone(), sql_to_json(value)?);
        }
        output.push(Value::Object(object));
    }
    Ok(output)
}

fn map_sqlite_error(error: rusqlite::Error, table: &str) -> StoreError {
    match &error {
        rusqlite::Error::SqliteFailure(inner, message)
            if inner.code == ErrorCode::ConstraintViolation =>
        {
            StoreError::ConstraintViolation {
                table: table.to_string(),
                detail: message.clone().unwrap_or_else(|| inner.to_string()),
            }
        }
        _ => StoreError::QueryFailed(error.to_string()),
    }
}

/// Table and column names are interpolated into SQL, so they are restricted
/// to plain snake_case identifiers.
fn validated_identifier(name: &str) -> Result<String, StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(name.to_string())
    } else {
        Err(StoreError::BadRow(format!("invalid identifier '{name}'")))
    }
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, StoreError> {
    value
        .as_object()
        .ok_or_else(|| StoreError::BadRow("expected a JSON object".to_string()))
}

fn required_arg(args: &Value, key: &str) -> Result<String, StoreError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::BadRow(format!("missing argument '{key}'")))
}

fn json_to_sql(value: &Value) -> Result<rusqlite::types::Value, StoreError> {
    match value {
        Value::Null => Ok(rusqlite::types::Value::Null),
        Value::Bool(b) => Ok(rusqlite::types::Value::Integer(i64::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(rusqlite::types::Value::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(rusqlite::types::Value::Real(f))
            } else {
                Err(StoreError::BadRow(format!("unsupported number {n}")))
            }
        }
        Value::String(s) => Ok(rusqlite::types::Value::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(StoreError::BadRow(
            "nested values cannot be stored as columns".to_string(),
        )),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Result<Value, StoreError> {
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::from(i)),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| StoreError::BadRow(format!("non-finite float {f}"))),
        ValueRef::Text(bytes) => String::from_utf8(bytes.to_vec())
            .map(Value::String)
            .map_err(|_| StoreError::BadRow("non-UTF-8 text column".to_string())),
        ValueRef::Blob(_) => Err(StoreError::BadRow(
            "blob columns are not representable".to_string(),
        )),
    }
}
