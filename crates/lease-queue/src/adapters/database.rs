//! SQL table queue adapter (SQLite through `sqlx`).
//!
//! One row per message. `expires_at` holds the lease expiry in Unix
//! milliseconds, with `0` meaning the message is active. Claims are a
//! conditional update on `expires_at = 0`; whoever sees one affected row owns
//! the message, so any number of processes may share a database file.

use crate::adapter::QueueAdapter;
use crate::config::{BackendKind, DatabaseConfig};
use crate::error::{ConfigurationError, QueueError};
use crate::message::{validate_lease, Envelope, MessageId, QueueName, Timestamp};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Value of `expires_at` for active rows
const ACTIVE: i64 = 0;

/// Re-selects after losing a claim race before `pull` gives up with `None`
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// SQL text for one table, built once after the table name is validated
#[derive(Debug)]
struct Statements {
    create_table: String,
    create_index: String,
    insert: String,
    reclaim: String,
    select_active: String,
    claim: String,
    delete: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    queue_name TEXT NOT NULL,
                    producer_id TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    expires_at INTEGER NOT NULL DEFAULT 0
                )"
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_queue ON {table}(queue_name, expires_at, id)"
            ),
            insert: format!(
                "INSERT INTO {table} (queue_name, producer_id, payload, expires_at) VALUES (?, ?, ?, ?)"
            ),
            reclaim: format!(
                "UPDATE {table} SET expires_at = ? WHERE queue_name = ? AND expires_at > ? AND expires_at < ?"
            ),
            select_active: format!(
                "SELECT id, producer_id, payload FROM {table} WHERE queue_name = ? AND expires_at = ? ORDER BY id LIMIT 1"
            ),
            claim: format!("UPDATE {table} SET expires_at = ? WHERE id = ? AND expires_at = ?"),
            delete: format!(
                "DELETE FROM {table} WHERE id = ? AND queue_name = ? AND expires_at > ?"
            ),
        }
    }
}

/// Database-backed queue adapter
pub struct DatabaseAdapter {
    pool: SqlitePool,
    table: String,
    sql: Statements,
}

impl DatabaseAdapter {
    /// Connect to the database and create the schema if configured to
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid table name or URL and
    /// [`QueueError::ConnectionFailed`] when the database cannot be opened.
    pub async fn connect(config: DatabaseConfig) -> Result<Self, QueueError> {
        validate_table_name(&config.table)?;

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("Invalid database url '{}': {}", config.url, e),
            })?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        // Every connection to an in-memory database is a separate database
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("{}: {}", config.url, e),
            })?;

        let adapter = Self {
            pool,
            sql: Statements::for_table(&config.table),
            table: config.table,
        };

        if config.create_table {
            adapter.create_schema().await?;
        }

        tracing::info!(table = %adapter.table, in_memory, "Created database queue adapter");
        Ok(adapter)
    }

    async fn create_schema(&self) -> Result<(), QueueError> {
        sqlx::query(&self.sql.create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| sql_error("create_schema", e))?;
        sqlx::query(&self.sql.create_index)
            .execute(&self.pool)
            .await
            .map_err(|e| sql_error("create_schema", e))?;
        Ok(())
    }

    /// Table holding the messages
    pub fn table(&self) -> &str {
        &self.table
    }

    async fn reclaim(&self, queue: &QueueName, operation: &'static str) -> Result<u64, QueueError> {
        let now = Utc::now().timestamp_millis();
        let reclaimed = sqlx::query(&self.sql.reclaim)
            .bind(ACTIVE)
            .bind(queue.as_str())
            .bind(ACTIVE)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| sql_error(operation, e))?
            .rows_affected();

        if reclaimed > 0 {
            tracing::warn!(queue = %queue, reclaimed, "Reclaimed expired leases");
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl QueueAdapter for DatabaseAdapter {
    async fn push(&self, queue: &QueueName, envelope: &Envelope) -> Result<MessageId, QueueError> {
        let id = sqlx::query(&self.sql.insert)
            .bind(queue.as_str())
            .bind(envelope.producer_id.as_str())
            .bind(envelope.payload.as_ref())
            .bind(ACTIVE)
            .execute(&self.pool)
            .await
            .map_err(|e| sql_error("push", e))?
            .last_insert_rowid();

        let message_id = MessageId::from(id);
        tracing::debug!(queue = %queue, message_id = %message_id, "Pushed message");
        Ok(message_id)
    }

    async fn pull(
        &self,
        queue: &QueueName,
        lease: Duration,
    ) -> Result<Option<Envelope>, QueueError> {
        validate_lease(lease)?;
        self.reclaim(queue, "pull").await?;

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let row: Option<(i64, String, Vec<u8>)> = sqlx::query_as(&self.sql.select_active)
                .bind(queue.as_str())
                .bind(ACTIVE)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| sql_error("pull", e))?;

            let Some((id, producer_id, payload)) = row else {
                return Ok(None);
            };

            let expires_at = Timestamp::now().plus(lease)?;
            let claimed = sqlx::query(&self.sql.claim)
                .bind(expires_at.unix_millis())
                .bind(id)
                .bind(ACTIVE)
                .execute(&self.pool)
                .await
                .map_err(|e| sql_error("pull", e))?
                .rows_affected();

            if claimed == 1 {
                let message_id = MessageId::from(id);
                tracing::debug!(
                    queue = %queue,
                    message_id = %message_id,
                    lease_expiry = %expires_at,
                    "Leased message"
                );
                return Ok(Some(
                    Envelope::new(Bytes::from(payload))
                        .with_producer_id(producer_id)
                        .with_message_id(message_id)
                        .with_lease_expiry(expires_at),
                ));
            }

            tracing::debug!(queue = %queue, id, attempt, "Lost claim race, re-selecting");
        }

        tracing::warn!(
            queue = %queue,
            attempts = MAX_CLAIM_ATTEMPTS,
            "Gave up claiming a message after repeated races"
        );
        Ok(None)
    }

    async fn delete(&self, queue: &QueueName, message_id: &MessageId) -> Result<bool, QueueError> {
        let Ok(id) = message_id.as_str().parse::<i64>() else {
            tracing::debug!(queue = %queue, message_id = %message_id, "Ignoring non-numeric message id");
            return Ok(false);
        };

        self.reclaim(queue, "delete").await?;

        let deleted = sqlx::query(&self.sql.delete)
            .bind(id)
            .bind(queue.as_str())
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| sql_error("delete", e))?
            .rows_affected();

        if deleted > 0 {
            tracing::debug!(queue = %queue, message_id = %message_id, "Deleted message");
        }
        Ok(deleted > 0)
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Database
    }
}

/// Table names are spliced into SQL text, so only plain identifiers pass
fn validate_table_name(table: &str) -> Result<(), ConfigurationError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || table.len() > 63 {
        return Err(ConfigurationError::Invalid {
            message: format!(
                "Invalid table name '{}': use letters, digits and underscores, starting with a letter",
                table
            ),
        });
    }
    Ok(())
}

fn sql_error(operation: &'static str, error: sqlx::Error) -> QueueError {
    QueueError::storage(BackendKind::Database, operation, error)
}

#[cfg(test)]
#[path = "database_tests.rs"]
mod tests;
