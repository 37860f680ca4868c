//! Durable, multi-consumer work queue sharing the lease database.
//!
//! Claims run inside an IMMEDIATE transaction as a single conditional
//! `UPDATE ... RETURNING`, so two claimers (threads or processes) can never
//! receive the same message. Within one queue name, the oldest pending
//! message is always claimed first.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::time::Duration;

use crate::store::{text_enum, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum MessageStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

text_enum!(MessageStatus, "message status", {
    Pending => "pending",
    Claimed => "claimed",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct QueueMessage {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl QueueMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let payload: String = row.get("payload")?;
        let payload = serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Self {
            id: row.get("id")?,
            queue: row.get("queue")?,
            payload,
            status: row.get("status")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            claimed_at: row.get("claimed_at")?,
        })
    }
}

/// Per-status totals for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct QueueCounts {
    pub pending: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
}

const MESSAGE_COLUMNS: &str = "id, queue, payload, status, error, created_at, claimed_at";

#[derive(Debug, Clone)]
pub(crate) struct MessageQueue {
    store: Store,
}

impl MessageQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn enqueue(&self, queue: &str, payload: &serde_json::Value) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(payload)?;
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO message_queue (queue, payload, status, created_at)
             VALUES (?1, ?2, 'pending', ?3)",
            params![queue, payload, Utc::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically takes the oldest pending message, if any.
    pub fn claim(&self, queue: &str) -> Result<Option<QueueMessage>, StoreError> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let message = tx
            .query_row(
                &format!(
                    "UPDATE message_queue SET status = 'claimed', claimed_at = ?2
                     WHERE id = (
                         SELECT id FROM message_queue
                         WHERE queue = ?1 AND status = 'pending'
                         ORDER BY id LIMIT 1
                     )
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                params![queue, Utc::now()],
                QueueMessage::from_row,
            )
            .optional()?;
        tx.commit()?;
        Ok(message)
    }

    /// claimed → completed. False if the message was not claimed.
    pub fn complete(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE message_queue SET status = 'completed', error = NULL
             WHERE id = ?1 AND status = 'claimed'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// claimed → failed. False if the message was not claimed.
    pub fn fail(&self, id: i64, error: &str) -> Result<bool, StoreError> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE message_queue SET status = 'failed', error = ?2
             WHERE id = ?1 AND status = 'claimed'",
            params![id, error],
        )?;
        Ok(changed == 1)
    }

    /// Pending messages in claim order. Never changes status.
    pub fn peek(&self, queue: &str, limit: usize) -> Result<Vec<QueueMessage>, StoreError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message_queue
             WHERE queue = ?1 AND status = 'pending' ORDER BY id LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let messages = stmt
            .query_map(params![queue, limit], QueueMessage::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn get(&self, id: i64) -> Result<Option<QueueMessage>, StoreError> {
        let conn = self.store.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM message_queue WHERE id = ?1"),
                params![id],
                QueueMessage::from_row,
            )
            .optional()?)
    }

    /// Hands claims older than `older_than` back to `pending`.
    pub fn release_stale(&self, queue: &str, older_than: Duration) -> Result<usize, StoreError> {
        let age = chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - age;
        let conn = self.store.conn()?;
        let released = conn.execute(
            "UPDATE message_queue SET status = 'pending', claimed_at = NULL
             WHERE queue = ?1 AND status = 'claimed' AND claimed_at < ?2",
            params![queue, cutoff],
        )?;
        Ok(released)
    }

    pub fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM message_queue WHERE queue = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![queue], |row| {
            Ok((row.get::<_, MessageStatus>(0)?, row.get::<_, u64>(1)?))
        })?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, n) = row?;
            match status {
                MessageStatus::Pending => counts.pending = n,
                MessageStatus::Claimed => counts.claimed = n,
                MessageStatus::Completed => counts.completed = n,
                MessageStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}
