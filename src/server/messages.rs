//! Durable messages and their delivery state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use crate::common::error::{NotifyError, Result};
use crate::common::models::{from_millis, Message, MessageId, MessageKind, NewMessage, UserId};
use crate::common::protocol::ReceiptStatus;
use crate::server::database::Database;

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, kind, title, body, category, payload, created_at, \
     is_delivered, delivered_at, is_read, read_at, idempotency_key";

/// Result of a multi-id delivery or read update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub applied: Vec<MessageId>,
    /// Missing rows or rows owned by another receiver.
    pub rejected: Vec<MessageId>,
    pub failed: Vec<MessageId>,
    /// The transaction could not be used and ids were applied one by one.
    pub fell_back: bool,
}

pub struct MessageStore {
    db: Arc<Database>,
}

fn message_from_row(row: &SqliteRow) -> Message {
    let payload: Option<String> = row.get("payload");
    Message {
        id: row.get("id"),
        sender_id: row.get("sender_id"),
        receiver_id: row.get("receiver_id"),
        kind: MessageKind::parse(row.get::<&str, _>("kind")),
        title: row.get("title"),
        body: row.get("body"),
        category: row.get("category"),
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        created_at: from_millis(row.get("created_at")),
        is_delivered: row.get::<i64, _>("is_delivered") != 0,
        delivered_at: row.get::<Option<i64>, _>("delivered_at").map(from_millis),
        is_read: row.get::<i64, _>("is_read") != 0,
        read_at: row.get::<Option<i64>, _>("read_at").map(from_millis),
        idempotency_key: row.get("idempotency_key"),
    }
}

/// Applies one guarded transition. Already-applied transitions still count as success.
async fn apply_transition(
    conn: &mut SqliteConnection,
    status: ReceiptStatus,
    id: MessageId,
    by: UserId,
) -> std::result::Result<bool, sqlx::Error> {
    let now = Utc::now().timestamp_millis();
    let updated = match status {
        ReceiptStatus::Delivered => {
            sqlx::query(
                "UPDATE messages SET is_delivered = 1, delivered_at = ?
                 WHERE id = ? AND receiver_id = ? AND is_delivered = 0",
            )
            .bind(now)
            .bind(id)
            .bind(by)
            .execute(&mut *conn)
            .await?
        }
        ReceiptStatus::Read => {
            sqlx::query(
                "UPDATE messages SET is_read = 1, read_at = ?, is_delivered = 1,
                 delivered_at = COALESCE(delivered_at, ?)
                 WHERE id = ? AND receiver_id = ? AND is_read = 0",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(by)
            .execute(&mut *conn)
            .await?
        }
    };
    if updated.rows_affected() > 0 {
        return Ok(true);
    }

    let owned = sqlx::query("SELECT 1 FROM messages WHERE id = ? AND receiver_id = ?")
        .bind(id)
        .bind(by)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(owned.is_some())
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Stores a message. A repeated idempotency key for the same sender and receiver returns the first id.
    pub async fn create(&self, new: NewMessage) -> Result<MessageId> {
        let now = Utc::now().timestamp_millis();
        let payload = new.payload.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages
             (sender_id, receiver_id, kind, title, body, category, payload, created_at,
              is_delivered, delivered_at, is_read, read_at, idempotency_key)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?)",
        )
        .bind(new.sender_id)
        .bind(new.receiver_id)
        .bind(new.kind.as_str())
        .bind(&new.title)
        .bind(&new.body)
        .bind(&new.category)
        .bind(payload)
        .bind(now)
        .bind(new.delivered)
        .bind(new.delivered.then_some(now))
        .bind(&new.idempotency_key)
        .execute(&self.db.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(result.last_insert_rowid());
        }

        let Some(key) = &new.idempotency_key else {
            return Err(NotifyError::Validation("message was not stored".into()));
        };
        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM messages
             WHERE COALESCE(sender_id, 0) = COALESCE(?, 0) AND receiver_id = ? AND idempotency_key = ?",
        )
        .bind(new.sender_id)
        .bind(new.receiver_id)
        .bind(key)
        .fetch_one(&self.db.pool)
        .await?;
        debug!("[MSG] Duplicate idempotency key {} resolved to message {}", key, existing);
        Ok(existing)
    }

    pub async fn get(&self, id: MessageId) -> Result<Message> {
        let sql = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db.pool).await?;
        row.as_ref()
            .map(message_from_row)
            .ok_or_else(|| NotifyError::not_found("message", id))
    }

    pub async fn mark_delivered(&self, id: MessageId, by: UserId) -> Result<bool> {
        self.mark(ReceiptStatus::Delivered, id, by).await
    }

    pub async fn mark_read(&self, id: MessageId, by: UserId) -> Result<bool> {
        self.mark(ReceiptStatus::Read, id, by).await
    }

    async fn mark(&self, status: ReceiptStatus, id: MessageId, by: UserId) -> Result<bool> {
        let mut conn = self.db.pool.acquire().await?;
        Ok(apply_transition(&mut conn, status, id, by).await?)
    }

    pub async fn mark_delivered_bulk(&self, ids: &[MessageId], by: UserId) -> BulkOutcome {
        self.mark_bulk(ReceiptStatus::Delivered, ids, by).await
    }

    pub async fn mark_read_bulk(&self, ids: &[MessageId], by: UserId) -> BulkOutcome {
        self.mark_bulk(ReceiptStatus::Read, ids, by).await
    }

    pub async fn mark_bulk(&self, status: ReceiptStatus, ids: &[MessageId], by: UserId) -> BulkOutcome {
        let mut seen = HashSet::new();
        let ids: Vec<MessageId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        match self.mark_bulk_in_transaction(status, &ids, by).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[MSG] Bulk {} update failed ({}), applying ids one by one", status.as_str(), e);
                let mut outcome = BulkOutcome { fell_back: true, ..Default::default() };
                for id in ids {
                    match self.mark(status, id, by).await {
                        Ok(true) => outcome.applied.push(id),
                        Ok(false) => outcome.rejected.push(id),
                        Err(e) => {
                            warn!("[MSG] Could not mark message {} as {}: {}", id, status.as_str(), e);
                            outcome.failed.push(id);
                        }
                    }
                }
                outcome
            }
        }
    }

    async fn mark_bulk_in_transaction(
        &self,
        status: ReceiptStatus,
        ids: &[MessageId],
        by: UserId,
    ) -> std::result::Result<BulkOutcome, sqlx::Error> {
        let mut tx = self.db.pool.begin().await?;
        let mut outcome = BulkOutcome::default();
        for &id in ids {
            if apply_transition(&mut tx, status, id, by).await? {
                outcome.applied.push(id);
            } else {
                outcome.rejected.push(id);
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    /// Chat history between two users, newest first, zero-based pages.
    pub async fn conversation(&self, a: UserId, b: UserId, page: u32, page_size: u32) -> Result<Vec<Message>> {
        let page_size = page_size.max(1);
        let sql = format!(
            "SELECT {} FROM messages
             WHERE kind = 'chat' AND ((sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?))
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(a)
            .bind(b)
            .bind(b)
            .bind(a)
            .bind(i64::from(page_size))
            .bind(i64::from(page) * i64::from(page_size))
            .fetch_all(&self.db.pool)
            .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Undelivered messages for a user, oldest first.
    pub async fn pending_for(&self, user_id: UserId) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE receiver_id = ? AND is_delivered = 0 ORDER BY created_at ASC, id ASC",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.db.pool).await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    pub async fn unread_count(&self, user_id: UserId) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE receiver_id = ? AND is_read = 0")
            .bind(user_id)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(count)
    }

    /// Marks every chat from `other` to `reader` as read. Returns how many rows changed.
    pub async fn mark_conversation_read(&self, reader: UserId, other: UserId) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE messages SET is_read = 1, read_at = ?, is_delivered = 1,
             delivered_at = COALESCE(delivered_at, ?)
             WHERE receiver_id = ? AND sender_id = ? AND is_read = 0",
        )
        .bind(now)
        .bind(now)
        .bind(reader)
        .bind(other)
        .execute(&self.db.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Rows are never removed; deleting hides the message for its receiver by reading it.
    pub async fn soft_delete(&self, id: MessageId, by: UserId) -> Result<bool> {
        self.mark_read(id, by).await
    }

    pub async fn notifications_for(&self, user_id: UserId, unread_only: bool, limit: u32) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE receiver_id = ? AND kind = 'notification' {}
             ORDER BY created_at DESC, id DESC LIMIT ?",
            MESSAGE_COLUMNS,
            if unread_only { "AND is_read = 0" } else { "" }
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(i64::from(limit.max(1)))
            .fetch_all(&self.db.pool)
            .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE is_delivered = 0")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(count)
    }
}
