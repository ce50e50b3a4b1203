//! Read side of the HR user directory, plus the presence rows this engine owns.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::common::error::Result;
use crate::common::models::{from_millis, PresenceRecord, PresenceStatus, UserId, UserRecord};
use crate::server::database::Database;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>>;
    async fn users_in_department(&self, department: &str) -> Result<Vec<UserRecord>>;
    async fn all_users(&self) -> Result<Vec<UserRecord>>;
    /// Resolves a session token to its user, `None` when unknown or expired.
    async fn validate_session(&self, token: &str) -> Result<Option<UserId>>;
    async fn load_presence(&self, user_id: UserId) -> Result<Option<PresenceRecord>>;
    async fn save_presence(&self, record: &PresenceRecord) -> Result<()>;
}

pub struct SqliteDirectory {
    db: Arc<Database>,
}

impl SqliteDirectory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, department, role, is_active, created_at) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username, department = excluded.department,
             role = excluded.role, is_active = excluded.is_active",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.department)
        .bind(&user.role)
        .bind(user.is_active)
        .bind(Utc::now().timestamp())
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn create_session(&self, user_id: UserId, token: &str, ttl: chrono::Duration) -> Result<()> {
        let now = Utc::now();
        sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
            .bind(user_id)
            .bind(token)
            .bind(now.timestamp())
            .bind((now + ttl).timestamp())
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }
}

fn user_from_row(row: &SqliteRow) -> UserRecord {
    UserRecord {
        id: row.get("id"),
        username: row.get("username"),
        department: row.get("department"),
        role: row.get("role"),
        is_active: row.get::<i64, _>("is_active") != 0,
    }
}

#[async_trait]
impl UserDirectory for SqliteDirectory {
    async fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT id, username, department, role, is_active FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn users_in_department(&self, department: &str) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query(
            "SELECT id, username, department, role, is_active FROM users WHERE department = ? AND is_active = 1",
        )
        .bind(department)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query("SELECT id, username, department, role, is_active FROM users WHERE is_active = 1")
            .fetch_all(&self.db.pool)
            .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    async fn validate_session(&self, token: &str) -> Result<Option<UserId>> {
        let user_id = sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?",
        )
        .bind(token)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(user_id)
    }

    async fn load_presence(&self, user_id: UserId) -> Result<Option<PresenceRecord>> {
        let row = sqlx::query(
            "SELECT p.status, p.status_message, p.is_available_for_chat, p.last_activity, p.last_seen, u.department
             FROM presence p LEFT JOIN users u ON u.id = p.user_id WHERE p.user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.db.pool)
        .await?;

        Ok(row.map(|row| PresenceRecord {
            user_id,
            status: row
                .get::<String, _>("status")
                .parse()
                .unwrap_or(PresenceStatus::Offline),
            status_message: row.get("status_message"),
            is_available_for_chat: row.get::<i64, _>("is_available_for_chat") != 0,
            last_activity: from_millis(row.get("last_activity")),
            last_seen: from_millis(row.get("last_seen")),
            department: row.get("department"),
        }))
    }

    async fn save_presence(&self, record: &PresenceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO presence (user_id, status, status_message, is_available_for_chat, last_activity, last_seen)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET status = excluded.status, status_message = excluded.status_message,
             is_available_for_chat = excluded.is_available_for_chat, last_activity = excluded.last_activity,
             last_seen = excluded.last_seen",
        )
        .bind(record.user_id)
        .bind(record.status.as_str())
        .bind(&record.status_message)
        .bind(record.is_available_for_chat)
        .bind(record.last_activity.timestamp_millis())
        .bind(record.last_seen.timestamp_millis())
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }
}
