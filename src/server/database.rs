use std::str::FromStr;

use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("[DB] Connecting to database: {}", database_url);

        // Extract file path from database URL to create directory if needed
        let file_path = if let Some(rest) = database_url.strip_prefix("sqlite://") {
            rest.split('?').next().unwrap_or(rest)
        } else if let Some(rest) = database_url.strip_prefix("sqlite:") {
            rest.split('?').next().unwrap_or(rest)
        } else {
            database_url
        };

        if file_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    debug!("[DB] Creating directory {:?}", parent);
                    std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("[DB] Database connection ready");
        Ok(Self { pool })
    }

    /// A private in-memory database; one connection so every query sees the same data.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users (owned by the HR application, read here for routing)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                department TEXT,
                role TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Sessions
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id INTEGER NOT NULL,
                session_token TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Presence snapshots
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS presence (
                user_id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                status_message TEXT,
                is_available_for_chat INTEGER NOT NULL DEFAULT 1,
                last_activity INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Messages and notifications
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id INTEGER,
                receiver_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                title TEXT,
                body TEXT NOT NULL,
                category TEXT,
                payload TEXT,
                created_at INTEGER NOT NULL,
                is_delivered INTEGER NOT NULL DEFAULT 0,
                delivered_at INTEGER,
                is_read INTEGER NOT NULL DEFAULT 0,
                read_at INTEGER,
                idempotency_key TEXT
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_idempotency
            ON messages (COALESCE(sender_id, 0), receiver_id, idempotency_key)
            WHERE idempotency_key IS NOT NULL;
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE INDEX IF NOT EXISTS idx_messages_pending
            ON messages (receiver_id, is_delivered);
        "#).execute(&self.pool).await?;

        // Push device tokens
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS device_tokens (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                platform TEXT NOT NULL,
                registered_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Scheduled notifications waiting for their delivery time
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS scheduled_notifications (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                job TEXT NOT NULL,
                deliver_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        Ok(())
    }
}
