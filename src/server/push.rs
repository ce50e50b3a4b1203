//! Best-effort fan-out to mobile and desktop push providers.
//!
//! Payloads are built per platform by pure functions; the provider itself
//! sits behind [`PushTransport`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};
use sqlx::Row;

use crate::common::error::{NotifyError, Result};
use crate::common::models::{from_millis, Notification, UserId};
use crate::server::database::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Ios,
    Android,
    Windows,
    MacOs,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "windows" => Ok(Platform::Windows),
            "macos" | "mac" | "osx" => Ok(Platform::MacOs),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceToken {
    pub token: String,
    pub user_id: UserId,
    pub platform: Platform,
    pub registered_at: DateTime<Utc>,
}

/// Provider-ready body for one device.
#[derive(Debug, Clone, PartialEq)]
pub enum PushPayload {
    Json(Value),
    /// Windows toast XML.
    Toast(String),
}

pub fn build_payload(platform: Platform, notification: &Notification) -> PushPayload {
    match platform {
        Platform::Ios | Platform::MacOs => PushPayload::Json(apns_payload(notification)),
        Platform::Android => PushPayload::Json(fcm_payload(notification)),
        Platform::Windows => PushPayload::Toast(toast_payload(notification)),
    }
}

fn apns_payload(n: &Notification) -> Value {
    let mut payload = json!({
        "aps": {
            "alert": { "title": n.title, "body": n.body },
            "sound": "default",
            "category": n.category,
        }
    });
    if let Some(data) = &n.payload {
        payload["data"] = data.clone();
    }
    payload
}

fn fcm_payload(n: &Notification) -> Value {
    // FCM data values must be strings
    let mut data = json!({ "type": n.category });
    if let Some(extra) = &n.payload {
        data["payload"] = Value::String(extra.to_string());
    }
    json!({
        "notification": { "title": n.title, "body": n.body },
        "data": data,
        "priority": "high",
    })
}

fn toast_payload(n: &Notification) -> String {
    format!(
        "<toast launch=\"{}\"><visual><binding template=\"ToastGeneric\"><text>{}</text><text>{}</text></binding></visual></toast>",
        xml_escape(&n.category),
        xml_escape(&n.title),
        xml_escape(&n.body)
    )
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
pub trait TokenRegistry: Send + Sync {
    async fn tokens_for(&self, user_id: UserId) -> Result<Vec<DeviceToken>>;
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, token: &DeviceToken, payload: &PushPayload) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub delivered: usize,
    /// Tokens whose transport call failed.
    pub failed: Vec<String>,
}

pub struct PushDispatcher {
    tokens: Arc<dyn TokenRegistry>,
    transport: Arc<dyn PushTransport>,
}

impl PushDispatcher {
    pub fn new(tokens: Arc<dyn TokenRegistry>, transport: Arc<dyn PushTransport>) -> Self {
        Self { tokens, transport }
    }

    /// Sends to every registered device of the user. Never fails; problems end up in the report and the log.
    pub async fn dispatch(&self, user_id: UserId, notification: &Notification) -> DispatchReport {
        let mut report = DispatchReport::default();
        let tokens = match self.tokens.tokens_for(user_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("[PUSH] Could not load device tokens for user {}: {}", user_id, e);
                return report;
            }
        };
        if tokens.is_empty() {
            debug!("[PUSH] User {} has no registered devices", user_id);
            return report;
        }

        for token in &tokens {
            report.attempted += 1;
            let payload = build_payload(token.platform, notification);
            match self.transport.send(token, &payload).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("[PUSH] {} push to user {} failed: {}", token.platform, user_id, e);
                    report.failed.push(token.token.clone());
                }
            }
        }
        info!(
            "[PUSH] Dispatched '{}' to user {}: {}/{} devices",
            notification.title, user_id, report.delivered, report.attempted
        );
        report
    }
}

pub struct SqliteTokenRegistry {
    db: Arc<Database>,
}

impl SqliteTokenRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// A token moves to the latest user that registers it.
    pub async fn register_token(&self, user_id: UserId, token: &str, platform: Platform) -> Result<()> {
        if token.trim().is_empty() {
            return Err(NotifyError::Validation("device token is empty".into()));
        }
        sqlx::query(
            "INSERT INTO device_tokens (token, user_id, platform, registered_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(token) DO UPDATE SET user_id = excluded.user_id, platform = excluded.platform,
             registered_at = excluded.registered_at",
        )
        .bind(token)
        .bind(user_id)
        .bind(platform.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn unregister_token(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE token = ?")
            .bind(token)
            .execute(&self.db.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TokenRegistry for SqliteTokenRegistry {
    async fn tokens_for(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        let rows = sqlx::query(
            "SELECT token, user_id, platform, registered_at FROM device_tokens WHERE user_id = ? ORDER BY registered_at",
        )
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;

        let mut tokens = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("platform");
            match raw.parse() {
                Ok(platform) => tokens.push(DeviceToken {
                    token: row.get("token"),
                    user_id: row.get("user_id"),
                    platform,
                    registered_at: from_millis(row.get("registered_at")),
                }),
                Err(e) => warn!("[PUSH] Skipping device token of user {}: {}", user_id, e),
            }
        }
        Ok(tokens)
    }
}

/// Transport used when no provider is wired in: logs what would be sent.
#[derive(Debug, Default)]
pub struct LoggingTransport;

#[async_trait]
impl PushTransport for LoggingTransport {
    async fn send(&self, token: &DeviceToken, payload: &PushPayload) -> Result<()> {
        let body = match payload {
            PushPayload::Json(value) => value.to_string(),
            PushPayload::Toast(xml) => xml.clone(),
        };
        info!("[PUSH] -> {} device of user {}: {}", token.platform, token.user_id, body);
        Ok(())
    }
}
