use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type MessageId = i64;
pub type ConnectionId = String;

/// Presence state of a user as seen by the other users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    /// Set by the client; the idle sweep never demotes it to `Away`.
    Busy,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "busy" => Ok(PresenceStatus::Busy),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(format!("Invalid status value: {}", other)),
        }
    }
}

/// Per-user presence snapshot owned by the presence store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub status_message: Option<String>,
    pub is_available_for_chat: bool,
    pub last_activity: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub department: Option<String>,
}

impl PresenceRecord {
    pub fn offline(user_id: UserId, department: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            status_message: None,
            is_available_for_chat: true,
            last_activity: now,
            last_seen: now,
            department,
        }
    }
}

/// Row of the durable user directory. Only the fields routing needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub department: Option<String>,
    pub role: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    Notification,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::Notification => "notification",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw == "notification" {
            MessageKind::Notification
        } else {
            MessageKind::Chat
        }
    }
}

/// Durable point-to-point chat message or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: Option<UserId>,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub title: Option<String>,
    pub body: String,
    pub category: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Insert request for the message store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Option<UserId>,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub title: Option<String>,
    pub body: String,
    pub category: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub delivered: bool,
    pub idempotency_key: Option<String>,
}

impl NewMessage {
    pub fn chat(sender_id: UserId, receiver_id: UserId, body: impl Into<String>) -> Self {
        Self {
            sender_id: Some(sender_id),
            receiver_id,
            kind: MessageKind::Chat,
            title: None,
            body: body.into(),
            category: None,
            payload: None,
            delivered: false,
            idempotency_key: None,
        }
    }

    pub fn notification(receiver_id: UserId, notification: &Notification) -> Self {
        Self {
            sender_id: notification.sender_id,
            receiver_id,
            kind: MessageKind::Notification,
            title: Some(notification.title.clone()),
            body: notification.body.clone(),
            category: Some(notification.category.clone()),
            payload: notification.payload.clone(),
            delivered: false,
            idempotency_key: None,
        }
    }

    /// Recipient was observed online at send time.
    pub fn delivered(mut self, delivered: bool) -> Self {
        self.delivered = delivered;
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key.filter(|k| !k.trim().is_empty());
        self
    }
}

/// Content of a notification before it is addressed to concrete users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub category: String,
    pub payload: Option<serde_json::Value>,
    pub sender_id: Option<UserId>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            category: category.into(),
            payload: None,
            sender_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn from_sender(mut self, sender_id: UserId) -> Self {
        self.sender_id = Some(sender_id);
        self
    }
}

/// Addressing for `notify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    User(UserId),
    Department(String),
    All,
}

/// A deferred notification owned by the job scheduler until it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledNotification {
    pub id: String,
    pub user_ids: Vec<UserId>,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub category: String,
    pub payload: Option<serde_json::Value>,
    pub deliver_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledNotification {
    pub fn notification(&self) -> Notification {
        Notification {
            title: self.title.clone(),
            body: self.body.clone(),
            category: self.category.clone(),
            payload: self.payload.clone(),
            sender_id: None,
        }
    }

    pub fn targets(&self, user_id: UserId) -> bool {
        self.user_ids.contains(&user_id)
    }
}

/// Identity of the caller of an outbound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: UserId,
}

impl RequestContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

/// Millisecond timestamps are what the SQLite tables store.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Away".parse::<PresenceStatus>(), Ok(PresenceStatus::Away));
        assert_eq!(" BUSY ".parse::<PresenceStatus>(), Ok(PresenceStatus::Busy));
        assert!("sleeping".parse::<PresenceStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&PresenceStatus::Online).unwrap();
        assert_eq!(json, "\"online\"");
    }

    #[test]
    fn blank_idempotency_key_is_dropped() {
        let msg = NewMessage::chat(1, 2, "hi").with_idempotency_key(Some("  ".into()));
        assert!(msg.idempotency_key.is_none());
        let msg = NewMessage::chat(1, 2, "hi").with_idempotency_key(Some("k-1".into()));
        assert_eq!(msg.idempotency_key.as_deref(), Some("k-1"));
    }

    #[test]
    fn scheduled_notification_targets_listed_users_only() {
        let now = Utc::now();
        let job = ScheduledNotification {
            id: "job".into(),
            user_ids: vec![3, 4],
            title: "t".into(),
            body: "b".into(),
            category: "reminder".into(),
            payload: None,
            deliver_at: now,
            created_at: now,
        };
        assert!(job.targets(3));
        assert!(!job.targets(5));
        assert_eq!(job.notification().category, "reminder");
    }
}
