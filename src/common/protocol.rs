//! JSON frames exchanged over a client connection.
//!
//! Inbound frames are parsed by hand from a `serde_json::Value` because the
//! error replies must distinguish a missing `type`, an unknown `type` and a
//! missing field. Outbound frames are a tagged enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::models::{Message, MessageId, PresenceStatus, UserId};

/// Which transition a receipt applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Delivered,
    Read,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Delivered => "delivered",
            ReceiptStatus::Read => "read",
        }
    }
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Ping,
    Ack { ids: Vec<MessageId> },
    Receipt { ids: Vec<MessageId>, status: ReceiptStatus },
    JoinGroup { group: String },
    LeaveGroup { group: String },
    UpdateStatus { status: PresenceStatus, message: Option<String> },
    SetAvailability { available: bool },
    ActivityPing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    MalformedJson,
    MissingType,
    UnknownType(String),
    MissingField(&'static str),
    InvalidIds(String),
    InvalidStatus(String),
    InvalidAvailability,
}

impl ProtocolError {
    /// Human readable text placed in the `error` frame.
    pub fn message(&self) -> String {
        match self {
            ProtocolError::MalformedJson => "Invalid message format".to_string(),
            ProtocolError::MissingType => "Invalid message format: 'type' field is required".to_string(),
            ProtocolError::UnknownType(t) => format!("Unknown message type: {}", t),
            ProtocolError::MissingField(f) => format!("Missing required field: '{}'", f),
            ProtocolError::InvalidIds(raw) => format!("Invalid message id list: {}", raw),
            ProtocolError::InvalidStatus(raw) => format!("Invalid status value: {}", raw),
            ProtocolError::InvalidAvailability => {
                "Invalid availability value: 'isAvailable' must be a boolean".to_string()
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::MalformedJson | ProtocolError::MissingType => "invalid_format",
            ProtocolError::UnknownType(_) => "unknown_type",
            ProtocolError::MissingField(_) => "missing_field",
            ProtocolError::InvalidIds(_) => "invalid_ids",
            ProtocolError::InvalidStatus(_) => "invalid_status",
            ProtocolError::InvalidAvailability => "invalid_availability",
        }
    }
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<ClientFrame, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::MalformedJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        match kind {
            "ping" => Ok(ClientFrame::Ping),
            "ack" | "message_ack" => Ok(ClientFrame::Ack { ids: parse_ids(&value)? }),
            "receipt" | "message_receipt" => parse_receipt(&value),
            "join_group" => Ok(ClientFrame::JoinGroup { group: required_group(&value)? }),
            "leave_group" => Ok(ClientFrame::LeaveGroup { group: required_group(&value)? }),
            "update_status" | "update_presence" => {
                let raw = value
                    .get("status")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField("status"))?;
                let status = raw
                    .parse::<PresenceStatus>()
                    .map_err(|_| ProtocolError::InvalidStatus(raw.to_string()))?;
                let message = value
                    .get("statusMessage")
                    .or_else(|| value.get("message"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string);
                Ok(ClientFrame::UpdateStatus { status, message })
            }
            "set_availability" | "set_chat_availability" => {
                let available = value
                    .get("isAvailable")
                    .and_then(Value::as_bool)
                    .ok_or(ProtocolError::InvalidAvailability)?;
                Ok(ClientFrame::SetAvailability { available })
            }
            "activity_ping" => Ok(ClientFrame::ActivityPing),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ClientFrame::Ping => "ping",
            ClientFrame::Ack { .. } => "ack",
            ClientFrame::Receipt { .. } => "receipt",
            ClientFrame::JoinGroup { .. } => "join_group",
            ClientFrame::LeaveGroup { .. } => "leave_group",
            ClientFrame::UpdateStatus { .. } => "update_status",
            ClientFrame::SetAvailability { .. } => "set_availability",
            ClientFrame::ActivityPing => "activity_ping",
        }
    }
}

fn required_group(value: &Value) -> Result<String, ProtocolError> {
    value
        .get("group")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .ok_or(ProtocolError::MissingField("group"))
}

fn parse_receipt(value: &Value) -> Result<ClientFrame, ProtocolError> {
    // Compact "<status>:<id>" form.
    if let Some(raw) = value.get("content").and_then(Value::as_str) {
        if let Some((status, id)) = raw.trim().split_once(':') {
            let status = match status.trim().to_ascii_lowercase().as_str() {
                "read" => ReceiptStatus::Read,
                "delivered" => ReceiptStatus::Delivered,
                _ => return Err(ProtocolError::InvalidIds(raw.to_string())),
            };
            let id = id
                .trim()
                .parse::<MessageId>()
                .map_err(|_| ProtocolError::InvalidIds(raw.to_string()))?;
            return Ok(ClientFrame::Receipt { ids: vec![id], status });
        }
    }
    Ok(ClientFrame::Receipt { ids: parse_ids(value)?, status: ReceiptStatus::Read })
}

/// `content` may be a number, a numeric string, a JSON array, or a string holding a JSON array.
fn parse_ids(value: &Value) -> Result<Vec<MessageId>, ProtocolError> {
    let content = value
        .get("content")
        .or_else(|| value.get("messageIds"))
        .or_else(|| value.get("messageId"))
        .ok_or(ProtocolError::MissingField("content"))?;

    let ids = match content {
        Value::Number(n) => n.as_i64().map(|id| vec![id]),
        Value::Array(items) => ids_from_array(items),
        Value::String(s) => {
            let s = s.trim();
            if s.starts_with('[') {
                serde_json::from_str::<Vec<Value>>(s)
                    .ok()
                    .and_then(|items| ids_from_array(&items))
            } else {
                s.parse::<MessageId>().ok().map(|id| vec![id])
            }
        }
        _ => None,
    };

    match ids {
        Some(ids) if !ids.is_empty() => Ok(ids),
        _ => Err(ProtocolError::InvalidIds(content.to_string())),
    }
}

fn ids_from_array(items: &[Value]) -> Option<Vec<MessageId>> {
    items
        .iter()
        .map(|item| match item {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect()
}

/// Everything the server writes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong {
        timestamp: i64,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, rename = "retryAfter", skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    AuthResponse {
        success: bool,
        user_id: Option<UserId>,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AckResult {
        message_ids: Vec<MessageId>,
        rejected: Vec<MessageId>,
    },
    #[serde(rename_all = "camelCase")]
    ReceiptResult {
        status: String,
        message_ids: Vec<MessageId>,
        rejected: Vec<MessageId>,
    },
    GroupJoined {
        group: String,
    },
    GroupLeft {
        group: String,
    },
    #[serde(rename_all = "camelCase")]
    StatusUpdated {
        status: PresenceStatus,
        status_message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AvailabilityUpdated {
        is_available: bool,
    },
    #[serde(rename_all = "camelCase")]
    UserStatusChanged {
        user_id: UserId,
        status: PresenceStatus,
        status_message: Option<String>,
        last_seen: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserAvailabilityChanged {
        user_id: UserId,
        is_available: bool,
    },
    #[serde(rename_all = "camelCase")]
    UserConnected {
        user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    UserDisconnected {
        user_id: UserId,
        is_online: bool,
    },
    NewMessage {
        message: Message,
    },
    #[serde(rename_all = "camelCase")]
    Notification {
        id: Option<MessageId>,
        title: String,
        body: String,
        notification_type: String,
        payload: Option<Value>,
        created_at: DateTime<Utc>,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error { message: message.into(), code: None, retry_after: None }
    }

    pub fn protocol_error(err: &ProtocolError) -> Self {
        ServerFrame::Error {
            message: err.message(),
            code: Some(err.code().to_string()),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        ServerFrame::Error {
            message: format!("Rate limit exceeded. Try again in {} seconds", retry_after_secs),
            code: Some("rate_limited".to_string()),
            retry_after: Some(retry_after_secs),
        }
    }

    pub fn pong() -> Self {
        ServerFrame::Pong { timestamp: Utc::now().timestamp_millis() }
    }

    /// Live representation of a stored message: chats travel whole, notifications flattened.
    pub fn for_message(message: &Message) -> Self {
        match message.kind {
            crate::common::models::MessageKind::Chat => ServerFrame::NewMessage { message: message.clone() },
            crate::common::models::MessageKind::Notification => ServerFrame::Notification {
                id: Some(message.id),
                title: message.title.clone().unwrap_or_default(),
                body: message.body.clone(),
                notification_type: message.category.clone().unwrap_or_default(),
                payload: message.payload.clone(),
                created_at: message.created_at,
            },
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
