//! In-process bus for presence changes.
//!
//! Publishers never wait on subscribers: a subscriber that falls behind
//! sees `RecvError::Lagged` and skips ahead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::common::models::{PresenceStatus, UserId};
use crate::common::protocol::ServerFrame;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceEvent {
    StatusChanged {
        user_id: UserId,
        status: PresenceStatus,
        status_message: Option<String>,
        department: Option<String>,
        last_seen: DateTime<Utc>,
    },
    AvailabilityChanged {
        user_id: UserId,
        is_available: bool,
        department: Option<String>,
    },
}

impl PresenceEvent {
    pub fn user_id(&self) -> UserId {
        match self {
            PresenceEvent::StatusChanged { user_id, .. } => *user_id,
            PresenceEvent::AvailabilityChanged { user_id, .. } => *user_id,
        }
    }

    pub fn department(&self) -> Option<&str> {
        match self {
            PresenceEvent::StatusChanged { department, .. } => department.as_deref(),
            PresenceEvent::AvailabilityChanged { department, .. } => department.as_deref(),
        }
    }

    pub fn to_frame(&self) -> ServerFrame {
        match self {
            PresenceEvent::StatusChanged { user_id, status, status_message, last_seen, .. } => {
                ServerFrame::UserStatusChanged {
                    user_id: *user_id,
                    status: *status,
                    status_message: status_message.clone(),
                    last_seen: *last_seen,
                }
            }
            PresenceEvent::AvailabilityChanged { user_id, is_available, .. } => {
                ServerFrame::UserAvailabilityChanged { user_id: *user_id, is_available: *is_available }
            }
        }
    }
}

/// Cloneable handle to the presence event channel; passed explicitly to whoever needs it.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PresenceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Returns how many subscribers were handed the event.
    pub fn publish(&self, event: PresenceEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.sender.subscribe()
    }
}
