//! Live connections per user, with group membership.
//!
//! Three sharded maps: connection id -> handle, user id -> connection ids,
//! group -> connection ids. A guard on one map is always dropped before
//! another map is touched.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::models::{ConnectionId, UserId};
use crate::common::protocol::ServerFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// What the connection task hands over when it registers.
pub struct ConnectionSink {
    pub sender: UnboundedSender<Message>,
    pub cancel: CancellationToken,
    pub device: Option<String>,
}

pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub device: Option<String>,
    pub groups: HashSet<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: ConnectionState,
    sender: UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Queues a message for the writer task. A closed channel means the
    /// writer is gone, so the connection is flagged and its task cancelled.
    fn push(&mut self, message: Message) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        match self.sender.send(message) {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "[WS] Write to connection {} of user {} failed, scheduling teardown",
                    self.connection_id, self.user_id
                );
                self.state = ConnectionState::Closing;
                self.cancel.cancel();
                false
            }
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    groups: DashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: UserId, connection: ConnectionSink) -> ConnectionId {
        let connection_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.connections.insert(
            connection_id.clone(),
            ConnectionHandle {
                connection_id: connection_id.clone(),
                user_id,
                device: connection.device,
                groups: HashSet::new(),
                connected_at: now,
                last_activity: now,
                state: ConnectionState::Open,
                sender: connection.sender,
                cancel: connection.cancel,
            },
        );
        let total = {
            let mut ids = self.by_user.entry(user_id).or_default();
            ids.insert(connection_id.clone());
            ids.len()
        };
        debug!("[WS] Registered connection {} for user {} (total={})", connection_id, user_id, total);
        connection_id
    }

    /// Idempotent. Releases group memberships and returns the owning user.
    pub fn remove(&self, connection_id: &str) -> Option<UserId> {
        let (_, mut handle) = self.connections.remove(connection_id)?;
        handle.state = ConnectionState::Closed;

        let user_empty = match self.by_user.get_mut(&handle.user_id) {
            Some(mut ids) => {
                ids.remove(connection_id);
                ids.is_empty()
            }
            None => false,
        };
        if user_empty {
            self.by_user.remove_if(&handle.user_id, |_, ids| ids.is_empty());
        }

        for group in &handle.groups {
            self.drop_member(group, connection_id);
        }
        debug!("[WS] Removed connection {} of user {}", connection_id, handle.user_id);
        Some(handle.user_id)
    }

    fn drop_member(&self, group: &str, connection_id: &str) {
        let empty = match self.groups.get_mut(group) {
            Some(mut members) => {
                members.remove(connection_id);
                members.is_empty()
            }
            None => false,
        };
        if empty {
            self.groups.remove_if(group, |_, members| members.is_empty());
        }
    }

    pub fn join_group(&self, connection_id: &str, group: &str) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(mut handle) => {
                handle.groups.insert(group.to_string());
            }
            None => return false,
        }
        self.groups.entry(group.to_string()).or_default().insert(connection_id.to_string());
        true
    }

    pub fn leave_group(&self, connection_id: &str, group: &str) -> bool {
        let was_member = match self.connections.get_mut(connection_id) {
            Some(mut handle) => handle.groups.remove(group),
            None => return false,
        };
        if was_member {
            self.drop_member(group, connection_id);
        }
        true
    }

    pub fn touch(&self, connection_id: &str) {
        if let Some(mut handle) = self.connections.get_mut(connection_id) {
            handle.last_activity = Utc::now();
        }
    }

    pub fn connections_of(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.by_user.get(&user_id).map(|ids| ids.clone()).unwrap_or_default()
    }

    pub fn all_connections(&self) -> HashSet<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn group_members(&self, group: &str) -> HashSet<ConnectionId> {
        self.groups.get(group).map(|ids| ids.clone()).unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.by_user.get(&user_id).map(|ids| !ids.is_empty()).unwrap_or(false)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.by_user
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn send_to_connection(&self, connection_id: &str, message: Message) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(mut handle) => handle.push(message),
            None => false,
        }
    }

    pub fn send_frame(&self, connection_id: &str, frame: &ServerFrame) -> bool {
        match encode(frame) {
            Some(text) => self.send_to_connection(connection_id, Message::Text(text)),
            None => false,
        }
    }

    /// True iff at least one of the user's connections accepted the frame.
    pub fn send_to_user(&self, user_id: UserId, frame: &ServerFrame) -> bool {
        let targets = self.connections_of(user_id);
        if targets.is_empty() {
            return false;
        }
        let Some(text) = encode(frame) else { return false };
        self.fan_out(targets.iter(), &text) > 0
    }

    pub fn send_to_group(&self, group: &str, frame: &ServerFrame) -> usize {
        let targets = self.group_members(group);
        if targets.is_empty() {
            return 0;
        }
        let Some(text) = encode(frame) else { return 0 };
        self.fan_out(targets.iter(), &text)
    }

    pub fn send_to_all(&self, frame: &ServerFrame, excluded: &HashSet<ConnectionId>) -> usize {
        let targets: Vec<ConnectionId> = self
            .all_connections()
            .into_iter()
            .filter(|id| !excluded.contains(id))
            .collect();
        if targets.is_empty() {
            return 0;
        }
        let Some(text) = encode(frame) else { return 0 };
        self.fan_out(targets.iter(), &text)
    }

    fn fan_out<'a>(&self, targets: impl Iterator<Item = &'a ConnectionId>, text: &str) -> usize {
        targets
            .filter(|id| self.send_to_connection(id, Message::Text(text.to_string())))
            .count()
    }
}

fn encode(frame: &ServerFrame) -> Option<String> {
    match frame.to_text() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("[WS] Failed to serialize outbound frame: {}", e);
            None
        }
    }
}
