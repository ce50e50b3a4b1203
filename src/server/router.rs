//! Routes inbound client frames and outbound messages/notifications.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::error::{NotifyError, Result};
use crate::common::models::{
    ConnectionId, Message, MessageId, NewMessage, Notification, NotifyTarget, PresenceRecord, RequestContext,
    ScheduledNotification, UserId,
};
use crate::common::protocol::{ClientFrame, ServerFrame};
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::directory::{SqliteDirectory, UserDirectory};
use crate::server::events::{EventBus, PresenceEvent};
use crate::server::messages::MessageStore;
use crate::server::presence::PresenceStore;
use crate::server::push::{PushDispatcher, PushTransport, SqliteTokenRegistry};
use crate::server::rate_limiter::{RateDecision, RateLimiter};
use crate::server::registry::ConnectionRegistry;
use crate::server::scheduler::{JobScheduler, LocalScheduler, NOTIFICATION_JOB};

/// Group every connection of a department member joins on connect.
pub fn department_group(department: &str) -> String {
    format!("dept:{}", department)
}

/// The connection an inbound frame arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub targets: usize,
    pub persisted: usize,
    /// Targets that accepted the live frame; their rows are marked delivered.
    pub live: usize,
    /// Targets whose persistence did not finish before the broadcast timeout.
    pub unconfirmed: Vec<UserId>,
    pub failed: Vec<UserId>,
}

pub struct RouterDeps {
    pub config: ServerConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceStore>,
    pub limiter: Arc<RateLimiter>,
    pub messages: Arc<MessageStore>,
    pub push: Arc<PushDispatcher>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub directory: Arc<dyn UserDirectory>,
    pub events: EventBus,
}

pub struct NotificationRouter {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceStore>,
    limiter: Arc<RateLimiter>,
    messages: Arc<MessageStore>,
    push: Arc<PushDispatcher>,
    scheduler: Arc<dyn JobScheduler>,
    directory: Arc<dyn UserDirectory>,
    events: EventBus,
    // serializes connect/disconnect hooks of the same user
    lifecycle: DashMap<UserId, Arc<Mutex<()>>>,
}

impl NotificationRouter {
    pub fn new(deps: RouterDeps) -> Self {
        Self {
            config: deps.config,
            registry: deps.registry,
            presence: deps.presence,
            limiter: deps.limiter,
            messages: deps.messages,
            push: deps.push,
            scheduler: deps.scheduler,
            directory: deps.directory,
            events: deps.events,
            lifecycle: DashMap::new(),
        }
    }

    /// Wires every collaborator against one SQLite database.
    pub fn with_sqlite(
        config: ServerConfig,
        db: Arc<Database>,
        transport: Arc<dyn PushTransport>,
    ) -> (Arc<Self>, Arc<LocalScheduler>, UnboundedReceiver<ScheduledNotification>) {
        let directory = Arc::new(SqliteDirectory::new(db.clone()));
        let events = EventBus::new();
        let presence = Arc::new(PresenceStore::new(
            directory.clone(),
            events.clone(),
            config.away_after,
            config.offline_after,
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_messages,
            config.rate_limit_window,
            config.rate_window_ttl,
        ));
        let push = Arc::new(PushDispatcher::new(Arc::new(SqliteTokenRegistry::new(db.clone())), transport));
        let messages = Arc::new(MessageStore::new(db.clone()));
        let (scheduler, due) = LocalScheduler::new(Some(db));
        let scheduler = Arc::new(scheduler);

        let router = Self::new(RouterDeps {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            presence,
            limiter,
            messages,
            push,
            scheduler: scheduler.clone(),
            directory,
            events,
        });
        (Arc::new(router), scheduler, due)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn messages(&self) -> &Arc<MessageStore> {
        &self.messages
    }

    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ---- inbound ----

    /// Handles one text frame from a connection and returns the reply, if any.
    pub async fn process_frame(&self, ctx: &ConnectionContext, text: &str) -> Option<ServerFrame> {
        match AssertUnwindSafe(self.process_frame_inner(ctx, text)).catch_unwind().await {
            Ok(reply) => reply,
            Err(_) => {
                error!("[WS] Processing a frame from user {} panicked", ctx.user_id);
                Some(ServerFrame::error("Failed to process message"))
            }
        }
    }

    async fn process_frame_inner(&self, ctx: &ConnectionContext, text: &str) -> Option<ServerFrame> {
        if let RateDecision::Limited { retry_after_secs, .. } = self.limiter.check(ctx.user_id) {
            return Some(ServerFrame::rate_limited(retry_after_secs));
        }

        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[WS] Rejected frame from user {}: {}", ctx.user_id, e.message());
                return Some(ServerFrame::protocol_error(&e));
            }
        };

        self.registry.touch(&ctx.connection_id);
        if !matches!(frame, ClientFrame::Ping | ClientFrame::UpdateStatus { .. }) {
            self.presence.record_activity(ctx.user_id).await;
        }

        let type_name = frame.type_name();
        match AssertUnwindSafe(self.handle_frame(ctx, frame)).catch_unwind().await {
            Ok(reply) => reply,
            Err(_) => {
                error!("[WS] Handler for '{}' from user {} panicked", type_name, ctx.user_id);
                Some(ServerFrame::error(format!("Failed to process {}", type_name)))
            }
        }
    }

    async fn handle_frame(&self, ctx: &ConnectionContext, frame: ClientFrame) -> Option<ServerFrame> {
        match frame {
            ClientFrame::Ping => Some(ServerFrame::pong()),
            ClientFrame::Ack { ids } => {
                let outcome = self.messages.mark_delivered_bulk(&ids, ctx.user_id).await;
                if outcome.applied.is_empty() && !outcome.failed.is_empty() {
                    return Some(ServerFrame::error("Failed to update message status"));
                }
                let mut rejected = outcome.rejected;
                rejected.extend(outcome.failed);
                Some(ServerFrame::AckResult { message_ids: outcome.applied, rejected })
            }
            ClientFrame::Receipt { ids, status } => {
                let outcome = self.messages.mark_bulk(status, &ids, ctx.user_id).await;
                if outcome.applied.is_empty() && !outcome.failed.is_empty() {
                    return Some(ServerFrame::error("Failed to update message status"));
                }
                let mut rejected = outcome.rejected;
                rejected.extend(outcome.failed);
                Some(ServerFrame::ReceiptResult {
                    status: status.as_str().to_string(),
                    message_ids: outcome.applied,
                    rejected,
                })
            }
            ClientFrame::JoinGroup { group } => {
                if !self.registry.join_group(&ctx.connection_id, &group) {
                    return Some(ServerFrame::error("Connection is not registered"));
                }
                debug!("[WS] User {} joined group {}", ctx.user_id, group);
                Some(ServerFrame::GroupJoined { group })
            }
            ClientFrame::LeaveGroup { group } => {
                if !self.registry.leave_group(&ctx.connection_id, &group) {
                    return Some(ServerFrame::error("Connection is not registered"));
                }
                Some(ServerFrame::GroupLeft { group })
            }
            ClientFrame::UpdateStatus { status, message } => {
                self.presence.update_status(ctx.user_id, status, message.clone()).await;
                Some(ServerFrame::StatusUpdated { status, status_message: message })
            }
            ClientFrame::SetAvailability { available } => {
                self.presence.set_chat_availability(ctx.user_id, available).await;
                Some(ServerFrame::AvailabilityUpdated { is_available: available })
            }
            ClientFrame::ActivityPing => None,
        }
    }

    // ---- connection lifecycle ----

    fn lifecycle_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.lifecycle.entry(user_id).or_default().clone()
    }

    pub async fn on_connected(&self, ctx: &ConnectionContext) {
        let user_id = ctx.user_id;
        let lock = self.lifecycle_lock(user_id);
        let _guard = lock.lock().await;
        self.presence.mark_connected(user_id).await;

        let record = self.presence.get_record(user_id).await;
        if let Some(department) = &record.department {
            self.registry.join_group(&ctx.connection_id, &department_group(department));
        }

        let own = self.registry.connections_of(user_id);
        self.registry.send_to_all(&ServerFrame::UserConnected { user_id }, &own);
        self.replay_pending(ctx).await;
    }

    /// Re-sends undelivered messages, oldest first; they stay pending until acked.
    async fn replay_pending(&self, ctx: &ConnectionContext) {
        let pending = match self.messages.pending_for(ctx.user_id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("[WS] Could not load pending messages for user {}: {}", ctx.user_id, e);
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        let sent = pending
            .iter()
            .filter(|message| self.registry.send_frame(&ctx.connection_id, &ServerFrame::for_message(message)))
            .count();
        info!("[WS] Replayed {}/{} pending messages to user {}", sent, pending.len(), ctx.user_id);
    }

    /// Presence only goes Offline when no connection of the user is left once the hook holds the user's lock.
    pub async fn on_disconnected(&self, ctx: &ConnectionContext) {
        let lock = self.lifecycle_lock(ctx.user_id);
        let is_online = {
            let _guard = lock.lock().await;
            let Some(user_id) = self.registry.remove(&ctx.connection_id) else { return };
            let is_online = self.registry.is_online(user_id);
            self.registry.send_to_all(&ServerFrame::UserDisconnected { user_id, is_online }, &HashSet::new());
            if !is_online {
                self.presence.mark_disconnected(user_id).await;
            }
            is_online
        };
        drop(lock);
        if !is_online {
            self.lifecycle.remove_if(&ctx.user_id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    // ---- outbound ----

    /// Persists a notification for one user and delivers it live, or by push when offline.
    pub async fn send_notification(&self, user_id: UserId, notification: &Notification) -> Result<MessageId> {
        let online = self.registry.is_online(user_id);
        let id = self
            .messages
            .create(NewMessage::notification(user_id, notification).delivered(online))
            .await?;

        if online {
            let frame = notification_frame(id, notification);
            if self.registry.send_to_user(user_id, &frame) {
                return Ok(id);
            }
            warn!("[WS] Live delivery of notification {} to user {} failed, falling back to push", id, user_id);
        }
        self.spawn_push(user_id, notification.clone());
        Ok(id)
    }

    fn spawn_push(&self, user_id: UserId, notification: Notification) {
        let push = self.push.clone();
        tokio::spawn(async move {
            push.dispatch(user_id, &notification).await;
        });
    }

    /// Notifies every active user (of `department`, when given) except the sender.
    pub async fn broadcast(
        &self,
        notification: &Notification,
        sender: Option<UserId>,
        department: Option<&str>,
    ) -> Result<BroadcastReport> {
        let users = match department {
            Some(department) => self.directory.users_in_department(department).await?,
            None => self.directory.all_users().await?,
        };
        let targets: Vec<UserId> = users.into_iter().map(|u| u.id).filter(|id| Some(*id) != sender).collect();
        let mut report = BroadcastReport { targets: targets.len(), ..Default::default() };

        let mut tasks = JoinSet::new();
        let mut outstanding: HashSet<UserId> = targets.iter().copied().collect();
        // rows start pending; only a confirmed live send marks them delivered
        for user_id in targets {
            let messages = self.messages.clone();
            let new = NewMessage::notification(user_id, notification);
            tasks.spawn(async move { (user_id, messages.create(new).await) });
        }

        let mut stored: Vec<(UserId, MessageId)> = Vec::new();
        let deadline = tokio::time::sleep(self.config.broadcast_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((user_id, result))) => {
                        outstanding.remove(&user_id);
                        match result {
                            Ok(id) => stored.push((user_id, id)),
                            Err(e) => {
                                warn!("[WS] Broadcast persistence for user {} failed: {}", user_id, e);
                                report.failed.push(user_id);
                            }
                        }
                    }
                    Some(Err(e)) => warn!("[WS] Broadcast persistence task failed: {}", e),
                },
                _ = &mut deadline => {
                    tasks.detach_all();
                    break;
                }
            }
        }
        report.persisted = stored.len();
        report.unconfirmed = outstanding.into_iter().collect();
        report.unconfirmed.sort_unstable();
        if !report.unconfirmed.is_empty() {
            warn!(
                "[WS] Broadcast '{}' left {} targets unconfirmed after {:?}",
                notification.title,
                report.unconfirmed.len(),
                self.config.broadcast_timeout
            );
        }

        // each stored target gets a frame carrying its own ackable id
        let mut delivered = Vec::new();
        for (user_id, id) in &stored {
            if self.registry.send_to_user(*user_id, &notification_frame(*id, notification)) {
                delivered.push((*user_id, *id));
            } else {
                self.spawn_push(*user_id, notification.clone());
            }
        }
        for (user_id, id) in &delivered {
            if let Err(e) = self.messages.mark_delivered(*id, *user_id).await {
                warn!("[WS] Could not mark broadcast message {} delivered for user {}: {}", id, user_id, e);
            }
        }
        report.live = delivered.len();

        // unconfirmed rows may still land as pending; they replay on connect
        for user_id in &report.unconfirmed {
            if !self.registry.is_online(*user_id) {
                self.spawn_push(*user_id, notification.clone());
            }
        }
        info!(
            "[WS] Broadcast '{}': {} targets, {} stored, {} live",
            notification.title, report.targets, report.persisted, report.live
        );
        Ok(report)
    }

    pub async fn send_chat_message(
        &self,
        ctx: RequestContext,
        receiver_id: UserId,
        body: &str,
        queue_if_offline: bool,
        idempotency_key: Option<String>,
    ) -> Result<Message> {
        if ctx.user_id <= 0 {
            return Err(NotifyError::Unauthenticated);
        }
        if body.trim().is_empty() {
            return Err(NotifyError::Validation("message body is empty".into()));
        }
        if body.chars().count() > self.config.max_message_length {
            return Err(NotifyError::Validation(format!(
                "message too long (max {} chars)",
                self.config.max_message_length
            )));
        }

        let online = self.registry.is_online(receiver_id);
        if !online && !queue_if_offline {
            return Err(NotifyError::RecipientOffline(receiver_id));
        }

        let id = self
            .messages
            .create(
                NewMessage::chat(ctx.user_id, receiver_id, body)
                    .delivered(online)
                    .with_idempotency_key(idempotency_key),
            )
            .await?;
        let message = self.messages.get(id).await?;
        let frame = ServerFrame::for_message(&message);

        if online {
            if !self.registry.send_to_user(receiver_id, &frame) {
                warn!("[WS] Live delivery of message {} to user {} failed", id, receiver_id);
            }
        } else {
            let preview = Notification::new("New message", preview(body), "chat_message").from_sender(ctx.user_id);
            self.spawn_push(receiver_id, preview);
        }
        self.registry.send_to_user(ctx.user_id, &frame);
        Ok(message)
    }

    pub async fn schedule(
        &self,
        user_ids: Vec<UserId>,
        notification: &Notification,
        deliver_at: DateTime<Utc>,
    ) -> Result<String> {
        let now = Utc::now();
        if deliver_at <= now {
            return Err(NotifyError::Validation("delivery time must be in the future".into()));
        }
        if user_ids.is_empty() {
            return Err(NotifyError::Validation("scheduled notification has no recipients".into()));
        }
        let job = ScheduledNotification {
            id: Uuid::new_v4().to_string(),
            user_ids,
            title: notification.title.clone(),
            body: notification.body.clone(),
            category: notification.category.clone(),
            payload: notification.payload.clone(),
            deliver_at,
            created_at: now,
        };
        self.scheduler.schedule(NOTIFICATION_JOB, job).await
    }

    pub async fn cancel_scheduled(&self, id: &str) -> Result<bool> {
        self.scheduler.cancel(NOTIFICATION_JOB, id).await
    }

    pub async fn list_scheduled(&self, user_id: Option<UserId>) -> Result<Vec<ScheduledNotification>> {
        self.scheduler.list(NOTIFICATION_JOB, user_id).await
    }

    /// Returns how many messages were stored.
    pub async fn notify(&self, target: NotifyTarget, notification: &Notification) -> Result<usize> {
        match target {
            NotifyTarget::User(user_id) => self.send_notification(user_id, notification).await.map(|_| 1),
            NotifyTarget::Department(department) => {
                let report = self.broadcast(notification, notification.sender_id, Some(&department)).await?;
                Ok(report.persisted)
            }
            NotifyTarget::All => {
                let report = self.broadcast(notification, notification.sender_id, None).await?;
                Ok(report.persisted)
            }
        }
    }

    pub async fn presence_of(&self, user_id: UserId) -> PresenceRecord {
        self.presence.get_record(user_id).await
    }

    // ---- background work ----

    /// Sends one presence event to the user's department group, or to everyone.
    pub fn fan_out_event(&self, event: PresenceEvent) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let frame = event.to_frame();
            let reached = match event.department() {
                Some(department) => registry.send_to_group(&department_group(department), &frame),
                None => registry.send_to_all(&frame, &HashSet::new()),
            };
            debug!("[PRESENCE] Event for user {} reached {} connections", event.user_id(), reached);
        });
    }

    pub fn spawn_event_fanout(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => self.fan_out_event(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("[PRESENCE] Event fan-out lagged, skipped {} events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Delivers scheduled notifications as the scheduler hands them out.
    pub fn run_scheduled_deliveries(
        self: Arc<Self>,
        mut due: UnboundedReceiver<ScheduledNotification>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = due.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let notification = job.notification();
                for user_id in &job.user_ids {
                    if let Err(e) = self.send_notification(*user_id, &notification).await {
                        warn!("[SCHED] Scheduled notification {} for user {} failed: {}", job.id, user_id, e);
                    }
                }
                info!("[SCHED] Delivered scheduled notification {} to {} users", job.id, job.user_ids.len());
            }
        })
    }
}

fn notification_frame(id: MessageId, notification: &Notification) -> ServerFrame {
    ServerFrame::Notification {
        id: Some(id),
        title: notification.title.clone(),
        body: notification.body.clone(),
        notification_type: notification.category.clone(),
        payload: notification.payload.clone(),
        created_at: Utc::now(),
    }
}

fn preview(body: &str) -> String {
    const MAX: usize = 80;
    if body.chars().count() <= MAX {
        return body.to_string();
    }
    let mut cut: String = body.chars().take(MAX).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::{PresenceStatus, UserRecord};
    use crate::server::push::LoggingTransport;
    use crate::server::registry::ConnectionSink;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct Harness {
        router: Arc<NotificationRouter>,
        directory: SqliteDirectory,
    }

    async fn harness() -> Harness {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        let (router, _, _) = NotificationRouter::with_sqlite(ServerConfig::default(), db.clone(), Arc::new(LoggingTransport));
        Harness { router, directory: SqliteDirectory::new(db) }
    }

    fn connect(router: &NotificationRouter, user_id: UserId) -> (ConnectionContext, mpsc::UnboundedReceiver<WsMessage>) {
        let (sender, rx) = mpsc::unbounded_channel();
        let connection_id = router.registry().register(
            user_id,
            ConnectionSink { sender, cancel: CancellationToken::new(), device: None },
        );
        (ConnectionContext { user_id, connection_id }, rx)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> Vec<ServerFrame> {
        let mut out = Vec::new();
        while let Ok(WsMessage::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn ping_and_errors_keep_connection_usable() {
        let h = harness().await;
        let (ctx, _rx) = connect(&h.router, 1);

        assert!(matches!(h.router.process_frame(&ctx, r#"{"type":"ping"}"#).await, Some(ServerFrame::Pong { .. })));
        let Some(ServerFrame::Error { message, .. }) = h.router.process_frame(&ctx, "not json").await else {
            panic!("expected an error frame");
        };
        assert_eq!(message, "Invalid message format");
        let Some(ServerFrame::Error { message, .. }) = h.router.process_frame(&ctx, r#"{"content":1}"#).await else {
            panic!("expected an error frame");
        };
        assert_eq!(message, "Invalid message format: 'type' field is required");
        assert!(h.router.process_frame(&ctx, r#"{"type":"activity_ping"}"#).await.is_none());
    }

    #[tokio::test]
    async fn rate_limit_rejects_with_retry_hint() {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        let config = ServerConfig { rate_limit_messages: 2, ..ServerConfig::default() };
        let (router, _, _) = NotificationRouter::with_sqlite(config, db, Arc::new(LoggingTransport));
        let (ctx, _rx) = connect(&router, 1);

        router.process_frame(&ctx, r#"{"type":"ping"}"#).await;
        router.process_frame(&ctx, r#"{"type":"ping"}"#).await;
        let Some(ServerFrame::Error { code, retry_after, .. }) = router.process_frame(&ctx, r#"{"type":"ping"}"#).await
        else {
            panic!("expected rate limit error");
        };
        assert_eq!(code.as_deref(), Some("rate_limited"));
        assert!(retry_after.unwrap() >= 1);
    }

    #[tokio::test]
    async fn status_update_is_not_activity() {
        let h = harness().await;
        let (ctx, _rx) = connect(&h.router, 3);
        h.router.on_connected(&ctx).await;

        let reply = h.router.process_frame(&ctx, r#"{"type":"update_status","status":"away"}"#).await;
        assert_eq!(reply, Some(ServerFrame::StatusUpdated { status: PresenceStatus::Away, status_message: None }));
        assert_eq!(h.router.presence_of(3).await.status, PresenceStatus::Away);

        h.router.process_frame(&ctx, r#"{"type":"ping"}"#).await;
        assert_eq!(h.router.presence_of(3).await.status, PresenceStatus::Away);
        h.router.process_frame(&ctx, r#"{"type":"join_group","group":"g"}"#).await;
        assert_eq!(h.router.presence_of(3).await.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn chat_requires_sender_and_online_or_queue() {
        let h = harness().await;
        let err = h.router.send_chat_message(RequestContext::new(0), 2, "hi", true, None).await.unwrap_err();
        assert!(matches!(err, NotifyError::Unauthenticated));

        let err = h.router.send_chat_message(RequestContext::new(1), 2, "hi", false, None).await.unwrap_err();
        assert!(matches!(err, NotifyError::RecipientOffline(2)));
        assert_eq!(h.router.messages().pending_count().await.unwrap(), 0);

        let queued = h.router.send_chat_message(RequestContext::new(1), 2, "hi", true, None).await.unwrap();
        assert!(!queued.is_delivered);
    }

    #[tokio::test]
    async fn live_chat_reaches_receiver_and_echoes_to_sender() {
        let h = harness().await;
        let (_a, mut rx_a) = connect(&h.router, 1);
        let (_b, mut rx_b) = connect(&h.router, 2);

        let message = h.router.send_chat_message(RequestContext::new(1), 2, "lunch?", false, None).await.unwrap();
        assert!(message.is_delivered);
        assert_eq!(frames(&mut rx_b), vec![ServerFrame::NewMessage { message: message.clone() }]);
        assert_eq!(frames(&mut rx_a), vec![ServerFrame::NewMessage { message }]);
    }

    #[tokio::test]
    async fn schedule_in_the_past_is_rejected() {
        let h = harness().await;
        let n = Notification::new("Reminder", "Submit timesheet", "reminder");
        let err = h.router.schedule(vec![1], &n, Utc::now() - chrono::Duration::seconds(1)).await.unwrap_err();
        assert!(matches!(err, NotifyError::Validation(_)));

        let id = h.router.schedule(vec![1], &n, Utc::now() + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(h.router.list_scheduled(Some(1)).await.unwrap().len(), 1);
        assert!(h.router.cancel_scheduled(&id).await.unwrap());
        assert!(h.router.list_scheduled(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn department_broadcast_skips_sender_and_other_departments() {
        let h = harness().await;
        for (id, dept) in [(1, "hr"), (2, "hr"), (3, "hr"), (4, "it")] {
            h.directory
                .upsert_user(&UserRecord {
                    id,
                    username: format!("u{}", id),
                    department: Some(dept.into()),
                    role: None,
                    is_active: true,
                })
                .await
                .unwrap();
        }
        let (ctx2, mut rx2) = connect(&h.router, 2);
        h.router.on_connected(&ctx2).await;
        frames(&mut rx2);

        let n = Notification::new("Policy", "New leave policy", "announcement").from_sender(1);
        let report = h.router.broadcast(&n, Some(1), Some("hr")).await.unwrap();

        assert_eq!(report.targets, 2);
        assert_eq!(report.persisted, 2);
        assert!(report.unconfirmed.is_empty());
        assert_eq!(report.live, 1);
        assert!(matches!(frames(&mut rx2).as_slice(), [ServerFrame::Notification { .. }]));
        assert_eq!(h.router.messages().pending_for(3).await.unwrap().len(), 1);
        assert!(h.router.messages().pending_for(4).await.unwrap().is_empty());
    }

    async fn add_users(directory: &SqliteDirectory, users: &[(UserId, &str)]) {
        for (id, dept) in users {
            directory
                .upsert_user(&UserRecord {
                    id: *id,
                    username: format!("u{}", id),
                    department: Some(dept.to_string()),
                    role: None,
                    is_active: true,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn department_broadcast_follows_membership_not_group_edits() {
        let h = harness().await;
        add_users(&h.directory, &[(1, "hr"), (2, "hr"), (9, "it")]).await;
        let (ctx2, mut rx2) = connect(&h.router, 2);
        h.router.on_connected(&ctx2).await;
        let (ctx9, mut rx9) = connect(&h.router, 9);
        h.router.on_connected(&ctx9).await;
        h.router.process_frame(&ctx2, r#"{"type":"leave_group","group":"dept:hr"}"#).await;
        h.router.process_frame(&ctx9, r#"{"type":"join_group","group":"dept:hr"}"#).await;
        frames(&mut rx2);
        frames(&mut rx9);

        let n = Notification::new("Payroll", "Payslips are out", "announcement").from_sender(1);
        let report = h.router.broadcast(&n, Some(1), Some("hr")).await.unwrap();

        assert_eq!(report.targets, 1);
        assert_eq!(report.live, 1);
        let received = frames(&mut rx2);
        let [ServerFrame::Notification { id: Some(id), .. }] = received.as_slice() else {
            panic!("expected one notification with an id, got {:?}", received);
        };
        assert!(h.router.messages().get(*id).await.unwrap().is_delivered);
        assert!(frames(&mut rx9).is_empty());
    }

    #[tokio::test]
    async fn broadcast_row_stays_pending_when_live_send_fails() {
        let h = harness().await;
        add_users(&h.directory, &[(1, "hr"), (3, "hr")]).await;
        let (_ctx3, rx3) = connect(&h.router, 3);
        drop(rx3);

        let n = Notification::new("Policy", "Updated handbook", "announcement");
        let report = h.router.broadcast(&n, Some(1), Some("hr")).await.unwrap();

        assert_eq!(report.persisted, 1);
        assert_eq!(report.live, 0);
        assert_eq!(h.router.messages().pending_for(3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconnect_during_disconnect_stays_online() {
        let h = harness().await;
        let (old, _old_rx) = connect(&h.router, 5);
        h.router.on_connected(&old).await;

        let router = h.router.clone();
        let reconnect = async move {
            let (ctx, rx) = connect(&router, 5);
            router.on_connected(&ctx).await;
            (ctx, rx)
        };
        let (_, (_new, _new_rx)) = tokio::join!(h.router.on_disconnected(&old), reconnect);

        assert!(h.router.registry().is_online(5));
        assert_eq!(h.router.presence_of(5).await.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn last_disconnect_goes_offline() {
        let h = harness().await;
        let (a, _rx_a) = connect(&h.router, 6);
        let (b, _rx_b) = connect(&h.router, 6);
        h.router.on_connected(&a).await;
        h.router.on_connected(&b).await;

        h.router.on_disconnected(&a).await;
        assert_eq!(h.router.presence_of(6).await.status, PresenceStatus::Online);
        h.router.on_disconnected(&b).await;
        assert_eq!(h.router.presence_of(6).await.status, PresenceStatus::Offline);
    }
}
