use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ruggine_notify::common::error::Result;
use ruggine_notify::common::models::{Notification, NotifyTarget, RequestContext, UserId, UserRecord};
use ruggine_notify::common::protocol::ServerFrame;
use ruggine_notify::server::config::ServerConfig;
use ruggine_notify::server::database::Database;
use ruggine_notify::server::directory::SqliteDirectory;
use ruggine_notify::server::push::{DeviceToken, Platform, PushPayload, PushTransport, SqliteTokenRegistry};
use ruggine_notify::server::registry::ConnectionSink;
use ruggine_notify::server::router::{ConnectionContext, NotificationRouter};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(UserId, String)>>,
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn send(&self, token: &DeviceToken, _payload: &PushPayload) -> Result<()> {
        self.sent.lock().unwrap().push((token.user_id, token.token.clone()));
        Ok(())
    }
}

struct Engine {
    router: Arc<NotificationRouter>,
    db: Arc<Database>,
    transport: Arc<RecordingTransport>,
}

async fn engine() -> Engine {
    let db = Arc::new(Database::connect_in_memory().await.unwrap());
    let transport = Arc::new(RecordingTransport::default());
    let (router, _scheduler, due) =
        NotificationRouter::with_sqlite(ServerConfig::default(), db.clone(), transport.clone());
    router.clone().run_scheduled_deliveries(due, CancellationToken::new());
    Engine { router, db, transport }
}

async fn add_user(db: &Arc<Database>, id: UserId, department: &str) {
    SqliteDirectory::new(db.clone())
        .upsert_user(&UserRecord {
            id,
            username: format!("user{}", id),
            department: Some(department.to_string()),
            role: Some("employee".into()),
            is_active: true,
        })
        .await
        .unwrap();
}

async fn connect(router: &NotificationRouter, user_id: UserId) -> (ConnectionContext, mpsc::UnboundedReceiver<Message>) {
    let (sender, rx) = mpsc::unbounded_channel();
    let connection_id = router
        .registry()
        .register(user_id, ConnectionSink { sender, cancel: CancellationToken::new(), device: Some("test".into()) });
    let ctx = ConnectionContext { user_id, connection_id };
    router.on_connected(&ctx).await;
    (ctx, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Message::Text(text) = message {
            frames.push(serde_json::from_str(&text).unwrap());
        }
    }
    frames
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn offline_notification_is_pushed_then_replayed_and_acked() {
    let e = engine().await;
    add_user(&e.db, 7, "finance").await;
    SqliteTokenRegistry::new(e.db.clone()).register_token(7, "iphone-7", Platform::Ios).await.unwrap();

    let id = e
        .router
        .send_notification(7, &Notification::new("Expense approved", "Your claim was approved", "expense"))
        .await
        .unwrap();
    let transport = e.transport.clone();
    eventually(|| transport.sent.lock().unwrap().len() == 1).await;
    assert_eq!(e.transport.sent.lock().unwrap()[0], (7, "iphone-7".to_string()));

    let (ctx, mut rx) = connect(&e.router, 7).await;
    let replayed = drain(&mut rx);
    assert!(matches!(replayed.as_slice(), [ServerFrame::Notification { id: Some(got), .. }] if *got == id));

    let reply = e.router.process_frame(&ctx, &format!(r#"{{"type":"ack","content":"{}"}}"#, id)).await;
    assert_eq!(reply, Some(ServerFrame::AckResult { message_ids: vec![id], rejected: vec![] }));
    assert!(e.router.messages().get(id).await.unwrap().is_delivered);
    assert!(e.router.messages().pending_for(7).await.unwrap().is_empty());
}

#[tokio::test]
async fn queued_chat_is_pushed_then_replayed_on_connect() {
    let e = engine().await;
    add_user(&e.db, 1, "sales").await;
    add_user(&e.db, 4, "sales").await;
    SqliteTokenRegistry::new(e.db.clone()).register_token(4, "pixel-4", Platform::Android).await.unwrap();
    let (_sender, _sender_rx) = connect(&e.router, 1).await;

    let message = e
        .router
        .send_chat_message(RequestContext::new(1), 4, "hi", true, None)
        .await
        .unwrap();
    assert!(!message.is_delivered);
    let transport = e.transport.clone();
    eventually(|| transport.sent.lock().unwrap().len() == 1).await;
    assert_eq!(e.transport.sent.lock().unwrap()[0], (4, "pixel-4".to_string()));

    let pending = e.router.messages().pending_for(4).await.unwrap();
    assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), vec![message.id]);

    let (_receiver, mut rx) = connect(&e.router, 4).await;
    let replayed = drain(&mut rx);
    assert!(
        matches!(replayed.as_slice(), [ServerFrame::NewMessage { message: got }] if got.id == message.id && got.body == "hi"),
        "unexpected replay: {:?}",
        replayed
    );
}

#[tokio::test]
async fn receipts_from_other_users_are_rejected() {
    let e = engine().await;
    let queued = e
        .router
        .send_chat_message(RequestContext::new(1), 2, "see you at 3", true, None)
        .await
        .unwrap();
    let (intruder, _rx) = connect(&e.router, 3).await;

    let reply = e
        .router
        .process_frame(&intruder, &format!(r#"{{"type":"receipt","content":"read:{}"}}"#, queued.id))
        .await;
    assert_eq!(
        reply,
        Some(ServerFrame::ReceiptResult { status: "read".into(), message_ids: vec![], rejected: vec![queued.id] })
    );
    assert!(!e.router.messages().get(queued.id).await.unwrap().is_read);

    let (receiver, _rx) = connect(&e.router, 2).await;
    e.router
        .process_frame(&receiver, &format!(r#"{{"type":"message_receipt","content":"[{}]"}}"#, queued.id))
        .await;
    let stored = e.router.messages().get(queued.id).await.unwrap();
    assert!(stored.is_read && stored.is_delivered);
}

#[tokio::test]
async fn idempotent_chat_send_stores_once() {
    let e = engine().await;
    let first = e
        .router
        .send_chat_message(RequestContext::new(1), 2, "payroll question", true, Some("req-1".into()))
        .await
        .unwrap();
    let retry = e
        .router
        .send_chat_message(RequestContext::new(1), 2, "payroll question", true, Some("req-1".into()))
        .await
        .unwrap();
    assert_eq!(first.id, retry.id);
    assert_eq!(e.router.messages().pending_for(2).await.unwrap().len(), 1);
}

#[tokio::test]
async fn notify_department_reaches_only_that_department() {
    let e = engine().await;
    add_user(&e.db, 1, "hr").await;
    add_user(&e.db, 2, "hr").await;
    add_user(&e.db, 3, "it").await;
    let (_hr, mut hr_rx) = connect(&e.router, 2).await;
    let (_it, mut it_rx) = connect(&e.router, 3).await;
    drain(&mut hr_rx);
    drain(&mut it_rx);

    let stored = e
        .router
        .notify(NotifyTarget::Department("hr".into()), &Notification::new("Training", "Friday 10:00", "event"))
        .await
        .unwrap();
    assert_eq!(stored, 2);
    assert!(matches!(drain(&mut hr_rx).as_slice(), [ServerFrame::Notification { .. }]));
    assert!(drain(&mut it_rx).is_empty());
    assert_eq!(e.router.messages().pending_for(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn presence_events_reach_department_colleagues() {
    let e = engine().await;
    add_user(&e.db, 1, "legal").await;
    add_user(&e.db, 2, "legal").await;
    e.router.clone().spawn_event_fanout(CancellationToken::new());

    let (_watcher, mut watcher_rx) = connect(&e.router, 1).await;
    let (busy, _rx) = connect(&e.router, 2).await;
    drain(&mut watcher_rx);

    e.router
        .process_frame(&busy, r#"{"type":"update_status","status":"busy","message":"in court"}"#)
        .await;

    let is_busy_event = |frame: &ServerFrame| {
        matches!(
            frame,
            ServerFrame::UserStatusChanged { user_id: 2, status_message: Some(m), .. } if m == "in court"
        )
    };
    let mut seen = Vec::new();
    for _ in 0..300 {
        seen.extend(drain(&mut watcher_rx));
        if seen.iter().any(is_busy_event) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen.iter().any(is_busy_event));
}

#[tokio::test]
async fn scheduled_notification_is_delivered_once() {
    let e = engine().await;
    let (_ctx, mut rx) = connect(&e.router, 9).await;
    drain(&mut rx);

    let n = Notification::new("Reminder", "Timesheet closes today", "reminder");
    e.router
        .schedule(vec![9], &n, Utc::now() + chrono::Duration::milliseconds(150))
        .await
        .unwrap();

    let mut frames = Vec::new();
    for _ in 0..300 {
        frames.extend(drain(&mut rx));
        if !frames.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    frames.extend(drain(&mut rx));

    assert_eq!(frames.len(), 1);
    assert!(matches!(&frames[0], ServerFrame::Notification { title, .. } if title == "Reminder"));
    assert!(e.router.list_scheduled(Some(9)).await.unwrap().is_empty());
}
