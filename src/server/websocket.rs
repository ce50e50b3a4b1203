//! Per-connection lifecycle: auth handshake, writer task, heartbeat, idle
//! monitor and the sequential read loop.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::panic::AssertUnwindSafe;

use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::common::models::UserId;
use crate::common::protocol::ServerFrame;
use crate::server::registry::ConnectionSink;
use crate::server::router::{ConnectionContext, NotificationRouter};

#[derive(Debug, Deserialize)]
struct AuthRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(alias = "sessionToken", alias = "session_token")]
    token: String,
}

/// Inbound-activity clock shared by the read loop and the idle monitor.
struct ActivityClock {
    base: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self { base: Instant::now(), last_ms: AtomicU64::new(0) }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.base.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.base + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Runs one authenticated connection until the peer leaves, a write fails,
/// the idle timeout passes or `shutdown` fires. Teardown always runs.
pub async fn handle_connection<S, R, E>(
    router: Arc<NotificationRouter>,
    user_id: UserId,
    device: Option<String>,
    mut sink: S,
    mut stream: R,
    shutdown: &CancellationToken,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let config = router.config().clone();
    let cancel = shutdown.child_token();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection_id = router.registry().register(
        user_id,
        ConnectionSink { sender: tx, cancel: cancel.clone(), device: device.clone() },
    );
    let ctx = ConnectionContext { user_id, connection_id };
    info!(
        "[WS] User {} connected on {} (device={})",
        user_id,
        ctx.connection_id,
        device.as_deref().unwrap_or("unknown")
    );

    let writer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                if let Err(e) = sink.send(message).await {
                    debug!("[WS] Write failed, closing connection: {}", e);
                    cancel.cancel();
                    break;
                }
            }
            let _ = sink.close().await;
        })
    };

    let heartbeat = {
        let cancel = cancel.clone();
        let registry = router.registry().clone();
        let connection_id = ctx.connection_id.clone();
        let every = config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !registry.send_to_connection(&connection_id, Message::Ping(Vec::new())) {
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        })
    };

    let clock = Arc::new(ActivityClock::new());
    let idle_monitor = {
        let cancel = cancel.clone();
        let clock = clock.clone();
        let idle = config.idle_timeout;
        tokio::spawn(async move {
            loop {
                let deadline = clock.last() + idle;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        if clock.last() + idle <= Instant::now() {
                            warn!("[WS] User {} idle for {:?}, closing connection", user_id, idle);
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        })
    };

    let session = async {
        router.on_connected(&ctx).await;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!("[WS] Read error on {}: {}", ctx.connection_id, e);
                    break;
                }
                None => break,
            };
            clock.touch();

            match message {
                Message::Text(text) => {
                    if let Some(reply) = router.process_frame(&ctx, &text).await {
                        router.registry().send_frame(&ctx.connection_id, &reply);
                    }
                }
                Message::Binary(_) => {
                    router
                        .registry()
                        .send_frame(&ctx.connection_id, &ServerFrame::error("Binary frames are not supported"));
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    };
    if AssertUnwindSafe(session).catch_unwind().await.is_err() {
        error!("[WS] Connection {} of user {} panicked, tearing down", ctx.connection_id, user_id);
    }

    cancel.cancel();
    router.on_disconnected(&ctx).await;
    for task in [writer, heartbeat, idle_monitor] {
        if let Err(e) = task.await {
            error!("[WS] Connection task for user {} failed: {}", user_id, e);
        }
    }
    info!("[WS] User {} disconnected from {}", user_id, ctx.connection_id);
}

pub async fn handle_socket<T>(
    router: Arc<NotificationRouter>,
    user_id: UserId,
    device: Option<String>,
    socket: WebSocketStream<T>,
    shutdown: &CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    handle_connection(router, user_id, device, sink, stream, shutdown).await;
}

async fn send_auth_response<T>(socket: &mut WebSocketStream<T>, response: ServerFrame)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match response.to_text() {
        Ok(text) => {
            if let Err(e) = socket.send(Message::Text(text)).await {
                debug!("[WS:AUTH] Could not send auth response: {}", e);
            }
        }
        Err(e) => error!("[WS:AUTH] Could not encode auth response: {}", e),
    }
}

fn auth_failure(reason: &str) -> ServerFrame {
    ServerFrame::AuthResponse { success: false, user_id: None, error: Some(reason.to_string()) }
}

/// Waits for `{"type":"auth","token":...}` and resolves the session. `None` means the socket should be dropped.
pub async fn authenticate<T>(router: &NotificationRouter, socket: &mut WebSocketStream<T>) -> Option<UserId>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let first = tokio::time::timeout(router.config().auth_timeout, socket.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
            debug!("[WS:AUTH] Client left during authentication");
            return None;
        }
        Ok(Some(Ok(_))) => {
            send_auth_response(socket, auth_failure("Expected text message for authentication")).await;
            return None;
        }
        Ok(Some(Err(e))) => {
            debug!("[WS:AUTH] WebSocket error during authentication: {}", e);
            return None;
        }
        Err(_) => {
            warn!("[WS:AUTH] Authentication timeout");
            send_auth_response(socket, auth_failure("Authentication timeout")).await;
            return None;
        }
    };

    let request = match serde_json::from_str::<AuthRequest>(&text) {
        Ok(request) if request.kind == "auth" => request,
        Ok(_) => {
            send_auth_response(socket, auth_failure("Invalid message type, expected 'auth'")).await;
            return None;
        }
        Err(e) => {
            send_auth_response(socket, auth_failure(&format!("Invalid JSON: {}", e))).await;
            return None;
        }
    };

    match router.directory().validate_session(&request.token).await {
        Ok(Some(user_id)) => {
            send_auth_response(
                socket,
                ServerFrame::AuthResponse { success: true, user_id: Some(user_id), error: None },
            )
            .await;
            info!("[WS:AUTH] Authentication successful for user {}", user_id);
            Some(user_id)
        }
        Ok(None) => {
            send_auth_response(socket, auth_failure("Invalid or expired session token")).await;
            None
        }
        Err(e) => {
            warn!("[WS:AUTH] Session lookup failed: {}", e);
            send_auth_response(socket, auth_failure("Authentication unavailable")).await;
            None
        }
    }
}

async fn accept_connection(router: Arc<NotificationRouter>, stream: TcpStream, shutdown: CancellationToken) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".into());
    let mut socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("[WS] Handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let Some(user_id) = authenticate(&router, &mut socket).await else {
        let _ = socket.close(None).await;
        return;
    };
    handle_socket(router, user_id, Some(peer), socket, &shutdown).await;
}

/// Accepts WebSocket clients on `addr` until `shutdown` fires, then waits
/// for every connection to finish its teardown.
pub async fn serve(addr: &str, router: Arc<NotificationRouter>, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("[WS] Listening on {}", listener.local_addr()?);
    let mut connections = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    error!("[WS] Connection task failed: {}", e);
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                connections.spawn(accept_connection(router.clone(), stream, shutdown.clone()));
            }
            Err(e) => {
                warn!("[WS] Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    drop(listener);

    info!("[WS] Listener stopped, waiting for {} connections to close", connections.len());
    while let Some(finished) = connections.join_next().await {
        if let Err(e) = finished {
            error!("[WS] Connection task failed: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::ServerConfig;
    use crate::server::database::Database;
    use crate::server::push::LoggingTransport;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite;

    type Inbound = mpsc::UnboundedSender<Message>;
    type Outbound = mpsc::UnboundedReceiver<Message>;

    async fn router(config: ServerConfig) -> Arc<NotificationRouter> {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        NotificationRouter::with_sqlite(config, db, Arc::new(LoggingTransport)).0
    }

    fn spawn_client(
        router: &Arc<NotificationRouter>,
        user_id: UserId,
        shutdown: &CancellationToken,
    ) -> (Inbound, Outbound, tokio::task::JoinHandle<()>) {
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Message>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
        let sink = Box::pin(futures_util::sink::unfold(out_tx, |out_tx, message: Message| async move {
            out_tx.send(message).map_err(|_| "client gone")?;
            Ok::<_, &str>(out_tx)
        }));
        let stream = stream::poll_fn(move |cx| in_rx.poll_recv(cx)).map(Ok::<Message, tungstenite::Error>);
        let router = router.clone();
        let shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            handle_connection(router, user_id, None, sink, stream, &shutdown).await;
        });
        (in_tx, out_rx, handle)
    }

    async fn next_frame(out: &mut Outbound) -> ServerFrame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), out.recv()).await.unwrap().unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_open() {
        let router = router(ServerConfig::default()).await;
        let shutdown = CancellationToken::new();
        let (inbound, mut outbound, handle) = spawn_client(&router, 1, &shutdown);

        inbound.send(Message::Text("{oops".into())).unwrap();
        assert!(matches!(next_frame(&mut outbound).await, ServerFrame::Error { .. }));
        inbound.send(Message::Text(r#"{"type":"ping"}"#.into())).unwrap();
        assert!(matches!(next_frame(&mut outbound).await, ServerFrame::Pong { .. }));
        assert!(router.registry().is_online(1));

        drop(inbound);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(!router.registry().is_online(1));
    }

    #[tokio::test]
    async fn disconnect_is_announced_and_presence_goes_offline() {
        let router = router(ServerConfig::default()).await;
        let shutdown = CancellationToken::new();
        let (_watcher_in, mut watcher_out, _watcher) = spawn_client(&router, 2, &shutdown);
        wait_until(|| router.registry().is_online(2)).await;

        let (leaving_in, _leaving_out, leaving) = spawn_client(&router, 1, &shutdown);
        assert_eq!(next_frame(&mut watcher_out).await, ServerFrame::UserConnected { user_id: 1 });

        leaving_in.send(Message::Close(None)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), leaving).await.unwrap().unwrap();

        assert_eq!(
            next_frame(&mut watcher_out).await,
            ServerFrame::UserDisconnected { user_id: 1, is_online: false }
        );
        assert_eq!(router.presence_of(1).await.status, crate::common::models::PresenceStatus::Offline);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn idle_connections_are_closed() {
        let config = ServerConfig { idle_timeout: Duration::from_millis(200), ..ServerConfig::default() };
        let router = router(config).await;
        let shutdown = CancellationToken::new();
        let (_inbound, _outbound, handle) = spawn_client(&router, 5, &shutdown);

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(router.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_tears_down_connections() {
        let router = router(ServerConfig::default()).await;
        let shutdown = CancellationToken::new();
        let (_inbound, _outbound, handle) = spawn_client(&router, 6, &shutdown);
        wait_until(|| router.registry().is_online(6)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(!router.registry().is_online(6));
    }

    #[tokio::test]
    async fn transport_panic_still_unregisters() {
        let router = router(ServerConfig::default()).await;
        let shutdown = CancellationToken::new();
        let (out_tx, _out_rx) = mpsc::unbounded_channel::<Message>();
        let sink = Box::pin(futures_util::sink::unfold(out_tx, |out_tx, message: Message| async move {
            out_tx.send(message).map_err(|_| "client gone")?;
            Ok::<_, &str>(out_tx)
        }));
        let mut polled = false;
        let stream = stream::poll_fn(move |_| {
            if polled {
                panic!("transport fault");
            }
            polled = true;
            std::task::Poll::Ready(Some(Ok::<Message, tungstenite::Error>(Message::Text(
                r#"{"type":"ping"}"#.into(),
            ))))
        });

        let task_router = router.clone();
        let handle = tokio::spawn(async move {
            handle_connection(task_router, 8, None, sink, stream, &shutdown).await;
        });

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(router.registry().connection_count(), 0);
        assert_eq!(router.presence_of(8).await.status, crate::common::models::PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn serve_returns_after_shutdown() {
        let router = router(ServerConfig::default()).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), serve("127.0.0.1:0", router, shutdown))
            .await
            .unwrap()
            .unwrap();
    }
}
