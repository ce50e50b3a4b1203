// Connects to a running server, authenticates and prints every frame it receives.
// Usage: ws_probe <session-token> [ws://host:port]
use futures_util::{SinkExt, StreamExt};
use ruggine_notify::common::protocol::ServerFrame;
use ruggine_notify::server::config::ServerConfig;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let token = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: ws_probe <session-token> [ws://host:port]"))?;
    let url = args
        .next()
        .unwrap_or_else(|| format!("ws://{}", ServerConfig::from_env().listen_addr()));
    println!("Connecting to {}", url);

    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    socket
        .send(Message::Text(json!({ "type": "auth", "token": token }).to_string()))
        .await?;

    match socket.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text)? {
            ServerFrame::AuthResponse { success: true, user_id, .. } => {
                println!("AUTH -> ok (user {})", user_id.unwrap_or_default());
            }
            other => {
                println!("AUTH -> rejected: {:?}", other);
                return Ok(());
            }
        },
        other => {
            println!("AUTH -> no response: {:?}", other);
            return Ok(());
        }
    }

    socket.send(Message::Text(json!({ "type": "ping" }).to_string())).await?;

    let mut ping_every = tokio::time::interval(Duration::from_secs(20));
    ping_every.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ping_every.tick() => {
                socket.send(Message::Text(json!({ "type": "activity_ping" }).to_string())).await?;
            }
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => println!("<- {:?}", frame),
                    Err(_) => println!("<- (raw) {}", text),
                },
                Some(Ok(Message::Close(frame))) => {
                    println!("Server closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    println!("Connection error: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    let _ = socket.close(None).await;
    Ok(())
}
