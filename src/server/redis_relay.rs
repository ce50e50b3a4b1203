//! Shares presence events between server instances over Redis pub/sub.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::error::Result;
use crate::server::events::{EventBus, PresenceEvent};
use crate::server::router::NotificationRouter;

pub const PRESENCE_CHANNEL: &str = "ruggine:presence";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: String,
    pub event: PresenceEvent,
}

/// Decodes a relayed payload, dropping events this instance published itself.
pub fn decode_foreign(payload: &str, instance_id: &str) -> Option<PresenceEvent> {
    match serde_json::from_str::<RelayEnvelope>(payload) {
        Ok(envelope) if envelope.origin != instance_id => Some(envelope.event),
        Ok(_) => None,
        Err(e) => {
            debug!("[REDIS] Ignoring unreadable relay payload: {}", e);
            None
        }
    }
}

pub struct RedisRelay {
    instance_id: String,
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisRelay {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let instance_id = Uuid::new_v4().to_string();
        info!("[REDIS] Presence relay connected as instance {}", instance_id);
        Ok(Self { instance_id, client, publisher })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish(&self, event: PresenceEvent) -> Result<()> {
        let payload = serde_json::to_string(&RelayEnvelope { origin: self.instance_id.clone(), event })?;
        let mut conn = self.publisher.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(PRESENCE_CHANNEL)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Forwards every local presence event to the other instances.
    pub fn spawn_publisher(self: Arc<Self>, events: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("[REDIS] Relay publisher lagged, skipped {} events", skipped);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if let Err(e) = self.publish(event).await {
                    warn!("[REDIS] Failed to relay presence event: {}", e);
                }
            }
        })
    }

    /// Fans out events from other instances to local connections, reconnecting on failure.
    pub fn spawn_subscriber(self: Arc<Self>, router: Arc<NotificationRouter>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.listen(&router) => {
                        if let Err(e) = result {
                            warn!("[REDIS] Subscriber error: {}", e);
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
            info!("[REDIS] Subscriber stopped");
        })
    }

    async fn listen(&self, router: &NotificationRouter) -> Result<()> {
        let connection = self.client.get_async_connection().await?;
        let mut pubsub = connection.into_pubsub();
        pubsub.subscribe(PRESENCE_CHANNEL).await?;
        info!("[REDIS] Subscribed to {}", PRESENCE_CHANNEL);

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    debug!("[REDIS] Unreadable payload: {}", e);
                    continue;
                }
            };
            if let Some(event) = decode_foreign(&payload, &self.instance_id) {
                router.fan_out_event(event);
            }
        }
        warn!("[REDIS] Pub/sub stream ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(origin: &str) -> String {
        serde_json::to_string(&RelayEnvelope {
            origin: origin.into(),
            event: PresenceEvent::AvailabilityChanged { user_id: 3, is_available: true, department: None },
        })
        .unwrap()
    }

    #[test]
    fn own_events_are_not_reapplied() {
        assert!(decode_foreign(&envelope("me"), "me").is_none());
        assert_eq!(decode_foreign(&envelope("other"), "me").map(|e| e.user_id()), Some(3));
    }

    #[test]
    fn garbage_payloads_are_ignored() {
        assert!(decode_foreign("not json", "me").is_none());
        assert!(decode_foreign(r#"{"origin":"x"}"#, "me").is_none());
    }
}
