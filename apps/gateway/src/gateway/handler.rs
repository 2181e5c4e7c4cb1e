//! Application callbacks invoked by a [`Client`] over its lifetime.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::client::Client;
use super::events::parse_frame;
use super::fanout::{EventBus, FanoutPayload};

pub const EVENT_KEYBOARD: &str = "event_keyboard";

/// Lifecycle hooks for one channel's connections.
///
/// `on_open` runs once before the client is visible to the health monitor,
/// `on_message` for every inbound application event (never ping/pong/ack),
/// and `on_close` exactly once during teardown.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_open(&self, client: &Client);
    async fn on_message(&self, client: &Client, message: &[u8]);
    async fn on_close(&self, client: &Client, code: u16, reason: &str);
}

/// Does nothing.
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {
    async fn on_open(&self, _client: &Client) {}
    async fn on_message(&self, _client: &Client, _message: &[u8]) {}
    async fn on_close(&self, _client: &Client, _code: u16, _reason: &str) {}
}

#[derive(Debug, Deserialize)]
struct InboundEvent {
    event: String,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct KeyboardContent {
    receiver_id: i64,
}

/// Handler for the default chat channel: logs lifecycle and forwards
/// typing indicators to the receiver through the cluster bus.
pub struct DefaultHandler {
    bus: Arc<dyn EventBus>,
}

impl DefaultHandler {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    async fn relay_keyboard(&self, client: &Client, content: serde_json::Value) {
        let keyboard: KeyboardContent = match serde_json::from_value(content) {
            Ok(k) => k,
            Err(e) => {
                tracing::debug!(?e, cid = client.cid(), "keyboard event without receiver");
                return;
            }
        };

        let payload = FanoutPayload::new(
            client.channel().name(),
            vec![keyboard.receiver_id],
            EVENT_KEYBOARD,
            json!({
                "sender_id": client.uid(),
                "receiver_id": keyboard.receiver_id,
            }),
        );
        if let Err(e) = self.bus.publish(&payload).await {
            tracing::warn!(?e, uid = client.uid(), "keyboard relay failed");
        }
    }
}

#[async_trait]
impl EventHandler for DefaultHandler {
    async fn on_open(&self, client: &Client) {
        tracing::debug!(cid = client.cid(), uid = client.uid(), "default channel open");
    }

    async fn on_message(&self, client: &Client, message: &[u8]) {
        let Some(frame) = parse_frame(message) else {
            return;
        };
        let inbound: InboundEvent = match serde_json::from_value(frame) {
            Ok(inbound) => inbound,
            Err(_) => return,
        };

        match inbound.event.as_str() {
            EVENT_KEYBOARD => self.relay_keyboard(client, inbound.content).await,
            other => {
                tracing::debug!(cid = client.cid(), event = other, "unhandled client event");
            }
        }
    }

    async fn on_close(&self, client: &Client, code: u16, reason: &str) {
        tracing::debug!(cid = client.cid(), uid = client.uid(), code, reason, "default channel close");
    }
}
