//! Cluster fan-out: a publish/subscribe bus and the per-process relay that
//! turns bus payloads into writes on locally attached clients.
//!
//! Producers anywhere in the cluster publish to one topic. Every gateway
//! process subscribes and delivers only to the connections it hosts.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

use super::channel::Channel;
use super::client::Client;
use super::events::ClientResponse;
use super::hub::Hub;

pub const FANOUT_TOPIC: &str = "ws:gateway:all";

/// Capacity of the in-process bus. Slow subscribers that fall behind skip
/// payloads.
const LOCAL_BUS_CAPACITY: usize = 4096;

/// An event addressed to users of a channel, wherever they are connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutPayload {
    pub channel: String,
    pub user_ids: Vec<i64>,
    pub event: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub retry: u32,
}

impl FanoutPayload {
    pub fn new(
        channel: impl Into<String>,
        user_ids: Vec<i64>,
        event: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            channel: channel.into(),
            user_ids,
            event: event.into(),
            content,
            ack: false,
            retry: 0,
        }
    }

    pub fn with_ack(mut self, retry: u32) -> Self {
        self.ack = true;
        self.retry = retry;
        self
    }

    fn response(&self) -> ClientResponse {
        let response = ClientResponse::new(self.event.clone(), self.content.clone());
        if self.ack {
            response.with_ack(self.retry)
        } else {
            response
        }
    }
}

pub type BusStream = BoxStream<'static, FanoutPayload>;

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, payload: &FanoutPayload) -> Result<(), StoreError>;
    async fn subscribe(&self) -> Result<BusStream, StoreError>;
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Single-process bus over `tokio::sync::broadcast`. Cloneable.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Arc<FanoutPayload>>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { sender }
    }

    /// Live subscriptions, e.g. to wait for a relay to come up.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, payload: &FanoutPayload) -> Result<(), StoreError> {
        // send() returns Err if there are no subscribers — that's fine.
        let _ = self.sender.send(Arc::new(payload.clone()));
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusStream, StoreError> {
        let rx = self.sender.subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload.as_ref().clone(), rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "fanout subscriber lagged behind bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Redis pub/sub bus
// ---------------------------------------------------------------------------

pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self { client, conn }
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, payload: &FanoutPayload) -> Result<(), StoreError> {
        let body =
            serde_json::to_string(payload).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(FANOUT_TOPIC, body)
            .await
            .map_err(|e| {
                tracing::error!(?e, "redis publish failed");
                StoreError::from(e)
            })
    }

    async fn subscribe(&self) -> Result<BusStream, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(FANOUT_TOPIC).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let body: String = match msg.get_payload() {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(?e, "unreadable fanout message");
                    return None;
                }
            };
            match serde_json::from_str::<FanoutPayload>(&body) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(?e, "malformed fanout payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Bus consumer that delivers payloads to this process's clients. Writes
/// never block, so one slow client cannot stall the bus.
pub struct FanoutRelay {
    hub: Arc<Hub>,
}

impl FanoutRelay {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// Deliver `payload` to every local connection of its users. Returns
    /// how many connections queued it.
    pub async fn deliver(&self, payload: &FanoutPayload) -> usize {
        let Some(channel) = self.hub.channel(&payload.channel) else {
            tracing::debug!(channel = %payload.channel, "fanout for unknown channel");
            return 0;
        };

        let response = payload.response();
        let mut delivered = 0;
        for &uid in &payload.user_ids {
            for client in self.local_clients(&channel, uid).await {
                match client.write(response.reissue()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        tracing::debug!(?e, cid = client.cid(), uid, "fanout write skipped");
                    }
                }
            }
        }
        delivered
    }

    async fn local_clients(&self, channel: &Channel, uid: i64) -> Vec<Arc<Client>> {
        let Some(presence) = self.hub.presence() else {
            return channel.clients_of(uid);
        };
        match presence.client_ids(channel.name(), uid).await {
            Ok(cids) => cids.into_iter().filter_map(|cid| channel.client(cid)).collect(),
            Err(e) => {
                tracing::warn!(?e, uid, "presence lookup failed, scanning channel");
                channel.clients_of(uid)
            }
        }
    }

    /// Consume the bus until `shutdown` fires or the bus ends.
    pub async fn run(self, bus: Arc<dyn EventBus>, shutdown: CancellationToken) {
        let mut stream = match bus.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(?e, "fanout subscribe failed");
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(payload) => {
                        let delivered = self.deliver(&payload).await;
                        tracing::debug!(event = %payload.event, delivered, "fanout delivered");
                    }
                    None => {
                        tracing::warn!("fanout bus closed");
                        break;
                    }
                }
            }
        }
    }
}
