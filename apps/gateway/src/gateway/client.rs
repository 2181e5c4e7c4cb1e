//! Per-connection state and its two loops.
//!
//! A client is registered with its channel, the presence store, the health
//! monitor and the application handler when it connects, and unregistered
//! from all of them by a single teardown guarded by an atomic
//! open → closing → closed transition.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::error::SocketError;

use super::ack::AckEntry;
use super::channel::Channel;
use super::conn::Connection;
use super::events::{
    parse_frame, ClientResponse, Inbound, CLOSE_NORMAL, CLOSE_WRITE_FAILED,
};
use super::handler::EventHandler;
use super::hub::Hub;

/// Outbound queue capacity when the caller does not choose one.
pub const DEFAULT_BUFFER: usize = 10;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientOptions {
    /// Owning user. Zero for anonymous connections.
    pub uid: i64,
    /// Outbound queue capacity. Zero selects [`DEFAULT_BUFFER`].
    pub buffer: usize,
}

pub struct Client {
    cid: i64,
    uid: i64,
    hub: Arc<Hub>,
    channel: Arc<Channel>,
    conn: Arc<dyn Connection>,
    handler: Arc<dyn EventHandler>,
    /// Unix milliseconds of the last inbound frame.
    last_activity: AtomicI64,
    state: AtomicU8,
    /// Taken (and so closed) by teardown.
    outbound: Mutex<Option<mpsc::Sender<ClientResponse>>>,
    /// Cancelled once both loops have exited.
    finished: CancellationToken,
}

impl Client {
    /// Register a new connection and start its read and write loops.
    pub async fn connect(
        hub: &Arc<Hub>,
        conn: Arc<dyn Connection>,
        channel: Arc<Channel>,
        options: ClientOptions,
        handler: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        let buffer = if options.buffer == 0 {
            DEFAULT_BUFFER
        } else {
            options.buffer
        };
        let (tx, rx) = mpsc::channel(buffer);

        let client = Arc::new(Self {
            cid: hub.next_id(),
            uid: options.uid,
            hub: hub.clone(),
            channel,
            conn,
            handler,
            last_activity: AtomicI64::new(now_ms()),
            state: AtomicU8::new(STATE_OPEN),
            outbound: Mutex::new(Some(tx)),
            finished: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&client);
        client.conn.set_close_handler(Arc::new(move |code, reason| {
            let weak = weak.clone();
            async move {
                if let Some(client) = weak.upgrade() {
                    client.shutdown(code, &reason).await;
                }
            }
            .boxed()
        }));

        if let Some(presence) = hub.presence() {
            if let Err(e) = presence
                .bind(client.channel.name(), client.cid, client.uid)
                .await
            {
                tracing::warn!(?e, cid = client.cid, uid = client.uid, "presence bind failed");
            }
        }

        client.channel.add_client(&client);
        client.handler.on_open(&client).await;
        hub.health().insert(&client);

        let config = hub.config();
        let greeting = ClientResponse::connect(config.heartbeat_interval, config.heartbeat_timeout);
        if let Err(e) = client.write(greeting) {
            tracing::debug!(?e, cid = client.cid, "connect frame not queued");
        }

        let writer = tokio::spawn(client.clone().write_loop(rx));
        let reader = client.clone();
        tokio::spawn(async move {
            reader.clone().read_loop().await;
            let _ = writer.await;
            reader.finished.cancel();
        });

        tracing::info!(
            cid = client.cid,
            uid = client.uid,
            channel = %client.channel.name(),
            "client connected"
        );

        client
    }

    pub fn cid(&self) -> i64 {
        self.cid
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Unix milliseconds of the last inbound frame (or of connecting).
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// True once teardown has started.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_OPEN
    }

    /// Queue an event for delivery.
    ///
    /// Never blocks: a full queue rejects the event with
    /// [`SocketError::QueueFull`] and the event is dropped.
    pub fn write(&self, response: ClientResponse) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }

        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(SocketError::Closed);
        };

        tx.try_send(response).map_err(|e| match e {
            TrySendError::Full(dropped) => {
                tracing::warn!(
                    cid = self.cid,
                    uid = self.uid,
                    event = %dropped.event,
                    "outbound queue full, event dropped"
                );
                SocketError::QueueFull
            }
            TrySendError::Closed(_) => SocketError::Closed,
        })
    }

    /// Tear the client down and close its transport with `code`.
    pub async fn close(&self, code: u16, reason: &str) {
        self.shutdown(code, reason).await;
        self.conn.close(code, reason).await;
    }

    /// Resolves once both loops have exited.
    pub async fn wait(&self) {
        self.finished.cancelled().await;
    }

    /// Runs teardown exactly once across all callers. Returns whether this
    /// call performed it. Leaves the transport to the caller.
    async fn shutdown(&self, code: u16, reason: &str) -> bool {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Dropping the sender lets the write loop drain and exit.
        let _ = self.outbound.lock().take();

        self.handler.on_close(self, code, reason).await;

        if let Some(presence) = self.hub.presence() {
            if let Err(e) = presence.unbind(self.channel.name(), self.cid).await {
                tracing::warn!(?e, cid = self.cid, "presence unbind failed");
            }
        }

        self.hub.health().delete(self.cid);
        self.channel.del_client(self);
        self.state.store(STATE_CLOSED, Ordering::Release);

        tracing::info!(
            cid = self.cid,
            uid = self.uid,
            channel = %self.channel.name(),
            code,
            reason,
            "client closed"
        );
        true
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            match self.conn.read().await {
                Ok(data) => {
                    self.last_activity.store(now_ms(), Ordering::Relaxed);
                    self.dispatch(&data).await;
                }
                Err(e) => {
                    tracing::debug!(?e, cid = self.cid, "read loop ended");
                    break;
                }
            }
        }
        self.close(CLOSE_NORMAL, "connection closed").await;
    }

    async fn write_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ClientResponse>) {
        while let Some(mut response) = rx.recv().await {
            if self.is_closed() {
                break;
            }

            let text = match serde_json::to_string(&response) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(?e, cid = self.cid, event = %response.event, "unserializable event dropped");
                    continue;
                }
            };

            // Registered before the write so an ack that overtakes the
            // write's completion still finds the entry.
            let pending = if response.is_ack && response.retry > 0 {
                response.retry -= 1;
                let sid = response.sid.clone();
                self.hub.acks().insert(
                    sid.clone(),
                    AckEntry::new(self.cid, self.uid, self.channel.name(), response),
                );
                Some(sid)
            } else {
                None
            };

            if let Err(e) = self.conn.write(&text).await {
                if let Some(sid) = pending {
                    self.hub.acks().delete(&sid);
                }
                tracing::warn!(
                    ?e,
                    cid = self.cid,
                    uid = self.uid,
                    channel = %self.channel.name(),
                    "client write failed"
                );
                self.close(CLOSE_WRITE_FAILED, "write failed").await;
                break;
            }
        }
    }

    /// Malformed frames are ignored.
    async fn dispatch(&self, data: &[u8]) {
        let Some(frame) = parse_frame(data) else {
            return;
        };

        match Inbound::classify(&frame) {
            Some(Inbound::Ping) => {
                if let Err(e) = self.write(ClientResponse::pong()) {
                    tracing::debug!(?e, cid = self.cid, "pong not queued");
                }
            }
            Some(Inbound::Pong) => {}
            Some(Inbound::Ack(Some(sid))) => {
                self.hub.acks().delete(sid);
            }
            Some(Inbound::Ack(None)) | None => {}
            Some(Inbound::Event(_)) => self.handler.on_message(self, data).await,
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
