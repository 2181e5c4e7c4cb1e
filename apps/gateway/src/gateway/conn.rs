//! Transport abstraction under a [`Client`](super::client::Client).
//!
//! A connection is read by exactly one task and written by exactly one task,
//! so each direction sits behind its own async mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SocketError;

use super::events::CLOSE_NORMAL;

/// Upper bound on flushing a close frame to a peer that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Invoked with the peer's close code and reason when it closes first.
pub type CloseHandler = Arc<dyn Fn(u16, String) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Connection: Send + Sync {
    /// Block until the next data frame arrives. Any error is terminal.
    async fn read(&self) -> Result<Vec<u8>, SocketError>;

    async fn write(&self, data: &str) -> Result<(), SocketError>;

    /// Close the transport with a code the peer can read. Wakes a pending
    /// `read`. Idempotent.
    async fn close(&self, code: u16, reason: &str);

    fn set_close_handler(&self, handler: CloseHandler);
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

pub struct WsConnection {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WebSocket>>,
    closed: CancellationToken,
    closing: AtomicBool,
    close_handler: Mutex<Option<CloseHandler>>,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            close_handler: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn read(&self) -> Result<Vec<u8>, SocketError> {
        let mut stream = self.stream.lock().await;
        loop {
            let msg = tokio::select! {
                _ = self.closed.cancelled() => return Err(SocketError::Closed),
                msg = stream.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().as_bytes().to_vec()),
                Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (f.code, f.reason.as_str().to_string()))
                        .unwrap_or((CLOSE_NORMAL, String::new()));
                    // The peer initiated; the websocket layer answers the close itself.
                    self.closing.store(true, Ordering::Release);
                    self.closed.cancel();
                    let handler = self.close_handler.lock().clone();
                    if let Some(handler) = handler {
                        handler(code, reason).await;
                    }
                    return Err(SocketError::Closed);
                }
                Some(Err(e)) => return Err(SocketError::Transport(e.to_string())),
                None => return Err(SocketError::Closed),
            }
        }
    }

    async fn write(&self, data: &str) -> Result<(), SocketError> {
        if self.closed.is_cancelled() {
            return Err(SocketError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(data.to_string().into()))
            .await
            .map_err(|e| SocketError::Transport(e.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();

        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        let flush = async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(frame).await;
            let _ = sink.close().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, flush).await.is_err() {
            tracing::debug!(code, "close frame not flushed before timeout");
        }
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self.close_handler.lock() = Some(handler);
    }
}

// ---------------------------------------------------------------------------
// In-memory (tests and in-process embedding)
// ---------------------------------------------------------------------------

enum Frame {
    Data(Vec<u8>),
    Close(u16, String),
}

/// A connection whose far end is a [`MemoryPeer`].
pub struct MemoryConnection {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    outbound: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    closing: AtomicBool,
    close_frame: Mutex<Option<(u16, String)>>,
    close_handler: Mutex<Option<CloseHandler>>,
    fail_writes: AtomicBool,
}

/// The remote side of a [`MemoryConnection`].
pub struct MemoryPeer {
    conn: Arc<MemoryConnection>,
    inbound: Option<mpsc::UnboundedSender<Frame>>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl MemoryConnection {
    pub fn pair() -> (Arc<Self>, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            inbound: tokio::sync::Mutex::new(in_rx),
            outbound: out_tx,
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            close_frame: Mutex::new(None),
            close_handler: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
        });
        let peer = MemoryPeer {
            conn: conn.clone(),
            inbound: Some(in_tx),
            outbound: out_rx,
        };
        (conn, peer)
    }

    /// The code and reason passed to `close`, if it was called.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.close_frame.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn read(&self) -> Result<Vec<u8>, SocketError> {
        let mut inbound = self.inbound.lock().await;
        let frame = tokio::select! {
            _ = self.closed.cancelled() => return Err(SocketError::Closed),
            frame = inbound.recv() => frame,
        };

        match frame {
            Some(Frame::Data(data)) => Ok(data),
            Some(Frame::Close(code, reason)) => {
                self.closing.store(true, Ordering::Release);
                self.closed.cancel();
                let handler = self.close_handler.lock().clone();
                if let Some(handler) = handler {
                    handler(code, reason).await;
                }
                Err(SocketError::Closed)
            }
            None => Err(SocketError::Transport("peer hung up".to_string())),
        }
    }

    async fn write(&self, data: &str) -> Result<(), SocketError> {
        if self.closed.is_cancelled() {
            return Err(SocketError::Closed);
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(SocketError::Transport("broken pipe".to_string()));
        }
        self.outbound
            .send(data.to_string())
            .map_err(|_| SocketError::Closed)
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_frame.lock() = Some((code, reason.to_string()));
        self.closed.cancel();
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self.close_handler.lock() = Some(handler);
    }
}

impl MemoryPeer {
    pub fn connection(&self) -> &Arc<MemoryConnection> {
        &self.conn
    }

    pub fn send(&self, frame: &Value) {
        self.send_raw(frame.to_string().as_bytes());
    }

    pub fn send_raw(&self, data: &[u8]) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Frame::Data(data.to_vec()));
        }
    }

    /// Next frame the server wrote, waiting up to one second.
    pub async fn recv(&mut self) -> Option<Value> {
        self.recv_within(Duration::from_secs(1)).await
    }

    pub async fn recv_within(&mut self, wait: Duration) -> Option<Value> {
        let text = tokio::time::timeout(wait, self.outbound.recv())
            .await
            .ok()??;
        serde_json::from_str(&text).ok()
    }

    /// Drop the inbound side, as an abrupt disconnect would.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Send a close frame, as a well-behaved remote would.
    pub fn remote_close(&self, code: u16, reason: &str) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Frame::Close(code, reason.to_string()));
        }
    }

    /// Make every subsequent server write fail.
    pub fn break_writes(&self) {
        self.conn.fail_writes.store(true, Ordering::Release);
    }
}
