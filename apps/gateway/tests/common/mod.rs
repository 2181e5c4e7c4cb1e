#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::Value;

use gateway_api::config::{Config, SocketConfig};
use gateway_api::db::kv::{KeyValueStore, MemoryStore};
use gateway_api::db::presence::{MemoryPresence, PresenceStore};
use gateway_api::gateway::client::{Client, ClientOptions};
use gateway_api::gateway::conn::{MemoryConnection, MemoryPeer};
use gateway_api::gateway::fanout::{EventBus, LocalBus};
use gateway_api::gateway::handler::EventHandler;
use gateway_api::gateway::hub::Hub;
use gateway_api::AppState;

pub const TEST_SECRET: &str = "test-secret-do-not-use-in-production";
pub const TEST_GUARD: &str = "api";

pub fn test_config() -> Config {
    Config {
        jwt_secret: TEST_SECRET.to_string(),
        jwt_guard: TEST_GUARD.to_string(),
        port: 0,
        redis_url: None,
        server_id: gateway_common::id::prefixed_ulid(gateway_common::id::prefix::SERVER),
        socket: SocketConfig::default(),
    }
}

/// Build a test AppState with in-memory stores and an in-process bus.
pub fn test_state() -> AppState {
    test_state_with_bus(Arc::new(LocalBus::new()))
}

pub fn test_state_with_bus(bus: Arc<LocalBus>) -> AppState {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresence::new());
    let bus: Arc<dyn EventBus> = bus;
    AppState::new(test_config(), kv, Some(presence), bus)
}

/// Mint a signed token for `user_id` with the test secret and guard.
pub fn mint_token(user_id: i64) -> String {
    mint_token_with(user_id, TEST_GUARD, 300)
}

pub fn mint_token_with(user_id: i64, guard: &str, ttl_secs: i64) -> String {
    let claims = serde_json::json!({
        "sub": user_id.to_string(),
        "guard": guard,
        "exp": chrono::Utc::now().timestamp() + ttl_secs,
    });
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("mint test token")
}

/// Start an actual TCP server in the background.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = gateway_api::routes::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Handler that records every callback.
#[derive(Default)]
pub struct RecordingHandler {
    pub opens: AtomicUsize,
    pub messages: Mutex<Vec<Value>>,
    pub closes: Mutex<Vec<(i64, u16, String)>>,
}

impl RecordingHandler {
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.lock().len()
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
    async fn on_open(&self, _client: &Client) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message(&self, _client: &Client, message: &[u8]) {
        let value = serde_json::from_slice(message).expect("handler got invalid json");
        self.messages.lock().push(value);
    }

    async fn on_close(&self, client: &Client, code: u16, reason: &str) {
        self.closes
            .lock()
            .push((client.cid(), code, reason.to_string()));
    }
}

/// Attach an in-memory client to `channel` and consume its connect frame.
pub async fn attach(
    hub: &Arc<Hub>,
    channel: &str,
    uid: i64,
    handler: Arc<dyn EventHandler>,
) -> (Arc<Client>, MemoryPeer) {
    let (conn, mut peer) = MemoryConnection::pair();
    let client = Client::connect(
        hub,
        conn,
        hub.register_channel(channel),
        ClientOptions { uid, buffer: 0 },
        handler,
    )
    .await;
    let connect = peer.recv().await.expect("connect frame");
    assert_eq!(connect["event"], "connect");
    (client, peer)
}

/// Poll `cond` until it holds, panicking after one second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 1s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
