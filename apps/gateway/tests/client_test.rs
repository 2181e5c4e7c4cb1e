mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use gateway_api::config::SocketConfig;
use gateway_api::db::presence::{MemoryPresence, PresenceStore};
use gateway_api::error::SocketError;
use gateway_api::gateway::ack::AckEntry;
use gateway_api::gateway::client::{Client, ClientOptions};
use gateway_api::gateway::conn::{CloseHandler, Connection, MemoryConnection, MemoryPeer};
use gateway_api::gateway::events::{
    ClientResponse, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL, CLOSE_WRITE_FAILED,
};
use gateway_api::gateway::hub::Hub;

use common::{attach, wait_until, RecordingHandler};

fn hub() -> Arc<Hub> {
    Arc::new(Hub::new(SocketConfig::default(), None))
}

#[tokio::test]
async fn connect_frame_announces_heartbeat() {
    let hub = hub();
    let (conn, mut peer) = MemoryConnection::pair();
    let _client = Client::connect(
        &hub,
        conn,
        hub.register_channel("default"),
        Default::default(),
        Arc::new(RecordingHandler::default()),
    )
    .await;

    let frame = peer.recv().await.unwrap();
    assert_eq!(
        frame,
        json!({"event": "connect", "content": {"ping_interval": 30, "ping_timeout": 60}})
    );
}

#[tokio::test]
async fn events_are_delivered_in_order() {
    let hub = hub();
    let (client, mut peer) = attach(&hub, "default", 1, Arc::new(RecordingHandler::default())).await;

    for n in 0..5 {
        client
            .write(ClientResponse::new("im.message", json!({ "n": n })))
            .unwrap();
    }
    for n in 0..5 {
        assert_eq!(peer.recv().await.unwrap()["content"]["n"], n);
    }
}

#[tokio::test]
async fn open_registers_everywhere() {
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresence::new());
    let hub = Arc::new(Hub::new(SocketConfig::default(), Some(presence.clone())));
    let handler = Arc::new(RecordingHandler::default());
    let (client, _peer) = attach(&hub, "default", 9, handler.clone()).await;

    assert_eq!(handler.open_count(), 1);
    assert!(hub.health().contains(client.cid()));
    assert!(client.channel().has(client.cid()));
    assert_eq!(presence.client_ids("default", 9).await.unwrap(), vec![client.cid()]);
}

#[tokio::test]
async fn concurrent_close_tears_down_once() {
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresence::new());
    let hub = Arc::new(Hub::new(SocketConfig::default(), Some(presence.clone())));
    let handler = Arc::new(RecordingHandler::default());
    let (client, peer) = attach(&hub, "default", 3, handler.clone()).await;
    let cid = client.cid();

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.close(CLOSE_NORMAL, "bye").await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(1), client.wait())
        .await
        .unwrap();

    assert_eq!(handler.close_count(), 1);
    assert_eq!(handler.closes.lock()[0], (cid, CLOSE_NORMAL, "bye".to_string()));
    assert!(!hub.health().contains(cid));
    assert!(!client.channel().has(cid));
    assert!(presence.client_ids("default", 3).await.unwrap().is_empty());
    assert_eq!(
        peer.connection().close_frame(),
        Some((CLOSE_NORMAL, "bye".to_string()))
    );
}

#[tokio::test]
async fn ping_gets_exactly_one_pong() {
    let hub = hub();
    let handler = Arc::new(RecordingHandler::default());
    let (_client, mut peer) = attach(&hub, "default", 1, handler.clone()).await;

    peer.send(&json!({"event": "ping"}));
    assert_eq!(peer.recv().await.unwrap(), json!({"event": "pong"}));
    assert!(peer.recv_within(Duration::from_millis(100)).await.is_none());
    assert!(handler.messages.lock().is_empty());
}

#[tokio::test]
async fn invalid_frames_are_ignored() {
    let hub = hub();
    let handler = Arc::new(RecordingHandler::default());
    let (client, mut peer) = attach(&hub, "default", 1, handler.clone()).await;

    let pending = ClientResponse::new("im.message", json!({})).with_ack(1);
    let pending_sid = pending.sid.clone();
    hub.acks()
        .insert(pending_sid.clone(), AckEntry::new(client.cid(), 1, "default", pending));

    peer.send_raw(b"not json");
    peer.send(&json!([1, 2, 3]));
    peer.send(&json!({"content": "no event"}));
    peer.send(&json!({"event": "ack", "sid": "ack_unknown"}));
    peer.send(&json!({"event": "ping"}));

    assert_eq!(peer.recv().await.unwrap()["event"], "pong");
    assert!(!client.is_closed());
    assert!(handler.messages.lock().is_empty());
    assert_eq!(hub.acks().len(), 1);
    assert!(hub.acks().contains(&pending_sid));
}

#[tokio::test]
async fn application_events_reach_the_handler() {
    let hub = hub();
    let handler = Arc::new(RecordingHandler::default());
    let (_client, peer) = attach(&hub, "default", 1, handler.clone()).await;

    peer.send(&json!({"event": "event_talk", "content": {"text": "hi"}}));
    wait_until(|| handler.messages.lock().len() == 1).await;
    assert_eq!(handler.messages.lock()[0]["content"]["text"], "hi");
}

#[tokio::test]
async fn unacknowledged_event_is_retransmitted_up_to_budget() {
    let hub = hub();
    let (client, mut peer) = attach(&hub, "default", 1, Arc::new(RecordingHandler::default())).await;
    let later = || Instant::now() + Duration::from_secs(3600);

    client
        .write(ClientResponse::new("im.message", json!({"id": 1})).with_ack(2))
        .unwrap();

    // First transmission plus two retransmissions, all with the same sid.
    let first = peer.recv().await.unwrap();
    let sid = first["sid"].as_str().unwrap().to_string();
    assert!(sid.starts_with("ack_"));

    for _ in 0..2 {
        wait_until(|| hub.acks().contains(&sid)).await;
        assert_eq!(hub.resend_expired_acks(later()), 1);
        let again = peer.recv().await.unwrap();
        assert_eq!(again["sid"], sid.as_str());
    }

    // Budget exhausted: nothing left to resend.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!hub.acks().contains(&sid));
    assert_eq!(hub.resend_expired_acks(later()), 0);
    assert!(peer.recv_within(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn acknowledged_event_is_not_retransmitted() {
    let hub = hub();
    let (client, mut peer) = attach(&hub, "default", 1, Arc::new(RecordingHandler::default())).await;

    client
        .write(ClientResponse::new("im.message", json!({"id": 2})).with_ack(3))
        .unwrap();
    let frame = peer.recv().await.unwrap();
    let sid = frame["sid"].as_str().unwrap().to_string();
    wait_until(|| hub.acks().contains(&sid)).await;

    peer.send(&json!({"event": "ack", "sid": sid.as_str()}));
    wait_until(|| !hub.acks().contains(&sid)).await;

    assert_eq!(
        hub.resend_expired_acks(Instant::now() + Duration::from_secs(3600)),
        0
    );
    assert!(peer.recv_within(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn zero_retry_event_is_sent_once_and_not_tracked() {
    let hub = hub();
    let (client, mut peer) = attach(&hub, "default", 1, Arc::new(RecordingHandler::default())).await;

    client
        .write(ClientResponse::new("im.message", json!({})).with_ack(0))
        .unwrap();
    assert!(peer.recv().await.unwrap()["sid"].is_string());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(hub.acks().is_empty());
}

#[tokio::test]
async fn write_failure_closes_the_client() {
    let hub = hub();
    let handler = Arc::new(RecordingHandler::default());
    let (client, peer) = attach(&hub, "default", 1, handler.clone()).await;

    peer.break_writes();
    client
        .write(ClientResponse::new("im.message", json!({})))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), client.wait())
        .await
        .unwrap();
    assert!(client.is_closed());
    assert_eq!(handler.closes.lock()[0].1, CLOSE_WRITE_FAILED);
    assert_eq!(
        peer.connection().close_frame(),
        Some((CLOSE_WRITE_FAILED, "write failed".to_string()))
    );
}

#[tokio::test]
async fn peer_hang_up_unregisters_the_client() {
    let hub = hub();
    let handler = Arc::new(RecordingHandler::default());
    let (client, mut peer) = attach(&hub, "default", 1, handler.clone()).await;
    let cid = client.cid();

    peer.hang_up();
    tokio::time::timeout(Duration::from_secs(1), client.wait())
        .await
        .unwrap();

    assert_eq!(handler.close_count(), 1);
    assert!(!hub.health().contains(cid));
    assert!(!client.channel().has(cid));
}

#[tokio::test]
async fn remote_close_reports_peer_code() {
    let hub = hub();
    let handler = Arc::new(RecordingHandler::default());
    let (client, peer) = attach(&hub, "default", 1, handler.clone()).await;

    peer.remote_close(1001, "leaving");
    tokio::time::timeout(Duration::from_secs(1), client.wait())
        .await
        .unwrap();

    let closes = handler.closes.lock().clone();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].1, 1001);
    assert_eq!(closes[0].2, "leaving");
}

#[tokio::test]
async fn silent_client_is_evicted_by_health_sweep() {
    let hub = hub();
    let handler = Arc::new(RecordingHandler::default());
    let (quiet, peer) = attach(&hub, "default", 1, handler.clone()).await;

    let future = chrono::Utc::now().timestamp_millis() + 120_000;
    let evicted = hub
        .health()
        .sweep_at(future, Duration::from_secs(60))
        .await;

    assert_eq!(evicted, 1);
    assert!(quiet.is_closed());
    assert_eq!(
        peer.connection().close_frame(),
        Some((CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout".to_string()))
    );
    assert!(hub.health().is_empty());
}

#[tokio::test]
async fn active_client_survives_health_sweep() {
    let hub = hub();
    let (client, _peer) = attach(&hub, "default", 1, Arc::new(RecordingHandler::default())).await;

    let evicted = hub.health().sweep(Duration::from_secs(60)).await;
    assert_eq!(evicted, 0);
    assert!(!client.is_closed());
}

/// Transport whose remote end acknowledges an ack-requiring frame before
/// the write of that frame has completed.
struct EagerAckConnection {
    inner: Arc<MemoryConnection>,
    peer: Mutex<MemoryPeer>,
    written: Mutex<Vec<Value>>,
}

#[async_trait::async_trait]
impl Connection for EagerAckConnection {
    async fn read(&self) -> Result<Vec<u8>, SocketError> {
        self.inner.read().await
    }

    async fn write(&self, data: &str) -> Result<(), SocketError> {
        let frame: Value = serde_json::from_str(data).expect("server wrote invalid json");
        if let Some(sid) = frame["sid"].as_str() {
            self.peer.lock().send(&json!({"event": "ack", "sid": sid}));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.written.lock().push(frame);
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) {
        self.inner.close(code, reason).await;
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.inner.set_close_handler(handler);
    }
}

#[tokio::test]
async fn ack_arriving_before_write_completes_stops_retransmission() {
    let hub = hub();
    let (inner, peer) = MemoryConnection::pair();
    let conn = Arc::new(EagerAckConnection {
        inner,
        peer: Mutex::new(peer),
        written: Mutex::new(Vec::new()),
    });
    let client = Client::connect(
        &hub,
        conn.clone(),
        hub.register_channel("default"),
        ClientOptions::default(),
        Arc::new(RecordingHandler::default()),
    )
    .await;

    client
        .write(ClientResponse::new("im.message", json!({"id": 3})).with_ack(2))
        .unwrap();

    // Connect frame plus the event.
    wait_until(|| conn.written.lock().len() == 2).await;
    wait_until(|| hub.acks().is_empty()).await;

    assert_eq!(
        hub.resend_expired_acks(Instant::now() + Duration::from_secs(3600)),
        0
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.written.lock().len(), 2);
}
