//! Wire format of the client-facing protocol.
//!
//! Every frame is a JSON object with at least an `event` field. Three event
//! names are reserved: `ping`, `pong`, and `ack` (which echoes a `sid`).

use std::borrow::Cow;
use std::time::Duration;

use gateway_common::id::{prefix, prefixed_ulid};
use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Reserved event names
// ---------------------------------------------------------------------------

pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_PING: &str = "ping";
pub const EVENT_PONG: &str = "pong";
pub const EVENT_ACK: &str = "ack";

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// The outbound loop could not write to the transport.
pub const CLOSE_WRITE_FAILED: u16 = 4000;
/// The health sweep found the client silent past the heartbeat timeout.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// One server-to-client push.
///
/// Only `sid`, `event` and `content` go on the wire; the ack bookkeeping
/// stays server-side.
#[derive(Debug, Clone, Serialize)]
pub struct ClientResponse {
    #[serde(skip)]
    pub is_ack: bool,
    /// Retransmissions still allowed while unacknowledged.
    #[serde(skip)]
    pub retry: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sid: String,
    pub event: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub content: Value,
}

impl ClientResponse {
    pub fn new(event: impl Into<String>, content: Value) -> Self {
        Self {
            is_ack: false,
            retry: 0,
            sid: String::new(),
            event: event.into(),
            content,
        }
    }

    /// Require acknowledgement, allowing up to `retry` retransmissions.
    pub fn with_ack(mut self, retry: u32) -> Self {
        self.is_ack = true;
        self.retry = retry;
        self.sid = prefixed_ulid(prefix::ACK);
        self
    }

    /// Clone with a new correlation id, for delivering the same
    /// ack-requiring event to several connections.
    pub fn reissue(&self) -> Self {
        let mut copy = self.clone();
        if copy.is_ack {
            copy.sid = prefixed_ulid(prefix::ACK);
        }
        copy
    }

    /// First frame after a connection is established.
    pub fn connect(heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Self {
        Self::new(
            EVENT_CONNECT,
            serde_json::json!({
                "ping_interval": heartbeat_interval.as_secs(),
                "ping_timeout": heartbeat_timeout.as_secs(),
            }),
        )
    }

    pub fn pong() -> Self {
        Self::new(EVENT_PONG, Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// An inbound frame, classified.
#[derive(Debug, PartialEq)]
pub enum Inbound<'a> {
    Ping,
    Pong,
    /// Acknowledgement; `None` when the frame carried no usable `sid`.
    Ack(Option<&'a str>),
    /// Any other event, handed to the application untouched.
    Event(Cow<'a, str>),
}

impl<'a> Inbound<'a> {
    /// Classify a parsed frame. Returns `None` when the frame has no usable
    /// `event`.
    ///
    /// Numeric and boolean names are read as their text (`{"event":5}` is
    /// event `"5"`). Null, object and array names are ignored.
    pub fn classify(frame: &'a Value) -> Option<Self> {
        let event = event_name(frame.get("event")?)?;
        let reserved = match event.as_ref() {
            EVENT_PING => Some(Self::Ping),
            EVENT_PONG => Some(Self::Pong),
            EVENT_ACK => Some(Self::Ack(
                frame.get("sid").and_then(Value::as_str).filter(|s| !s.is_empty()),
            )),
            _ => None,
        };
        Some(match reserved {
            Some(inbound) => inbound,
            None => Self::Event(event),
        })
    }
}

fn event_name(value: &Value) -> Option<Cow<'_, str>> {
    let name = match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        Value::Number(n) => Cow::Owned(n.to_string()),
        Value::Bool(b) => Cow::Owned(b.to_string()),
        _ => return None,
    };
    (!name.is_empty()).then_some(name)
}

/// Parse raw bytes into a JSON object. Anything that is not a JSON object is
/// ignored by the caller.
pub fn parse_frame(data: &[u8]) -> Option<Value> {
    serde_json::from_slice::<Value>(data)
        .ok()
        .filter(Value::is_object)
}
