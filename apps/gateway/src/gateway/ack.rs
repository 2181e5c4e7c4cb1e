//! Registry of outbound events awaiting a client `ack`.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::events::ClientResponse;

/// One in-flight event. The entry stands for a single budgeted
/// retransmission: the write loop has already charged it against `retry`.
#[derive(Debug, Clone)]
pub struct AckEntry {
    pub cid: i64,
    pub uid: i64,
    pub channel: String,
    pub response: ClientResponse,
    sent_at: Instant,
}

impl AckEntry {
    pub fn new(cid: i64, uid: i64, channel: impl Into<String>, response: ClientResponse) -> Self {
        Self {
            cid,
            uid,
            channel: channel.into(),
            response,
            sent_at: Instant::now(),
        }
    }

    fn expired(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.sent_at) >= interval
    }
}

/// Shared registry keyed by ack id.
pub struct AckRegistry {
    entries: DashMap<String, AckEntry>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert or refresh the entry for `sid`.
    pub fn insert(&self, sid: impl Into<String>, entry: AckEntry) {
        self.entries.insert(sid.into(), entry);
    }

    /// Returns whether an entry was removed. Unknown ids are a no-op.
    pub fn delete(&self, sid: &str) -> bool {
        self.entries.remove(sid).is_some()
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.entries.contains_key(sid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every entry last sent at least `interval` before
    /// `now`. An entry refreshed or acknowledged between the scan and the
    /// removal is left alone.
    pub fn take_expired(&self, now: Instant, interval: Duration) -> Vec<AckEntry> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expired(now, interval))
            .map(|e| e.key().clone())
            .collect();

        keys.into_iter()
            .filter_map(|sid| {
                self.entries
                    .remove_if(&sid, |_, e| e.expired(now, interval))
                    .map(|(_, e)| e)
            })
            .collect()
    }
}

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new()
    }
}
