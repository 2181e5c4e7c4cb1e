//! Liveness registry and heartbeat eviction.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;

use super::client::{now_ms, Client};
use super::events::CLOSE_HEARTBEAT_TIMEOUT;

/// Every live client of the process, by connection id. The last-activity
/// timestamp is read from the client itself at sweep time.
pub struct HealthMonitor {
    entries: DashMap<i64, Weak<Client>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, client: &Arc<Client>) {
        self.entries.insert(client.cid(), Arc::downgrade(client));
    }

    pub fn delete(&self, cid: i64) {
        self.entries.remove(&cid);
    }

    pub fn contains(&self, cid: i64) -> bool {
        self.entries.contains_key(&cid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clients silent for longer than `timeout` as of `now_ms`. Entries
    /// whose client is already gone are pruned.
    pub fn stale(&self, now_ms: i64, timeout: Duration) -> Vec<Arc<Client>> {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let mut stale = Vec::new();
        let mut dead = Vec::new();

        for entry in self.entries.iter() {
            match entry.value().upgrade() {
                Some(client) if now_ms.saturating_sub(client.last_activity()) > timeout_ms => {
                    stale.push(client)
                }
                Some(_) => {}
                None => dead.push(*entry.key()),
            }
        }

        for cid in dead {
            self.entries.remove_if(&cid, |_, c| c.strong_count() == 0);
        }

        stale
    }

    /// Force-close every stale client. Returns how many were evicted.
    pub async fn sweep_at(&self, now_ms: i64, timeout: Duration) -> usize {
        let stale = self.stale(now_ms, timeout);
        for client in &stale {
            tracing::info!(
                cid = client.cid(),
                uid = client.uid(),
                idle_ms = now_ms - client.last_activity(),
                "heartbeat timeout"
            );
        }
        futures_util::future::join_all(
            stale
                .iter()
                .map(|c| c.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout")),
        )
        .await;
        stale.len()
    }

    pub async fn sweep(&self, timeout: Duration) -> usize {
        self.sweep_at(now_ms(), timeout).await
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
