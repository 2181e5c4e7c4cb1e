//! Named routing domain of attached clients.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::client::Client;
use super::events::ClientResponse;

/// Channel the WebSocket route attaches connections to.
pub const DEFAULT_CHANNEL: &str = "default";

/// Membership holds weak references; a client's lifetime belongs to its
/// own loops.
pub struct Channel {
    name: String,
    members: DashMap<i64, Weak<Client>>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_client(&self, client: &Arc<Client>) {
        self.members.insert(client.cid(), Arc::downgrade(client));
    }

    pub fn del_client(&self, client: &Client) {
        self.members.remove(&client.cid());
    }

    pub fn has(&self, cid: i64) -> bool {
        self.members.contains_key(&cid)
    }

    pub fn client(&self, cid: i64) -> Option<Arc<Client>> {
        self.members.get(&cid).and_then(|c| c.upgrade())
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Snapshot of the live members.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.members.iter().filter_map(|c| c.upgrade()).collect()
    }

    /// Every live connection of `uid` in this channel.
    pub fn clients_of(&self, uid: i64) -> Vec<Arc<Client>> {
        self.members
            .iter()
            .filter_map(|c| c.upgrade())
            .filter(|c| c.uid() == uid)
            .collect()
    }

    /// Push `event` to every member accepted by `filter`. Returns how many
    /// members queued it; members with a full or closed queue are skipped.
    pub fn broadcast(&self, event: &ClientResponse, filter: impl Fn(&Client) -> bool) -> usize {
        let mut delivered = 0;
        for client in self.clients() {
            if !filter(&client) {
                continue;
            }
            match client.write(event.reissue()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(?e, cid = client.cid(), channel = %self.name, "broadcast skipped member");
                }
            }
        }
        delivered
    }
}
