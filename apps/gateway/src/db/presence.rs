//! Cluster-visible binding of (channel, connection, user).
//!
//! Every gateway process writes its own bindings under a key space scoped by
//! its server id, so a fan-out consumer on that process can resolve a user to
//! the connection ids it hosts.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::StoreError;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn bind(&self, channel: &str, cid: i64, uid: i64) -> Result<(), StoreError>;
    async fn unbind(&self, channel: &str, cid: i64) -> Result<(), StoreError>;

    /// Connection ids bound to `uid` in `channel` on this server.
    async fn client_ids(&self, channel: &str, uid: i64) -> Result<Vec<i64>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// DashMap-backed presence for single-process deployments and tests.
pub struct MemoryPresence {
    /// (channel, cid) -> uid
    clients: DashMap<(String, i64), i64>,
    /// (channel, uid) -> cids
    users: DashMap<(String, i64), HashSet<i64>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            users: DashMap::new(),
        }
    }
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn bind(&self, channel: &str, cid: i64, uid: i64) -> Result<(), StoreError> {
        self.clients.insert((channel.to_string(), cid), uid);
        self.users
            .entry((channel.to_string(), uid))
            .or_default()
            .insert(cid);
        Ok(())
    }

    async fn unbind(&self, channel: &str, cid: i64) -> Result<(), StoreError> {
        let Some((_, uid)) = self.clients.remove(&(channel.to_string(), cid)) else {
            return Ok(());
        };
        let key = (channel.to_string(), uid);
        if let Some(mut cids) = self.users.get_mut(&key) {
            cids.remove(&cid);
        }
        self.users.remove_if(&key, |_, cids| cids.is_empty());
        Ok(())
    }

    async fn client_ids(&self, channel: &str, uid: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .users
            .get(&(channel.to_string(), uid))
            .map(|cids| cids.iter().copied().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Redis-backed presence.
///
/// Layout, per server and channel:
/// - `ws:{server}:channel:{channel}:client` hash of cid -> uid
/// - `ws:{server}:channel:{channel}:user:{uid}` set of cids
pub struct RedisPresence {
    server_id: String,
    conn: ConnectionManager,
}

impl RedisPresence {
    pub fn new(server_id: impl Into<String>, conn: ConnectionManager) -> Self {
        Self {
            server_id: server_id.into(),
            conn,
        }
    }

    fn client_key(&self, channel: &str) -> String {
        format!("ws:{}:channel:{}:client", self.server_id, channel)
    }

    fn user_key(&self, channel: &str, uid: i64) -> String {
        format!("ws:{}:channel:{}:user:{}", self.server_id, channel, uid)
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn bind(&self, channel: &str, cid: i64, uid: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.client_key(channel), cid, uid)
            .await?;
        conn.sadd::<_, _, ()>(self.user_key(channel, uid), cid).await?;
        Ok(())
    }

    async fn unbind(&self, channel: &str, cid: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let client_key = self.client_key(channel);
        let uid: Option<i64> = conn.hget(&client_key, cid).await?;
        conn.hdel::<_, _, ()>(&client_key, cid).await?;
        if let Some(uid) = uid {
            conn.srem::<_, _, ()>(self.user_key(channel, uid), cid).await?;
        }
        Ok(())
    }

    async fn client_ids(&self, channel: &str, uid: i64) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let cids: Vec<i64> = conn.smembers(self.user_key(channel, uid)).await?;
        Ok(cids)
    }
}
