//! Process-wide gateway services, owned and injected rather than global.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gateway_common::SequenceGenerator;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SocketConfig;
use crate::db::presence::PresenceStore;

use super::ack::AckRegistry;
use super::channel::Channel;
use super::client::Client;
use super::health::HealthMonitor;

/// How often the ack sweep looks for overdue events.
const ACK_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Floor for sweep periods; `tokio::time::interval` rejects zero.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

pub struct Hub {
    config: SocketConfig,
    ids: SequenceGenerator,
    health: HealthMonitor,
    acks: AckRegistry,
    channels: DashMap<String, Arc<Channel>>,
    presence: Option<Arc<dyn PresenceStore>>,
}

impl Hub {
    pub fn new(config: SocketConfig, presence: Option<Arc<dyn PresenceStore>>) -> Self {
        Self {
            config,
            ids: SequenceGenerator::new(),
            health: HealthMonitor::new(),
            acks: AckRegistry::new(),
            channels: DashMap::new(),
            presence,
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn next_id(&self) -> i64 {
        self.ids.next_id()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn acks(&self) -> &AckRegistry {
        &self.acks
    }

    pub fn presence(&self) -> Option<&Arc<dyn PresenceStore>> {
        self.presence.as_ref()
    }

    /// Get or create the channel called `name`.
    pub fn register_channel(&self, name: &str) -> Arc<Channel> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::new(name)))
            .value()
            .clone()
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|c| c.value().clone())
    }

    pub fn client(&self, channel: &str, cid: i64) -> Option<Arc<Client>> {
        self.channel(channel)?.client(cid)
    }

    /// Live connections across every channel.
    pub fn connection_count(&self) -> usize {
        self.health.len()
    }

    /// Re-queue every ack entry overdue as of `now` on its owning client.
    /// Entries whose client is gone are dropped. Returns how many were
    /// re-queued.
    pub fn resend_expired_acks(&self, now: Instant) -> usize {
        let mut resent = 0;
        for entry in self.acks.take_expired(now, self.config.ack_interval) {
            let Some(client) = self.client(&entry.channel, entry.cid) else {
                tracing::debug!(cid = entry.cid, sid = %entry.response.sid, "ack owner gone, dropping");
                continue;
            };
            match client.write(entry.response) {
                Ok(()) => resent += 1,
                Err(e) => tracing::debug!(?e, cid = entry.cid, "ack retransmission not queued"),
            }
        }
        resent
    }

    /// Close every client, e.g. on process shutdown.
    pub async fn close_all(&self, code: u16, reason: &str) {
        let clients: Vec<Arc<Client>> = self
            .channels
            .iter()
            .flat_map(|c| c.value().clients())
            .collect();
        futures_util::future::join_all(clients.iter().map(|c| c.close(code, reason))).await;
    }

    /// Start the heartbeat and ack sweeps. Both stop when `shutdown` fires.
    pub fn spawn_sweepers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let health = {
            let hub = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { hub.run_health_sweep(shutdown).await })
        };
        let acks = {
            let hub = self.clone();
            tokio::spawn(async move { hub.run_ack_sweep(shutdown).await })
        };
        vec![health, acks]
    }

    async fn run_health_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.heartbeat_interval.max(MIN_SWEEP_PERIOD);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!("health sweep shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let evicted = self.health.sweep(self.config.heartbeat_timeout).await;
                    if evicted > 0 {
                        tracing::info!(evicted, "health sweep evicted silent clients");
                    }
                }
            }
        }
    }

    async fn run_ack_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        let period = ACK_SWEEP_PERIOD
            .min(self.config.ack_interval)
            .max(MIN_SWEEP_PERIOD);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!("ack sweep shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let resent = self.resend_expired_acks(Instant::now());
                    if resent > 0 {
                        tracing::debug!(resent, "ack sweep re-queued events");
                    }
                }
            }
        }
    }
}
