use std::time::Duration;

use gateway_common::id::{prefix, prefixed_ulid};

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret used to verify bearer tokens.
    pub jwt_secret: String,
    /// Expected `guard` claim on bearer tokens.
    pub jwt_guard: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Redis connection string. When unset every shared store is in-memory.
    pub redis_url: Option<String>,
    /// Identity of this gateway process within the cluster.
    pub server_id: String,
    pub socket: SocketConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = SocketConfig::default();
        Self {
            jwt_secret: required_var("JWT_SECRET"),
            jwt_guard: std::env::var("JWT_GUARD").unwrap_or_else(|_| "api".to_string()),
            port: parsed_var("PORT").unwrap_or(9504),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            server_id: std::env::var("SERVER_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| prefixed_ulid(prefix::SERVER)),
            socket: SocketConfig {
                heartbeat_interval: nonzero_secs(
                    "HEARTBEAT_INTERVAL_SECS",
                    parsed_var("HEARTBEAT_INTERVAL_SECS"),
                    defaults.heartbeat_interval,
                ),
                heartbeat_timeout: nonzero_secs(
                    "HEARTBEAT_TIMEOUT_SECS",
                    parsed_var("HEARTBEAT_TIMEOUT_SECS"),
                    defaults.heartbeat_timeout,
                ),
                ack_interval: nonzero_secs(
                    "ACK_INTERVAL_SECS",
                    parsed_var("ACK_INTERVAL_SECS"),
                    defaults.ack_interval,
                ),
                client_buffer: parsed_var("CLIENT_BUFFER").unwrap_or(defaults.client_buffer),
            },
        }
    }
}

/// Liveness and delivery tuning shared by every connection of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketConfig {
    /// How often clients are told to ping.
    pub heartbeat_interval: Duration,
    /// Silence after which the health sweep evicts a client.
    pub heartbeat_timeout: Duration,
    /// Delay between retransmissions of unacknowledged events.
    pub ack_interval: Duration,
    /// Outbound queue capacity per client. Zero selects the default.
    pub client_buffer: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            ack_interval: Duration::from_secs(5),
            client_buffer: 10,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Seconds from `raw`, or `default` when unset. Zero is rejected: the
/// sweeps cannot tick on a zero period.
fn nonzero_secs(name: &str, raw: Option<u64>, default: Duration) -> Duration {
    match raw {
        Some(0) => panic!("{name} must be greater than zero"),
        Some(secs) => Duration::from_secs(secs),
        None => default,
    }
}
