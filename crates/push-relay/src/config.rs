use std::env;
use std::time::Duration;

use url::Url;

use crate::commands::ServerConfiguration;
use crate::error::{RelayError, RelayResult};

pub const DEFAULT_SERVER_RETRY_DELAYS_MS: [u64; 3] = [1_000, 2_000, 4_000];
pub const DEFAULT_NETWORK_RETRY_FACTORS: [f64; 5] = [0.1, 0.25, 0.5, 1.0, 2.0];

/// Settings the long-poll connection reads; the server may override them at
/// runtime through the `configuration` command.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub network_retry_factors: Vec<f64>,
    pub network_delay: Duration,
    pub server_retry_delays: Vec<Duration>,
    pub empty_response_retries: u32,
}

impl ConnectionConfig {
    /// `heartbeat × factor[i] + network_delay`, in configured factor order.
    pub fn network_retry_delays(&self) -> Vec<Duration> {
        self.network_retry_factors
            .iter()
            .map(|factor| self.heartbeat_interval.mul_f64(factor.max(0.0)) + self.network_delay)
            .collect()
    }

    /// Applies the fields present in a server-supplied configuration.
    pub fn apply(&mut self, server: &ServerConfiguration) {
        if let Some(ms) = server.heartbeat_interval_ms {
            self.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(factors) = &server.network_retry_factors {
            self.network_retry_factors = factors.clone();
        }
        if let Some(ms) = server.network_delay_ms {
            self.network_delay = Duration::from_millis(ms);
        }
        if let Some(delays) = &server.server_retry_delays_ms {
            self.server_retry_delays = delays.iter().copied().map(Duration::from_millis).collect();
        }
        if let Some(handler) = &server.response_timeout_handler {
            self.empty_response_retries = handler.retries;
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(25_000),
            network_retry_factors: DEFAULT_NETWORK_RETRY_FACTORS.to_vec(),
            network_delay: Duration::from_millis(1_000),
            server_retry_delays: DEFAULT_SERVER_RETRY_DELAYS_MS
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            empty_response_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server_url: Url,
    pub key_prefix: String,
    pub share_connection: bool,
    pub poll_period: Duration,
    pub expiry_interval: Duration,
    pub expiry_threshold: u32,
    pub broadcast_poll_interval: Duration,
    pub pending_capacity: usize,
    pub log_filter: String,
    pub connection: ConnectionConfig,
}

impl RelayConfig {
    pub fn from_env() -> RelayResult<Self> {
        let defaults = Self::default();
        let server_url = match env::var("PUSH_RELAY_SERVER_URL") {
            Ok(raw) => Url::parse(&raw)?,
            Err(_) => defaults.server_url,
        };
        let key_prefix = env::var("PUSH_RELAY_KEY_PREFIX").unwrap_or(defaults.key_prefix);
        let share_connection = env::var("PUSH_RELAY_SHARE_CONNECTION")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(defaults.share_connection);
        let poll_period = env_millis("PUSH_RELAY_POLL_PERIOD_MS", defaults.poll_period);
        let expiry_interval = env_millis("PUSH_RELAY_EXPIRY_INTERVAL_MS", defaults.expiry_interval);
        let expiry_threshold = env::var("PUSH_RELAY_EXPIRY_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.expiry_threshold);
        let broadcast_poll_interval = env_millis(
            "PUSH_RELAY_BROADCAST_POLL_MS",
            defaults.broadcast_poll_interval,
        );
        let pending_capacity = env::var("PUSH_RELAY_PENDING_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.pending_capacity);
        let log_filter =
            env::var("RUST_LOG").unwrap_or_else(|_| "info,push_relay=debug".into());

        let base = defaults.connection;
        let connection = ConnectionConfig {
            heartbeat_interval: env_millis(
                "PUSH_RELAY_HEARTBEAT_INTERVAL_MS",
                base.heartbeat_interval,
            ),
            network_retry_factors: match env::var("PUSH_RELAY_NETWORK_RETRY_FACTORS") {
                Ok(raw) => parse_list(&raw, "PUSH_RELAY_NETWORK_RETRY_FACTORS")?,
                Err(_) => base.network_retry_factors,
            },
            network_delay: env_millis("PUSH_RELAY_NETWORK_DELAY_MS", base.network_delay),
            server_retry_delays: match env::var("PUSH_RELAY_SERVER_RETRY_DELAYS_MS") {
                Ok(raw) => parse_list::<u64>(&raw, "PUSH_RELAY_SERVER_RETRY_DELAYS_MS")?
                    .into_iter()
                    .map(Duration::from_millis)
                    .collect(),
                Err(_) => base.server_retry_delays,
            },
            empty_response_retries: env::var("PUSH_RELAY_EMPTY_RESPONSE_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.empty_response_retries),
        };

        Ok(Self {
            server_url,
            key_prefix,
            share_connection,
            poll_period,
            expiry_interval,
            expiry_threshold,
            broadcast_poll_interval,
            pending_capacity,
            log_filter,
            connection,
        })
    }

    /// Lease lifetime granted on every renewal.
    pub fn lease_ttl(&self) -> Duration {
        self.poll_period * 3
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_url: Url::parse("http://127.0.0.1:8090/").expect("static url"),
            key_prefix: "push-relay".into(),
            share_connection: true,
            poll_period: Duration::from_millis(1_000),
            expiry_interval: Duration::from_millis(10_000),
            expiry_threshold: 5,
            broadcast_poll_interval: Duration::from_millis(300),
            pending_capacity: 8_192,
            log_filter: "info,push_relay=debug".into(),
            connection: ConnectionConfig::default(),
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_list<T: std::str::FromStr>(raw: &str, name: &str) -> RelayResult<Vec<T>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse()
                .map_err(|_| RelayError::Config(format!("{name}: cannot parse {item:?}")))
        })
        .collect()
}
