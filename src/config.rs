//! Environment-driven configuration for the relay.
//!
//! Every value has a default so the relay starts with an empty environment;
//! `.env` files are picked up by `dotenvy` in `main` before this is read.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Errors raised while reading configuration from the environment
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// How backend connection handles are handed out to connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolingPolicy {
    /// One HTTP client shared by every connection
    Shared,
    /// A fresh HTTP client for every accepted connection
    PerConnection,
}

impl PoolingPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "shared" => Some(Self::Shared),
            "per-connection" | "per_connection" => Some(Self::PerConnection),
            _ => None,
        }
    }
}

/// Bounded retry with capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (always at least 1)
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 120,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.base_backoff_ms = base_ms;
        self.max_backoff_ms = max_ms.max(base_ms);
        self
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration of the document backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the backend, without trailing slash
    pub base_url: String,
    /// Path of the snapshot-fetch endpoint
    pub fetch_path: String,
    /// Path of the persistence endpoint
    pub save_path: String,
    /// Timeout of a single HTTP request
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub pooling: PoolingPolicy,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            fetch_path: "/api/docs/fetch".to_string(),
            save_path: "/api/docs/save".to_string(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            pooling: PoolingPolicy::Shared,
        }
    }
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pooling(mut self, pooling: PoolingPolicy) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn fetch_url(&self) -> String {
        format!("{}{}", self.base_url, self.fetch_path)
    }

    pub fn save_url(&self) -> String {
        format!("{}{}", self.base_url, self.save_path)
    }
}

/// Room lifecycle and save scheduling
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Upper bound on the whole snapshot load, retries included
    pub load_timeout: Duration,
    /// Autosave interval for dirty rooms
    pub save_interval: Duration,
    /// Interval of the empty-room cleanup pass
    pub cleanup_interval: Duration,
    /// Warn connected peers when a save could not be delivered
    pub notify_peers_on_save_failure: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_peers_per_room: 100,
            load_timeout: Duration::from_secs(30),
            save_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            notify_peers_on_save_failure: true,
        }
    }
}

/// Configuration of the pending-save outbox
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub enabled: bool,
    /// Path to the sled database directory
    pub path: String,
    pub replay_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "./data/outbox.sled".to_string(),
            replay_interval: Duration::from_secs(30),
        }
    }
}

/// Top-level relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub backend: BackendConfig,
    pub rooms: RoomConfig,
    pub outbox: OutboxConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 1999,
            backend: BackendConfig::default(),
            rooms: RoomConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Read configuration from process environment variables
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse_var(&lookup, "PORT")? {
            config.port = port;
        }

        let backend = &mut config.backend;
        if let Some(url) = lookup("BACKEND_URL") {
            backend.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = lookup("BACKEND_FETCH_PATH") {
            backend.fetch_path = path;
        }
        if let Some(path) = lookup("BACKEND_SAVE_PATH") {
            backend.save_path = path;
        }
        if let Some(ms) = parse_var(&lookup, "BACKEND_TIMEOUT_MS")? {
            backend.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "BACKEND_CONNECT_TIMEOUT_MS")? {
            backend.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var(&lookup, "BACKEND_RETRY_ATTEMPTS")? {
            backend.retry = backend.retry.with_max_attempts(attempts);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BACKEND_RETRY_BACKOFF_MS")? {
            let max = backend.retry.max_backoff_ms;
            backend.retry = backend.retry.with_backoff(ms, max);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BACKEND_RETRY_MAX_BACKOFF_MS")? {
            let base = backend.retry.base_backoff_ms;
            backend.retry = backend.retry.with_backoff(base, ms);
        }
        if let Some(raw) = lookup("BACKEND_POOLING") {
            backend.pooling = PoolingPolicy::parse(&raw).ok_or(ConfigError::InvalidValue {
                key: "BACKEND_POOLING",
                value: raw,
            })?;
        }

        let rooms = &mut config.rooms;
        if let Some(ms) = parse_var(&lookup, "LOAD_TIMEOUT_MS")? {
            rooms.load_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_interval(&lookup, "SAVE_INTERVAL_MS")? {
            rooms.save_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_interval(&lookup, "CLEANUP_INTERVAL_MS")? {
            rooms.cleanup_interval = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var(&lookup, "MAX_PEERS_PER_ROOM")? {
            rooms.max_peers_per_room = max;
        }
        if let Some(flag) = parse_bool(&lookup, "NOTIFY_PEERS_ON_SAVE_FAILURE")? {
            rooms.notify_peers_on_save_failure = flag;
        }

        let outbox = &mut config.outbox;
        if let Some(path) = lookup("OUTBOX_PATH") {
            outbox.path = path;
        }
        if let Some(flag) = parse_bool(&lookup, "OUTBOX_ENABLED")? {
            outbox.enabled = flag;
        }
        if let Some(ms) = parse_interval(&lookup, "OUTBOX_REPLAY_INTERVAL_MS")? {
            outbox.replay_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> ConfigResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(None),
    }
}

/// Millisecond interval for a periodic task; zero is rejected
fn parse_interval<F>(lookup: &F, key: &'static str) -> ConfigResult<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_var::<u64, _>(lookup, key)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_string(),
        }),
        ms => Ok(ms),
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str) -> ConfigResult<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        },
        None => Ok(None),
    }
}
