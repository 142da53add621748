//! Configuration schema for the sync engine.
//!
//! The on-disk shape (`SyncConfigFile`) keeps every duration in integer
//! milliseconds so the JSON stays flat and greppable; `SyncConfig` is the
//! runtime view with proper `Duration`s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::retry::RetryPolicy;

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfigFile {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Engine timing and capacity knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSettings {
    /// Timeout for the websocket handshake.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Timeout waiting for the venue to answer an auth request.
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Keep-alive ping cadence.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Proactive reconnect horizon; 0 disables it.
    #[serde(default = "default_connection_lifetime_ms")]
    pub connection_lifetime_ms: u64,
    /// Hard cap on concurrently open sockets per engine.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How often dirty order books are flushed to the store.
    #[serde(default = "default_depth_flush_interval_ms")]
    pub depth_flush_interval_ms: u64,
    /// Queue backlog above which a book counts as lagging and is withheld
    /// from flush.
    #[serde(default = "default_max_depth_latency")]
    pub max_depth_latency: u64,
    /// Balance writes wait for this much quiet time before flushing.
    #[serde(default = "default_balance_quiet_ms")]
    pub balance_quiet_ms: u64,
}

/// Backoff schedule for snapshot fetches and other retried calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    15_000
}

fn default_connection_lifetime_ms() -> u64 {
    // 23h, comfortably inside the 24h cutoff most venues enforce.
    82_800_000
}

fn default_max_connections() -> usize {
    50
}

fn default_depth_flush_interval_ms() -> u64 {
    1_000
}

fn default_max_depth_latency() -> u64 {
    100
}

fn default_balance_quiet_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            connection_lifetime_ms: default_connection_lifetime_ms(),
            max_connections: default_max_connections(),
            depth_flush_interval_ms: default_depth_flush_interval_ms(),
            max_depth_latency: default_max_depth_latency(),
            balance_quiet_ms: default_balance_quiet_ms(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for SyncConfigFile {
    fn default() -> Self {
        Self {
            sync: SyncSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

/// Runtime configuration handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    /// `None` means connections are never proactively recycled.
    pub connection_lifetime: Option<Duration>,
    pub max_connections: usize,
    pub depth_flush_interval: Duration,
    pub max_depth_latency: u64,
    pub balance_quiet: Duration,
    pub retry: RetryPolicy,
}

impl From<SyncConfigFile> for SyncConfig {
    fn from(file: SyncConfigFile) -> Self {
        let sync = file.sync;
        let retry = file.retry;
        Self {
            connect_timeout: Duration::from_millis(sync.connect_timeout_ms),
            auth_timeout: Duration::from_millis(sync.auth_timeout_ms),
            ping_interval: Duration::from_millis(sync.ping_interval_ms),
            connection_lifetime: match sync.connection_lifetime_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_connections: sync.max_connections,
            depth_flush_interval: Duration::from_millis(sync.depth_flush_interval_ms),
            max_depth_latency: sync.max_depth_latency,
            balance_quiet: Duration::from_millis(sync.balance_quiet_ms),
            retry: RetryPolicy {
                max_attempts: retry.max_attempts,
                initial_delay: Duration::from_millis(retry.initial_delay_ms),
                backoff_multiplier: retry.backoff_multiplier,
                max_delay: Duration::from_millis(retry.max_delay_ms),
            },
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfigFile::default().into()
    }
}
