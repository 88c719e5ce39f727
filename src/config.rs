// src/config.rs

//! Configuration: the runtime options of a hub connection and the TOML file the
//! `hublink` binary (or an embedding application) loads them from.

use crate::core::buffer::DEFAULT_BUFFER_SIZE;
use crate::core::retry::{
    DefaultRetryPolicy, ExponentialBackoffPolicy, INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY,
    RetryPolicy,
};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default time without any message from the server before the connection is
/// considered lost.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
/// Default interval between keep-alive pings.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Default time allowed for the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// Default rate of the timer driving keep-alive and timeout checks.
pub const DEFAULT_TICK_RATE: Duration = Duration::from_secs(1);

/// Durations and limits applied to every connection a session makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConnectionOptions {
    pub server_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub handshake_timeout: Duration,
    pub tick_rate: Duration,
    /// Unacknowledged bytes retained for stateful reconnect.
    pub stateful_reconnect_buffer_size: usize,
}

impl Default for HubConnectionOptions {
    fn default() -> Self {
        Self {
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tick_rate: DEFAULT_TICK_RATE,
            stateful_reconnect_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Which reconnect policy the `[reconnect]` section selects.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPolicyKind {
    /// 0s, 2s, 10s, 30s, then give up.
    #[default]
    Default,
    /// The delays listed in `delays`, then give up.
    Fixed,
    /// Doubling delays with jitter, see `initial_delay`, `max_delay` and `max_attempts`.
    Exponential,
}

/// The `[reconnect]` section.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub policy: RetryPolicyKind,
    #[serde(default, with = "duration_list")]
    pub delays: Vec<Duration>,
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    #[serde(default)]
    pub max_attempts: Option<u64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: RetryPolicyKind::Default,
            delays: Vec::new(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Builds the selected policy, or `None` when reconnecting is disabled.
    pub fn build_policy(&self) -> Option<Arc<dyn RetryPolicy>> {
        if !self.enabled {
            return None;
        }
        let policy: Arc<dyn RetryPolicy> = match self.policy {
            RetryPolicyKind::Default => Arc::new(DefaultRetryPolicy::new()),
            RetryPolicyKind::Fixed => Arc::new(DefaultRetryPolicy::with_delays(self.delays.clone())),
            RetryPolicyKind::Exponential => {
                let policy = ExponentialBackoffPolicy::new(self.initial_delay, self.max_delay);
                match self.max_attempts {
                    Some(max) => Arc::new(policy.with_max_attempts(max)),
                    None => Arc::new(policy),
                }
            }
        };
        Some(policy)
    }
}

/// `humantime_serde` handles single durations; this adapts it to lists such as
/// `delays = ["0s", "2s", "10s"]`.
mod duration_list {
    use humantime_serde::Serde;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(delays: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(delays.iter().map(|d| Serde::from(*d)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Vec<Serde<Duration>> = Vec::deserialize(deserializer)?;
        Ok(raw.into_iter().map(Serde::into_inner).collect())
    }
}

fn default_initial_delay() -> Duration {
    INITIAL_RECONNECT_DELAY
}

fn default_max_delay() -> Duration {
    MAX_RECONNECT_DELAY
}

/// The `[stateful_reconnect]` section.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatefulReconnectConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for StatefulReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// The whole configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Endpoint of the hub, e.g. `tcp://127.0.0.1:5000` or `tls://hub.example.com:443`.
    pub url: String,
    /// Negotiate TLS even for `tcp://` endpoints.
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(with = "humantime_serde", default = "default_server_timeout")]
    pub server_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_keep_alive_interval")]
    pub keep_alive_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_tick_rate")]
    pub tick_rate: Duration,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub stateful_reconnect: StatefulReconnectConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_timeout() -> Duration {
    DEFAULT_SERVER_TIMEOUT
}

fn default_keep_alive_interval() -> Duration {
    DEFAULT_KEEP_ALIVE_INTERVAL
}

fn default_handshake_timeout() -> Duration {
    DEFAULT_HANDSHAKE_TIMEOUT
}

fn default_tick_rate() -> Duration {
    DEFAULT_TICK_RATE
}

impl HubConfig {
    /// Reads, parses and validates a TOML configuration file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: HubConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(anyhow!("url cannot be empty"));
        }
        if self.server_timeout.is_zero() {
            return Err(anyhow!("server_timeout cannot be 0"));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(anyhow!("keep_alive_interval cannot be 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(anyhow!("handshake_timeout cannot be 0"));
        }
        if self.tick_rate.is_zero() {
            return Err(anyhow!("tick_rate cannot be 0"));
        }
        if self.keep_alive_interval >= self.server_timeout {
            return Err(anyhow!(
                "keep_alive_interval must be shorter than server_timeout"
            ));
        }
        if self.server_timeout < self.keep_alive_interval * 2 {
            warn!(
                "server_timeout ({:?}) is less than twice keep_alive_interval ({:?}). A single delayed ping may disconnect the client.",
                self.server_timeout, self.keep_alive_interval
            );
        }

        if self.reconnect.enabled {
            match self.reconnect.policy {
                RetryPolicyKind::Fixed if self.reconnect.delays.is_empty() => {
                    return Err(anyhow!(
                        "reconnect.delays cannot be empty when reconnect.policy is 'fixed'"
                    ));
                }
                RetryPolicyKind::Exponential => {
                    if self.reconnect.initial_delay.is_zero() {
                        return Err(anyhow!("reconnect.initial_delay cannot be 0"));
                    }
                    if self.reconnect.max_delay < self.reconnect.initial_delay {
                        return Err(anyhow!(
                            "reconnect.max_delay must be at least reconnect.initial_delay"
                        ));
                    }
                }
                _ => {}
            }
        }

        if self.stateful_reconnect.enabled && self.stateful_reconnect.buffer_size == 0 {
            return Err(anyhow!(
                "stateful_reconnect.buffer_size cannot be 0 when stateful reconnect is enabled"
            ));
        }
        Ok(())
    }

    /// The runtime options this file describes.
    pub fn connection_options(&self) -> HubConnectionOptions {
        HubConnectionOptions {
            server_timeout: self.server_timeout,
            keep_alive_interval: self.keep_alive_interval,
            handshake_timeout: self.handshake_timeout,
            tick_rate: self.tick_rate,
            stateful_reconnect_buffer_size: self.stateful_reconnect.buffer_size,
        }
    }
}
