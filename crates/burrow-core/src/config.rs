//! Configuration resolution for burrow.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/burrow/broker.json)
//! 3. Explicit config file (e.g. passed by the embedding binary)
//! 4. Environment variables (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete burrow broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Broker instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    /// URL other broker instances use to reach this one. Published with every
    /// registered tunnel so peers can route requests here.
    pub private_api_url: String,
    /// Capacity of the tunnel registry command queue.
    pub command_queue_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            private_api_url: "grpc://127.0.0.1:8155".to_string(),
            command_queue_size: 64,
        }
    }
}

/// Agent tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    /// Maximum lifetime of an agent tunnel connection (seconds).
    pub max_connection_age_secs: u64,
    /// Random jitter applied to the maximum age, in percent.
    pub max_connection_age_jitter_percent: u32,
    /// Buffer size of the broker -> agent frame channel.
    pub outbound_buffer: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_connection_age_secs: 30 * 60,
            max_connection_age_jitter_percent: 5,
            outbound_buffer: 128,
        }
    }
}

impl TunnelConfig {
    pub fn max_connection_age(&self) -> Duration {
        Duration::from_secs(self.max_connection_age_secs)
    }

    /// The maximum age moved by a random jitter in `[-jitter%, +jitter%)` of
    /// it, so that agents connected at the same moment do not all reconnect
    /// together.
    pub fn max_connection_age_with_jitter(&self) -> Duration {
        let base = self.max_connection_age();
        let max_jitter_ms =
            base.as_millis() * u128::from(self.max_connection_age_jitter_percent) / 100;
        let max_jitter_ms = u64::try_from(max_jitter_ms).unwrap_or(u64::MAX);
        if max_jitter_ms == 0 {
            return base;
        }
        let offset_ms = rand::rng().random_range(0..max_jitter_ms.saturating_mul(2));
        base.saturating_sub(Duration::from_millis(max_jitter_ms))
            + Duration::from_millis(offset_ms)
    }
}

/// Agent side of the reverse tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Tunnels an agent keeps open to the broker at the same time.
    pub num_connections: usize,
    /// Base pause before reconnecting after a failed attempt (milliseconds).
    pub connect_retry_period_ms: u64,
    /// Buffer size of the agent -> broker frame channel and of the request
    /// channel into the local server.
    pub frame_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            num_connections: 10,
            connect_retry_period_ms: 10_000,
            frame_buffer: 16,
        }
    }
}

impl AgentConfig {
    pub fn connect_retry_period(&self) -> Duration {
        Duration::from_millis(self.connect_retry_period_ms)
    }

    /// The retry period stretched by a random factor in `[1.0, 2.5)`.
    pub fn connect_retry_delay(&self) -> Duration {
        let base = self.connect_retry_period_ms;
        let max_extra = base.saturating_mul(3) / 2;
        if max_extra == 0 {
            return self.connect_retry_period();
        }
        Duration::from_millis(base.saturating_add(rand::rng().random_range(0..max_extra)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_connections == 0 {
            return Err(Error::Config(
                "agent.num_connections must be at least 1".to_string(),
            ));
        }
        if self.frame_buffer == 0 {
            return Err(Error::Config(
                "agent.frame_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Check values that serde cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        let url = &self.broker.private_api_url;
        if !(url.starts_with("grpc://") || url.starts_with("grpcs://")) {
            return Err(Error::Config(format!(
                "broker.private_api_url must use the grpc:// or grpcs:// scheme, got {url:?}"
            )));
        }
        if self.broker.command_queue_size == 0 {
            return Err(Error::Config(
                "broker.command_queue_size must be at least 1".to_string(),
            ));
        }
        if self.tunnel.max_connection_age_secs == 0 {
            return Err(Error::Config(
                "tunnel.max_connection_age_secs must be at least 1".to_string(),
            ));
        }
        if self.tunnel.max_connection_age_jitter_percent > 100 {
            return Err(Error::Config(format!(
                "tunnel.max_connection_age_jitter_percent must be at most 100, got {}",
                self.tunnel.max_connection_age_jitter_percent
            )));
        }
        if self.tunnel.outbound_buffer == 0 {
            return Err(Error::Config(
                "tunnel.outbound_buffer must be at least 1".to_string(),
            ));
        }
        self.agent.validate()
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    // Load global config
    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_values(&mut merged, load_config_value(&global_path)?);
        }
    }

    // Load explicit config
    if let Some(path) = explicit {
        merge_values(&mut merged, load_config_value(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    // Apply environment overrides
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".burrow").join("broker.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/burrow/broker.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("burrow").join("broker.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_value(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Objects merge key by key, anything else
/// replaces the base value.
fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("BURROW_PRIVATE_API_URL") {
        config.broker.private_api_url = val;
    }
    if let Some(val) = lookup("BURROW_MAX_CONNECTION_AGE_SECS") {
        if let Ok(n) = val.parse() {
            config.tunnel.max_connection_age_secs = n;
        }
    }
    if let Some(val) = lookup("BURROW_AGENT_CONNECTIONS") {
        if let Ok(n) = val.parse() {
            config.agent.num_connections = n;
        }
    }
    if let Some(val) = lookup("BURROW_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = lookup("BURROW_LOG_JSON") {
        if let Ok(b) = val.parse() {
            config.log.json = b;
        }
    }
}
