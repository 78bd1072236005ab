//! Policy configuration for the router and execution core.
//!
//! All tunables live here, loaded once at startup and passed by reference.
//! The constants are mitigations, not guarantees: the dedup window in
//! particular papers over the inference service occasionally emitting two
//! identical tool calls within a second, which is upstream model behavior
//! that may not go away.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Router and execution-core policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-session handoff ceiling. Reaching it opens the circuit: further
    /// handoff requests fail and the current agent must conclude.
    pub max_handoffs: u32,

    /// Window within which a repeated `(tool, params)` call is suppressed.
    #[serde(with = "duration_millis")]
    pub dedup_window: Duration,

    /// Failed attempts allowed on a verification-style tool before a failed
    /// handoff to the entry agent is synthesized.
    pub max_verification_attempts: usize,

    /// Sessions with no activity past this window are reaped by the sweep.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// How often the background sweep runs.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// TTL on persisted session memory. Released sessions keep their memory
    /// this long, allowing reconnect-with-memory.
    #[serde(with = "duration_secs")]
    pub memory_ttl: Duration,

    /// Buffer size for the client and adapter channels.
    pub channel_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_handoffs: 3,
            dedup_window: Duration::from_millis(5000),
            max_verification_attempts: 3,
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            memory_ttl: Duration::from_secs(300),
            channel_buffer: 64,
        }
    }
}

/// Builder for [`RouterConfig`].
pub struct ConfigBuilder {
    config: RouterConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
        }
    }

    pub fn max_handoffs(mut self, ceiling: u32) -> Self {
        self.config.max_handoffs = ceiling;
        self
    }

    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.config.dedup_window = window;
        self
    }

    pub fn max_verification_attempts(mut self, attempts: usize) -> Self {
        self.config.max_verification_attempts = attempts.max(1);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn memory_ttl(mut self, ttl: Duration) -> Self {
        self.config.memory_ttl = ttl;
        self
    }

    pub fn channel_buffer(mut self, buffer: usize) -> Self {
        self.config.channel_buffer = buffer.max(1);
        self
    }

    pub fn build(self) -> RouterConfig {
        self.config
    }
}

/// Load configuration from environment variables, falling back to defaults.
pub fn from_env() -> RouterConfig {
    let mut config = RouterConfig::default();

    if let Ok(v) = std::env::var("SWITCHBOARD_MAX_HANDOFFS") {
        if let Ok(n) = v.parse::<u32>() {
            config.max_handoffs = n;
        }
    }

    if let Ok(v) = std::env::var("SWITCHBOARD_DEDUP_WINDOW_MS") {
        if let Ok(ms) = v.parse::<u64>() {
            config.dedup_window = Duration::from_millis(ms);
        }
    }

    if let Ok(v) = std::env::var("SWITCHBOARD_IDLE_TIMEOUT_SECS") {
        if let Ok(secs) = v.parse::<u64>() {
            config.idle_timeout = Duration::from_secs(secs);
        }
    }

    if let Ok(v) = std::env::var("SWITCHBOARD_MEMORY_TTL_SECS") {
        if let Ok(secs) = v.parse::<u64>() {
            config.memory_ttl = Duration::from_secs(secs);
        }
    }

    config
}

/// Load configuration from a TOML file.
pub fn from_file(
    path: impl AsRef<std::path::Path>,
) -> std::result::Result<RouterConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: RouterConfig = toml::from_str(&contents)?;
    Ok(config)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
