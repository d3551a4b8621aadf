//! Engine configuration.
//!
//! Every section has working defaults, so a config file only needs the keys it
//! changes. Durations are written in milliseconds.

use crate::coalesce::CoalesceWindow;
use crate::error::{ClientError, Result};
use crate::relay::RelayEndpoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Relays added to the pool on start
    pub relays: Vec<RelayEndpoint>,
    pub pool: PoolConfig,
    pub import: ImportConfig,
    pub backlog: BacklogConfig,
}

impl EngineConfig {
    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.import.batch_size == 0 {
            return Err(ClientError::Config(
                "import.batch_size must be at least 1".to_string(),
            ));
        }
        if self.pool.max_backoff == 0 {
            return Err(ClientError::Config(
                "pool.max_backoff must be at least 1".to_string(),
            ));
        }
        if self.backlog.sweep_interval.is_zero() || self.pool.keepalive_interval.is_zero() {
            return Err(ClientError::Config(
                "timer intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Socket connect timeout
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Liveness check cadence
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,
    /// Silence after which a connection is pinged
    #[serde(with = "millis")]
    pub stale_after: Duration,
    /// Backoff counter cap, in keepalive ticks
    pub max_backoff: u32,
    /// Frames buffered per connection while it is not open
    pub max_queued_frames: usize,
    /// How long an ephemeral connection lives
    #[serde(with = "millis")]
    pub ephemeral_lifetime: Duration,
    /// Delay before re-sending a request that hit auth-required
    #[serde(with = "millis")]
    pub auth_retry_delay: Duration,
    /// Upper bound for the signer
    #[serde(with = "millis")]
    pub sign_timeout: Duration,
    /// Pool event broadcast capacity
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(45),
            max_backoff: 512,
            max_queued_frames: 1000,
            ephemeral_lifetime: Duration::from_secs(35),
            auth_retry_delay: Duration::from_secs(2),
            sign_timeout: Duration::from_secs(10),
            event_capacity: 1000,
        }
    }
}

/// Import pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub normal_lane: CoalesceWindow,
    pub priority_lane: CoalesceWindow,
    /// Coalescing of "already delivered" signals for saved duplicates
    pub delivered: CoalesceWindow,
    /// Imported notification is emitted every `batch_size` items
    pub batch_size: usize,
    pub verify_signatures: bool,
    /// Consult the trust policy for the subscriptions it claims
    pub trust_filter: bool,
    /// Ingest event broadcast capacity
    pub event_capacity: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            normal_lane: CoalesceWindow::from_millis(50, 125),
            priority_lane: CoalesceWindow::from_millis(50, 75),
            delivered: CoalesceWindow::from_millis(300, 1500),
            batch_size: 100,
            verify_signatures: true,
            trust_filter: false,
            event_capacity: 1000,
        }
    }
}

/// Request correlator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    /// Timeout for tasks that do not set one
    #[serde(with = "millis")]
    pub default_timeout: Duration,
    /// Debounce for tasks that do not set one
    #[serde(with = "millis")]
    pub default_debounce: Duration,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            default_timeout: Duration::from_secs(60),
            default_debounce: Duration::from_millis(100),
        }
    }
}

/// Serde adapter writing a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
