//! Configuration management for qmesh.
//!
//! Every section carries `#[serde(default)]`, so a config file only needs the
//! values it wants to override.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
    pub routing: RoutingConfig,
    pub health: HealthConfig,
    pub orchestration: OrchestrationConfig,
}

/// Identity and capabilities of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub address: String,
    pub max_secure_channels: u32,
    pub algorithms: Vec<String>,
    pub hardware_acceleration: bool,
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-001".to_string(),
            address: "0.0.0.0:47800".to_string(),
            max_secure_channels: 16,
            algorithms: vec!["ed25519".to_string(), "x25519".to_string()],
            hardware_acceleration: false,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub interval_secs: u64,
    /// How long a cycle collects beacon replies
    pub window_ms: u64,
    pub beacon_port: u16,
    /// Key length requested from the secure-channel provider during handshake
    pub handshake_bits: usize,
    /// Nodes unseen for `stale_multiplier` discovery intervals are removed
    pub stale_multiplier: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            window_ms: 2000,
            beacon_port: 47800,
            handshake_bits: 256,
            stale_multiplier: 3,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn stale_after_ms(&self) -> u64 {
        self.interval_secs * 1000 * self.stale_multiplier as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub handshake_timeout_ms: u64,
    pub key_bits: usize,
    pub key_rotation_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            key_bits: 256,
            key_rotation_secs: 3600,
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub interval_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl RoutingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// Nodes unseen for `offline_multiplier` health intervals go offline
    pub offline_multiplier: u32,
    /// Error rate above which a channel is no longer trusted (QBER bound)
    pub error_rate_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            offline_multiplier: 2,
            error_rate_threshold: 0.11,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn offline_after_ms(&self) -> u64 {
        self.interval_secs * 1000 * self.offline_multiplier as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub interval_secs: u64,
    pub init_timeout_secs: u64,
    pub optimization_enabled: bool,
    pub auto_scaling_enabled: bool,
    pub failover_enabled: bool,
    pub self_healing_enabled: bool,
    pub event_log_capacity: usize,
    pub healing_history_capacity: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            init_timeout_secs: 30,
            optimization_enabled: true,
            auto_scaling_enabled: true,
            failover_enabled: true,
            self_healing_enabled: true,
            event_log_capacity: 1000,
            healing_history_capacity: 100,
        }
    }
}

impl OrchestrationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject values that would stall a scheduler or make thresholds meaningless.
    pub fn validate(&self) -> CoreResult<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(invalid("node.node_id", "must not be empty"));
        }
        let intervals = [
            ("discovery.interval_secs", self.discovery.interval_secs),
            ("routing.interval_secs", self.routing.interval_secs),
            ("health.interval_secs", self.health.interval_secs),
            ("orchestration.interval_secs", self.orchestration.interval_secs),
            ("orchestration.init_timeout_secs", self.orchestration.init_timeout_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.discovery.stale_multiplier < 1 {
            return Err(invalid("discovery.stale_multiplier", "must be at least 1"));
        }
        if self.health.offline_multiplier < 1 {
            return Err(invalid("health.offline_multiplier", "must be at least 1"));
        }
        let threshold = self.health.error_rate_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(invalid(
                "health.error_rate_threshold",
                "must be in the range (0, 1]",
            ));
        }
        if self.connection.key_bits == 0 || self.discovery.handshake_bits == 0 {
            return Err(invalid("key_bits", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> CoreError {
    CoreError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
