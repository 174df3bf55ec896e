use anyhow::{Context, Result};
use meshlink_orchestrator::{OrchestratorConfig, ReputationConfig};
use meshlink_protocol::PeerId;
use meshlink_routing::{RetryPolicy, RouterConfig, TopologyConfig};
use meshlink_slots::{IdleTimeouts, SlotPoolConfig, TierCounts};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::breaker::BreakerConfig;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub slots: SlotsConfig,
    pub orchestrator: AdmissionConfig,
    pub reputation: ReputationConfig,
    pub reliability: ReliabilityConfig,
    pub topology: TopologySettings,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Peer id announced to the mesh
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "meshlink-node".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsConfig {
    /// Total slots; the tier split is derived unless `tiers` is given
    pub capacity: usize,
    pub tiers: Option<TierSplit>,
    pub idle_high_secs: u64,
    pub idle_normal_secs: u64,
    pub idle_low_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSplit {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            tiers: None,
            idle_high_secs: 600,
            idle_normal_secs: 300,
            idle_low_secs: 120,
            sweep_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub critical_battery: f64,
    pub auto_accept_floor: f64,
    pub auto_reject_floor: f64,
    pub slot_retry_delay_secs: u64,
    pub high_load_threshold: f64,
    pub high_load_delay_secs: u64,
    pub coordinator_delay_secs: u64,
    pub imminent_reject_within_secs: u64,
    pub likely_conditional_within_secs: u64,
    pub prediction_ttl_secs: u64,
    pub conditional_idle_timeout_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            critical_battery: 0.15,
            auto_accept_floor: 0.7,
            auto_reject_floor: 0.2,
            slot_retry_delay_secs: 5,
            high_load_threshold: 0.85,
            high_load_delay_secs: 30,
            coordinator_delay_secs: 2,
            imminent_reject_within_secs: 30,
            likely_conditional_within_secs: 120,
            prediction_ttl_secs: 10,
            conditional_idle_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Messages per priority band
    pub queue_capacity: usize,
    pub dedup_capacity: usize,
    pub dedup_ttl_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_secs: u64,
    /// Outbound drain tick
    pub drain_interval_ms: u64,
    /// Ack retry sweep tick
    pub ack_poll_interval_ms: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            dedup_capacity: 10_000,
            dedup_ttl_secs: 600,
            max_retries: 3,
            retry_base_ms: 2000,
            retry_multiplier: 2.0,
            retry_max_secs: 30,
            drain_interval_ms: 20,
            ack_poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologySettings {
    pub broadcast_interval_secs: u64,
    pub missed_intervals: u32,
    pub ttl: u8,
    pub eager_min_gap_ms: u64,
    pub dedup_capacity: usize,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            broadcast_interval_secs: 30,
            missed_intervals: 3,
            ttl: meshlink_protocol::topology::TOPOLOGY_TTL,
            eager_min_gap_ms: 1000,
            dedup_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub handshake_timeout_secs: u64,
    pub stuck_base_secs: u64,
    pub stuck_max_secs: u64,
    pub ping_interval_secs: u64,
    /// Ping interval for peers admitted under degraded monitoring
    pub monitored_ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    /// Consecutive send failures before the session is restarted
    pub restart_threshold: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 15,
            stuck_base_secs: 30,
            stuck_max_secs: 300,
            ping_interval_secs: 30,
            monitored_ping_interval_secs: 5,
            ping_timeout_secs: 4,
            backoff_base_ms: 500,
            backoff_max_secs: 30,
            restart_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;
        config.validate()?;
        config.config_file_path = config_path.to_path_buf();

        Ok(config)
    }

    /// Write a default configuration to `config_path`
    pub fn create_default(config_path: &Path) -> Result<Self> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let config = Config {
            config_file_path: config_path.to_path_buf(),
            ..Config::default()
        };

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(config_path, yaml).context("Failed to write configuration file")?;

        Ok(config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Check every section by building the component configs
    pub fn validate(&self) -> Result<()> {
        self.peer_id()?;
        self.slot_pool()
            .validate()
            .context("Invalid slots section")?;
        self.admission()
            .validate()
            .context("Invalid orchestrator section")?;
        self.router().validate().context("Invalid reliability section")?;
        self.topology_protocol()
            .validate()
            .context("Invalid topology section")?;
        self.breaker().validate().context("Invalid transport section")?;

        if self.reliability.drain_interval_ms == 0 || self.reliability.ack_poll_interval_ms == 0 {
            anyhow::bail!("Worker intervals must be non-zero");
        }
        if self.slots.sweep_interval_secs == 0
            || self.transport.monitored_ping_interval_secs == 0
            || self.transport.ping_interval_secs == 0
        {
            anyhow::bail!("Worker intervals must be non-zero");
        }
        Ok(())
    }

    pub fn peer_id(&self) -> Result<PeerId> {
        PeerId::new(self.node.id.clone()).context("Invalid node id")
    }

    pub fn slot_pool(&self) -> SlotPoolConfig {
        let tier_counts = match self.slots.tiers {
            Some(split) => TierCounts::new(split.critical, split.high, split.normal, split.low),
            None => TierCounts::from_capacity(self.slots.capacity),
        };
        SlotPoolConfig {
            tier_counts,
            idle_timeouts: IdleTimeouts {
                high: Duration::from_secs(self.slots.idle_high_secs),
                normal: Duration::from_secs(self.slots.idle_normal_secs),
                low: Duration::from_secs(self.slots.idle_low_secs),
            },
        }
    }

    pub fn admission(&self) -> OrchestratorConfig {
        let a = &self.orchestrator;
        OrchestratorConfig {
            critical_battery: a.critical_battery,
            auto_accept_floor: a.auto_accept_floor,
            auto_reject_floor: a.auto_reject_floor,
            slot_retry_delay: Duration::from_secs(a.slot_retry_delay_secs),
            high_load_threshold: a.high_load_threshold,
            high_load_delay: Duration::from_secs(a.high_load_delay_secs),
            coordinator_delay: Duration::from_secs(a.coordinator_delay_secs),
            imminent_reject_within: Duration::from_secs(a.imminent_reject_within_secs),
            likely_conditional_within: Duration::from_secs(a.likely_conditional_within_secs),
            prediction_ttl: Duration::from_secs(a.prediction_ttl_secs),
            conditional_idle_timeout: Duration::from_secs(a.conditional_idle_timeout_secs),
        }
    }

    pub fn router(&self) -> RouterConfig {
        let r = &self.reliability;
        RouterConfig {
            queue_capacity: r.queue_capacity,
            dedup_capacity: r.dedup_capacity,
            dedup_ttl: Duration::from_secs(r.dedup_ttl_secs),
            retry: RetryPolicy {
                max_retries: r.max_retries,
                base_interval: Duration::from_millis(r.retry_base_ms),
                multiplier: r.retry_multiplier,
                max_interval: Duration::from_secs(r.retry_max_secs),
            },
        }
    }

    pub fn topology_protocol(&self) -> TopologyConfig {
        let t = &self.topology;
        TopologyConfig {
            broadcast_interval: Duration::from_secs(t.broadcast_interval_secs),
            missed_intervals: t.missed_intervals,
            ttl: t.ttl,
            eager_min_gap: Duration::from_millis(t.eager_min_gap_ms),
            dedup_capacity: t.dedup_capacity,
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            base_backoff: Duration::from_millis(self.transport.backoff_base_ms),
            max_backoff: Duration::from_secs(self.transport.backoff_max_secs),
            restart_threshold: self.transport.restart_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slot_pool().tier_counts.total(), 8);
        assert_eq!(config.router().retry.max_retries, 3);
    }

    #[test]
    fn test_create_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let created = Config::create_default(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.node.id, created.node.id);
        assert_eq!(loaded.config_path(), path.as_path());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "node:\n  id: alpha\nslots:\n  tiers:\n    critical: 1\n    high: 1\n    normal: 2\n    low: 0\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.peer_id().unwrap().as_str(), "alpha");
        assert_eq!(config.slot_pool().tier_counts, TierCounts::new(1, 1, 2, 0));
        assert_eq!(config.topology.broadcast_interval_secs, 30);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("--init"));
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let mut config = Config::default();
        config.orchestrator.auto_reject_floor = 0.9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node.id = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reliability.drain_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
