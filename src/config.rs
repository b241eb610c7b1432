use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::probe::ProbeConfig;
use crate::error::{PlacementError, Result};
use crate::topology::AttributeFilter;

/// Active-jobs threshold that effectively disables the limit.
pub const UNBOUNDED_ACTIVE_JOBS: u32 = u32::MAX;

/// Recommended lower bound for affinity ring replicas per node.
pub const RECOMMENDED_MIN_REPLICAS: u32 = 500;

/// Configuration of the work-stealing collision resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StealingConfig {
    /// Jobs allowed to run concurrently on this node.
    pub active_jobs_threshold: u32,
    /// Waiting jobs this node keeps before it hands work to thieves.
    pub wait_jobs_threshold: u32,
    /// How long a steal request stays valid.
    pub message_expire_time_ms: u64,
    /// A job is never stolen more often than this.
    pub max_stealing_attempts: u32,
    /// Whether this node asks idle-time peers for work.
    pub stealing_enabled: bool,
    /// Only peers publishing these attributes are asked for work.
    pub stealing_attributes: AttributeFilter,
}

impl Default for StealingConfig {
    fn default() -> Self {
        Self {
            active_jobs_threshold: 95,
            wait_jobs_threshold: 0,
            message_expire_time_ms: 1000,
            max_stealing_attempts: 5,
            stealing_enabled: true,
            stealing_attributes: AttributeFilter::default(),
        }
    }
}

impl StealingConfig {
    pub fn with_active_jobs_threshold(mut self, threshold: u32) -> Self {
        self.active_jobs_threshold = threshold;
        self
    }

    pub fn with_wait_jobs_threshold(mut self, threshold: u32) -> Self {
        self.wait_jobs_threshold = threshold;
        self
    }

    pub fn with_message_expire_time(mut self, expire: Duration) -> Self {
        self.message_expire_time_ms = expire.as_millis() as u64;
        self
    }

    pub fn with_max_stealing_attempts(mut self, attempts: u32) -> Self {
        self.max_stealing_attempts = attempts;
        self
    }

    pub fn with_stealing_enabled(mut self, enabled: bool) -> Self {
        self.stealing_enabled = enabled;
        self
    }

    pub fn with_stealing_attributes(mut self, filter: AttributeFilter) -> Self {
        self.stealing_attributes = filter;
        self
    }

    pub fn message_expire_time(&self) -> Duration {
        Duration::from_millis(self.message_expire_time_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_stealing_attempts == 0 {
            return Err(PlacementError::InvalidConfig(
                "max_stealing_attempts must be greater than 0".to_string(),
            ));
        }
        if self.message_expire_time_ms == 0 {
            return Err(PlacementError::InvalidConfig(
                "message_expire_time_ms must be greater than 0".to_string(),
            ));
        }
        if self.active_jobs_threshold == UNBOUNDED_ACTIVE_JOBS && self.stealing_enabled {
            tracing::warn!(
                "Active jobs threshold is unbounded, no job ever waits so job stealing has no effect"
            );
        }
        Ok(())
    }
}

/// Configuration of the probe-driven adaptive balancer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub probe: ProbeConfig,
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        self.probe.validate()
    }
}

/// Configuration of the consistent-hash affinity balancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Ring positions this node asks for; published as a node attribute.
    pub virtual_node_count: u32,
    /// Prefix mixed into every ring position hash.
    pub affinity_seed: String,
    /// Only nodes matching this filter are placed on the ring.
    pub node_filter: AttributeFilter,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            virtual_node_count: 1000,
            affinity_seed: String::new(),
            node_filter: AttributeFilter::default(),
        }
    }
}

impl AffinityConfig {
    pub fn with_virtual_node_count(mut self, count: u32) -> Self {
        self.virtual_node_count = count;
        self
    }

    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.affinity_seed = seed.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.virtual_node_count == 0 {
            return Err(PlacementError::InvalidConfig(
                "virtual_node_count must be greater than 0".to_string(),
            ));
        }
        if self.virtual_node_count < RECOMMENDED_MIN_REPLICAS {
            tracing::warn!(
                virtual_node_count = self.virtual_node_count,
                recommended = RECOMMENDED_MIN_REPLICAS,
                "Virtual node count is low, keys may spread unevenly"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BalancerConfig {
    Adaptive(AdaptiveConfig),
    Affinity(AffinityConfig),
}

impl Default for BalancerConfig {
    fn default() -> Self {
        BalancerConfig::Adaptive(AdaptiveConfig::default())
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            BalancerConfig::Adaptive(cfg) => cfg.validate(),
            BalancerConfig::Affinity(cfg) => cfg.validate(),
        }
    }
}

/// Configuration of stolen-job fail-over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub max_failover_attempts: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_failover_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub stealing: StealingConfig,
    pub balancer: BalancerConfig,
    pub failover: FailoverConfig,
    /// Interval at which the node publishes its metrics.
    pub heartbeat_interval_ms: u64,
    pub max_jobs: usize,
    /// Measure and publish a local benchmark at start-up.
    pub publish_benchmark: bool,
    /// Multiplier on every job's simulated work.
    pub work_slowdown: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            stealing: StealingConfig::default(),
            balancer: BalancerConfig::default(),
            failover: FailoverConfig::default(),
            heartbeat_interval_ms: 500,
            max_jobs: 10_000,
            publish_benchmark: false,
            work_slowdown: 1.0,
        }
    }
}

impl NodeConfig {
    pub fn with_stealing(mut self, stealing: StealingConfig) -> Self {
        self.stealing = stealing;
        self
    }

    pub fn with_balancer(mut self, balancer: BalancerConfig) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_work_slowdown(mut self, slowdown: f64) -> Self {
        self.work_slowdown = slowdown;
        self
    }

    /// Load a JSON file; fields absent from the file keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PlacementError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.stealing.validate()?;
        self.balancer.validate()?;
        if self.heartbeat_interval_ms == 0 {
            return Err(PlacementError::InvalidConfig(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_jobs == 0 {
            return Err(PlacementError::InvalidConfig(
                "max_jobs must be greater than 0".to_string(),
            ));
        }
        if !(self.work_slowdown.is_finite() && self.work_slowdown >= 0.0) {
            return Err(PlacementError::InvalidConfig(
                "work_slowdown must be a finite, non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}
