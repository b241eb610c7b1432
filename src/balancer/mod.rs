//! Load balancing: picking the node a new job is sent to.
//!
//! - [`AdaptiveBalancer`]: weighted random choice, weights from a [`LoadProbe`]
//! - [`AffinityBalancer`]: consistent hashing of the job's affinity key
//!
//! Both keep a per-task-session cache ([`TaskSessionCache`]) that lives
//! until the session's jobs are mapped.

pub mod adaptive;
pub mod affinity;
pub mod probe;
pub mod ring;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use adaptive::{AdaptiveBalancer, WeightedTopology};
pub use affinity::{AffinityBalancer, DEFAULT_REPLICAS};
pub use probe::{
    BenchmarkLoadProbe, CpuLoadProbe, JobCountLoadProbe, LoadProbe, ProbeConfig,
    ProcessingTimeLoadProbe,
};
pub use ring::{AffinityHasher, AffinityRing, Md5Hasher};
pub use session::{CacheLookup, TaskSessionCache};

use crate::config::BalancerConfig;
use crate::error::Result;
use crate::scheduler::{JobSpec, SessionId};
use crate::topology::{AttributeValue, DiscoveryEvent, GridNode, Topology};

/// Task session lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    /// Every job of the session has been placed once.
    JobMapped(SessionId),
    TaskFinished(SessionId),
    TaskFailed(SessionId),
}

impl TaskEvent {
    pub fn session(&self) -> SessionId {
        match self {
            TaskEvent::JobMapped(s) | TaskEvent::TaskFinished(s) | TaskEvent::TaskFailed(s) => *s,
        }
    }
}

pub trait LoadBalancer: Send + Sync {
    /// Picks one of `candidates` for `job`. An empty candidate list is an
    /// error.
    fn pick_node(&self, session: SessionId, candidates: &[GridNode], job: &JobSpec)
        -> Result<GridNode>;

    fn on_discovery_event(&self, event: &DiscoveryEvent);

    fn on_task_event(&self, event: &TaskEvent);

    fn name(&self) -> &'static str;
}

/// Attributes a node running this balancer publishes.
pub fn node_attributes(config: &BalancerConfig) -> HashMap<String, AttributeValue> {
    match config {
        BalancerConfig::Adaptive(_) => HashMap::new(),
        BalancerConfig::Affinity(cfg) => AffinityBalancer::node_attributes(cfg),
    }
}

/// Builds the configured balancer and seeds it with the current topology.
pub fn build_balancer(
    config: &BalancerConfig,
    topology: &dyn Topology,
) -> Result<Arc<dyn LoadBalancer>> {
    let balancer: Arc<dyn LoadBalancer> = match config {
        BalancerConfig::Adaptive(cfg) => Arc::new(AdaptiveBalancer::from_config(cfg)?),
        BalancerConfig::Affinity(cfg) => Arc::new(AffinityBalancer::from_config(cfg.clone())?),
    };

    for node in topology.all_nodes() {
        balancer.on_discovery_event(&DiscoveryEvent::joined(node));
    }

    tracing::info!(balancer = balancer.name(), "Load balancer ready");
    Ok(balancer)
}
