use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::balancer::ring::{AffinityHasher, AffinityRing, Md5Hasher};
use crate::balancer::session::{CacheLookup, TaskSessionCache};
use crate::balancer::{LoadBalancer, TaskEvent};
use crate::config::AffinityConfig;
use crate::error::{PlacementError, Result};
use crate::scheduler::{JobSpec, SessionId};
use crate::topology::node::ATTR_AFFINITY_REPLICAS;
use crate::topology::{AttributeValue, DiscoveryEvent, GridNode, NodeEventKind, NodeId};

/// Replicas used for nodes that do not publish their own count.
pub const DEFAULT_REPLICAS: u32 = 1000;

/// Routes jobs with an affinity key to the same node for as long as that
/// node stays in the topology.
pub struct AffinityBalancer {
    config: AffinityConfig,
    ring: AffinityRing,
    tasks: Mutex<TaskSessionCache<Arc<HashSet<NodeId>>>>,
}

impl AffinityBalancer {
    pub fn new(config: AffinityConfig, hasher: Arc<dyn AffinityHasher>) -> Result<Self> {
        config.validate()?;

        let ring = AffinityRing::new(config.affinity_seed.clone(), hasher);
        Ok(Self {
            config,
            ring,
            tasks: Mutex::new(TaskSessionCache::new()),
        })
    }

    pub fn from_config(config: AffinityConfig) -> Result<Self> {
        Self::new(config, Arc::new(Md5Hasher))
    }

    /// Attributes this node must publish so peers size its ring share.
    pub fn node_attributes(config: &AffinityConfig) -> HashMap<String, AttributeValue> {
        HashMap::from([(
            ATTR_AFFINITY_REPLICAS.to_string(),
            AttributeValue::from(config.virtual_node_count),
        )])
    }

    pub fn ring(&self) -> &AffinityRing {
        &self.ring
    }

    /// Adds `node` to the ring unless the node filter excludes it.
    pub fn add_node(&self, node: &GridNode) {
        if !self.config.node_filter.matches(node) {
            tracing::debug!(node_id = %node.id, "Node excluded from affinity ring by filter");
            return;
        }

        let replicas = match node
            .attribute(ATTR_AFFINITY_REPLICAS)
            .and_then(AttributeValue::as_i64)
        {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => {
                tracing::warn!(
                    node_id = %node.id,
                    attribute = ATTR_AFFINITY_REPLICAS,
                    default = DEFAULT_REPLICAS,
                    "Node does not publish affinity replicas, using default"
                );
                DEFAULT_REPLICAS
            }
        };

        let won = self.ring.add_node(node.id, replicas);
        tracing::debug!(node_id = %node.id, replicas, won, "Node added to affinity ring");
    }

    pub fn remove_node(&self, node: &NodeId) {
        let removed = self.ring.remove_node(node);
        tracing::debug!(node_id = %node, removed, "Node removed from affinity ring");
    }

    fn candidate_set(&self, session: SessionId, candidates: &[GridNode]) -> Arc<HashSet<NodeId>> {
        let build = || Arc::new(candidates.iter().map(|n| n.id).collect::<HashSet<_>>());

        let mut tasks = self.tasks.lock();
        match tasks.lookup(session) {
            CacheLookup::Cached(set) => set,
            CacheLookup::Mapped => build(),
            CacheLookup::Miss => tasks.insert(session, build()),
        }
    }

    fn random(candidates: &[GridNode], session: SessionId) -> Result<GridNode> {
        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(PlacementError::EmptyCandidates(session))
    }
}

impl LoadBalancer for AffinityBalancer {
    fn pick_node(
        &self,
        session: SessionId,
        candidates: &[GridNode],
        job: &JobSpec,
    ) -> Result<GridNode> {
        if candidates.is_empty() {
            return Err(PlacementError::EmptyCandidates(session));
        }

        let Some(key) = job.affinity_key.as_deref() else {
            return Self::random(candidates, session);
        };

        // Owners must be in the session set and in the current candidates.
        let allowed = self.candidate_set(session, candidates);
        let owner = self.ring.get(key.as_bytes(), |id| {
            allowed.contains(id) && candidates.iter().any(|n| n.id == *id)
        });

        if let Some(node) = owner.and_then(|id| candidates.iter().find(|n| n.id == id)) {
            return Ok(node.clone());
        }

        tracing::warn!(
            session = %session,
            key,
            ring_nodes = self.ring.node_count(),
            candidates = candidates.len(),
            "No candidate found on the affinity ring, check the node filter. Picking randomly"
        );
        Self::random(candidates, session)
    }

    fn on_discovery_event(&self, event: &DiscoveryEvent) {
        match event.kind {
            NodeEventKind::Joined => self.add_node(&event.node),
            NodeEventKind::Left | NodeEventKind::Failed => self.remove_node(&event.node.id),
            NodeEventKind::MetricsUpdated => {}
        }
    }

    fn on_task_event(&self, event: &TaskEvent) {
        let mut tasks = self.tasks.lock();
        match event {
            TaskEvent::JobMapped(session) => {
                tasks.mark_mapped(*session);
            }
            TaskEvent::TaskFinished(session) | TaskEvent::TaskFailed(session) => {
                tasks.remove(*session);
            }
        }
    }

    fn name(&self) -> &'static str {
        "affinity"
    }
}
