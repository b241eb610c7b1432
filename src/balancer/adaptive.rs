use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::balancer::probe::LoadProbe;
use crate::balancer::session::{CacheLookup, TaskSessionCache};
use crate::balancer::{LoadBalancer, TaskEvent};
use crate::config::AdaptiveConfig;
use crate::error::{PlacementError, Result};
use crate::scheduler::{JobSpec, SessionId};
use crate::topology::{DiscoveryEvent, GridNode, NodeEventKind, NodeId};

/// Nodes laid out on `[0, 1]` with widths proportional to inverse load.
#[derive(Debug, Clone)]
pub struct WeightedTopology {
    /// Cumulative upper bound of each node's slice, ascending, last is 1.0.
    circle: Vec<(f64, GridNode)>,
}

impl WeightedTopology {
    /// `jobs_sent` reports the per-node sent counter handed to the probe.
    pub fn new(
        probe: &dyn LoadProbe,
        nodes: &[GridNode],
        jobs_sent: impl Fn(&NodeId) -> u64,
    ) -> Result<Self> {
        let mut loads = Vec::with_capacity(nodes.len());
        let mut total_load = 0.0;

        for node in nodes {
            let load = probe.load(node, jobs_sent(&node.id));
            if !(load.is_finite() && load >= 0.0) {
                return Err(PlacementError::NegativeLoad {
                    node_id: node.id,
                    load,
                });
            }
            loads.push(load);
            total_load += load;
        }

        // A zero load would mean an infinite weight. Give such nodes the
        // average load instead. The total grows with every substitution, so
        // later zero-load nodes see a larger average.
        let non_zero = loads.iter().filter(|l| **l > 0.0).count();
        for load in loads.iter_mut() {
            if *load == 0.0 {
                let substitute = if non_zero > 0 {
                    total_load / non_zero as f64
                } else {
                    1.0
                };
                *load = substitute;
                total_load += substitute;
            }
        }

        let weights: Vec<f64> = loads.iter().map(|load| total_load / load).collect();
        let total_weight: f64 = weights.iter().sum();

        let mut circle = Vec::with_capacity(nodes.len());
        let mut cumulative = 0.0;
        for (node, weight) in nodes.iter().zip(&weights) {
            cumulative += weight / total_weight;
            circle.push((cumulative, node.clone()));
        }

        // Rounding must not leave a gap at the top.
        if let Some(last) = circle.last_mut() {
            last.0 = 1.0;
        }

        Ok(Self { circle })
    }

    /// Node whose slice contains `r`, for `r` in `[0, 1)`.
    pub fn pick(&self, r: f64) -> &GridNode {
        let idx = self.circle.partition_point(|(bound, _)| *bound < r);
        &self.circle[idx.min(self.circle.len() - 1)].1
    }

    pub fn pick_random(&self) -> &GridNode {
        let r: f64 = rand::thread_rng().gen();
        self.pick(r)
    }

    /// Cumulative bounds in candidate order.
    pub fn cumulative(&self) -> Vec<f64> {
        self.circle.iter().map(|(bound, _)| *bound).collect()
    }

    /// Probability of each node in candidate order.
    pub fn shares(&self) -> Vec<f64> {
        let mut previous = 0.0;
        self.circle
            .iter()
            .map(|(bound, _)| {
                let share = bound - previous;
                previous = *bound;
                share
            })
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GridNode> {
        self.circle.iter().map(|(_, node)| node)
    }

    /// True if every node laid out here is one of `candidates`.
    pub fn within(&self, candidates: &[GridNode]) -> bool {
        self.nodes()
            .all(|node| candidates.iter().any(|c| c.id == node.id))
    }

    pub fn len(&self) -> usize {
        self.circle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circle.is_empty()
    }
}

#[derive(Debug, Default)]
struct AdaptiveState {
    /// Jobs sent to each node since its metrics were last refreshed.
    sent_jobs: HashMap<NodeId, AtomicU64>,
    tasks: TaskSessionCache<Arc<WeightedTopology>>,
}

/// Weighted random balancer driven by a [`LoadProbe`].
///
/// One reader/writer lock covers the sent-job counters and the task cache.
/// Membership changes and cache inserts/removals take the write side;
/// load reads and counter increments take the read side.
pub struct AdaptiveBalancer {
    probe: Arc<dyn LoadProbe>,
    state: RwLock<AdaptiveState>,
}

impl AdaptiveBalancer {
    pub fn new(probe: Arc<dyn LoadProbe>) -> Self {
        Self {
            probe,
            state: RwLock::new(AdaptiveState::default()),
        }
    }

    pub fn from_config(config: &AdaptiveConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.probe.build()))
    }

    pub fn sent_jobs(&self, node: &NodeId) -> u64 {
        self.state
            .read()
            .sent_jobs
            .get(node)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn cached_sessions(&self) -> usize {
        self.state.read().tasks.len()
    }

    pub fn weighted_topology(&self, candidates: &[GridNode]) -> Result<WeightedTopology> {
        let state = self.state.read();
        WeightedTopology::new(self.probe.as_ref(), candidates, |id| {
            state
                .sent_jobs
                .get(id)
                .map(|c| c.load(Ordering::Acquire))
                .unwrap_or(0)
        })
    }

    fn count_sent(&self, node: &NodeId) {
        {
            let state = self.state.read();
            if let Some(counter) = state.sent_jobs.get(node) {
                counter.fetch_add(1, Ordering::AcqRel);
                return;
            }
        }

        self.state
            .write()
            .sent_jobs
            .entry(*node)
            .or_default()
            .fetch_add(1, Ordering::AcqRel);
    }
}

impl LoadBalancer for AdaptiveBalancer {
    fn pick_node(
        &self,
        session: SessionId,
        candidates: &[GridNode],
        _job: &JobSpec,
    ) -> Result<GridNode> {
        if candidates.is_empty() {
            return Err(PlacementError::EmptyCandidates(session));
        }

        let cached = self.state.read().tasks.lookup(session);
        let topology = match cached {
            CacheLookup::Cached(topology) => Some(topology),
            CacheLookup::Mapped => None,
            CacheLookup::Miss => {
                let built = Arc::new(self.weighted_topology(candidates)?);
                Some(self.state.write().tasks.insert(session, built))
            }
        };

        // A fail-over while the task is still mapping narrows the candidates.
        // The cached layout may then hold the node that just refused the job.
        let topology = match topology {
            Some(topology) if topology.within(candidates) => topology,
            _ => Arc::new(self.weighted_topology(candidates)?),
        };

        let node = topology.pick_random().clone();
        self.count_sent(&node.id);

        tracing::trace!(session = %session, node_id = %node.id, "Adaptive balancer picked node");
        Ok(node)
    }

    fn on_discovery_event(&self, event: &DiscoveryEvent) {
        let mut state = self.state.write();
        match event.kind {
            NodeEventKind::Joined | NodeEventKind::MetricsUpdated => {
                state.sent_jobs.insert(event.node.id, AtomicU64::new(0));
            }
            NodeEventKind::Left | NodeEventKind::Failed => {
                state.sent_jobs.remove(&event.node.id);
            }
        }
    }

    fn on_task_event(&self, event: &TaskEvent) {
        let mut state = self.state.write();
        match event {
            TaskEvent::JobMapped(session) => {
                state.tasks.mark_mapped(*session);
            }
            TaskEvent::TaskFinished(session) | TaskEvent::TaskFailed(session) => {
                state.tasks.remove(*session);
            }
        }
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}
