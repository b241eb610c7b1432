use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::collision::peer_table::{PeerRequestTable, StealCounter};
use crate::collision::{CollisionOutcome, CollisionResolver, ExternalCollisionListener};
use crate::config::StealingConfig;
use crate::error::Result;
use crate::message::{encode, StealRequest, TOPIC_STEAL_REQUEST};
use crate::scheduler::JobHandle;
use crate::topology::node::{
    ATTR_ACTIVE_JOBS_THRESHOLD, ATTR_MAX_STEALING_ATTEMPTS, ATTR_MESSAGE_EXPIRE_TIME,
    ATTR_WAIT_JOBS_THRESHOLD,
};
use crate::topology::{
    AttributeValue, DiscoveryEvent, GridNode, Messaging, NodeEventKind, NodeId, TaskTopology,
    Topology,
};

/// Read-only view of the resolver for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StealingMetrics {
    pub waiting_jobs: usize,
    pub active_jobs: usize,
    pub total_stolen_jobs: u64,
    pub total_requested_jobs: u64,
    pub current_steal_requests: i64,
    pub outstanding_sent_requests: u64,
    pub active_jobs_threshold: u32,
    pub wait_jobs_threshold: u32,
    pub max_stealing_attempts: u32,
    pub message_expire_time_ms: u64,
    pub stealing_enabled: bool,
}

#[derive(Debug, Default)]
struct Stats {
    waiting: AtomicUsize,
    active: AtomicUsize,
    stolen: AtomicU64,
    requested: AtomicU64,
}

/// Work-stealing collision resolver.
///
/// Keeps two request tables: `received` holds what each peer asked this
/// node for, `sent` holds what this node asked each peer for. The
/// `steal_requests` counter mirrors the sum of `received` so the busy path
/// can bail out without touching the table when nobody wants work.
pub struct JobStealingResolver {
    config: StealingConfig,
    topology: Arc<dyn Topology>,
    messaging: Arc<dyn Messaging>,
    task_topology: Arc<dyn TaskTopology>,
    received: PeerRequestTable,
    sent: PeerRequestTable,
    steal_requests: StealCounter,
    /// Round-robin order for idle-time requests.
    node_queue: Mutex<VecDeque<NodeId>>,
    listener: RwLock<Option<ExternalCollisionListener>>,
    stats: Stats,
}

impl JobStealingResolver {
    pub fn new(
        config: StealingConfig,
        topology: Arc<dyn Topology>,
        messaging: Arc<dyn Messaging>,
        task_topology: Arc<dyn TaskTopology>,
    ) -> Result<Self> {
        config.validate()?;

        let node_queue = topology.remote_nodes().into_iter().map(|n| n.id).collect();

        tracing::info!(
            active_jobs_threshold = config.active_jobs_threshold,
            wait_jobs_threshold = config.wait_jobs_threshold,
            max_stealing_attempts = config.max_stealing_attempts,
            message_expire_time_ms = config.message_expire_time_ms,
            stealing_enabled = config.stealing_enabled,
            "Job stealing resolver started"
        );

        Ok(Self {
            config,
            topology,
            messaging,
            task_topology,
            received: PeerRequestTable::new(),
            sent: PeerRequestTable::new(),
            steal_requests: StealCounter::new(),
            node_queue: Mutex::new(node_queue),
            listener: RwLock::new(None),
            stats: Stats::default(),
        })
    }

    /// Attributes a node running this resolver must publish so peers can
    /// decide whether to ask it for work.
    pub fn node_attributes(config: &StealingConfig) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (
                ATTR_WAIT_JOBS_THRESHOLD.to_string(),
                AttributeValue::from(config.wait_jobs_threshold),
            ),
            (
                ATTR_ACTIVE_JOBS_THRESHOLD.to_string(),
                AttributeValue::from(config.active_jobs_threshold),
            ),
            (
                ATTR_MAX_STEALING_ATTEMPTS.to_string(),
                AttributeValue::from(config.max_stealing_attempts),
            ),
            (
                ATTR_MESSAGE_EXPIRE_TIME.to_string(),
                AttributeValue::Int(config.message_expire_time_ms as i64),
            ),
        ])
    }

    pub fn config(&self) -> &StealingConfig {
        &self.config
    }

    /// Jobs peers currently ask from this node.
    pub fn steal_requests(&self) -> i64 {
        self.steal_requests.get()
    }

    pub fn received_requests(&self) -> &PeerRequestTable {
        &self.received
    }

    pub fn sent_requests(&self) -> &PeerRequestTable {
        &self.sent
    }

    pub fn metrics(&self) -> StealingMetrics {
        StealingMetrics {
            waiting_jobs: self.stats.waiting.load(Ordering::Relaxed),
            active_jobs: self.stats.active.load(Ordering::Relaxed),
            total_stolen_jobs: self.stats.stolen.load(Ordering::Relaxed),
            total_requested_jobs: self.stats.requested.load(Ordering::Relaxed),
            current_steal_requests: self.steal_requests.get(),
            outstanding_sent_requests: self.sent.live_total(self.expire_time()),
            active_jobs_threshold: self.config.active_jobs_threshold,
            wait_jobs_threshold: self.config.wait_jobs_threshold,
            max_stealing_attempts: self.config.max_stealing_attempts,
            message_expire_time_ms: self.config.message_expire_time_ms,
            stealing_enabled: self.config.stealing_enabled,
        }
    }

    fn expire_time(&self) -> Duration {
        self.config.message_expire_time()
    }

    /// A peer wants `request.delta` jobs in total.
    pub fn on_steal_request(&self, from: NodeId, request: StealRequest) {
        if !self.topology.contains(&from) {
            tracing::debug!(peer = %from, "Ignoring steal request from node outside topology");
            return;
        }

        let total = self.received.update(from, |state| {
            let previous = state.jobs_to_steal();
            let total = self
                .steal_requests
                .add(i64::from(request.delta) - i64::from(previous));
            state.reset(request.delta);
            total
        });

        tracing::debug!(
            peer = %from,
            jobs = request.delta,
            total_requests = total,
            "Steal request received"
        );

        self.notify_listener();
    }

    pub fn on_discovery_event(&self, event: &DiscoveryEvent) {
        let peer = event.node.id;
        if peer == self.topology.local_id() {
            return;
        }

        match event.kind {
            NodeEventKind::Joined => {
                let mut queue = self.node_queue.lock();
                if !queue.contains(&peer) {
                    queue.push_back(peer);
                }
            }
            NodeEventKind::Left | NodeEventKind::Failed => {
                self.node_queue.lock().retain(|id| *id != peer);
                self.forget_received(&peer);
                self.sent.remove(&peer);
                tracing::debug!(peer = %peer, event = %event.kind, "Dropped steal state of departed node");
            }
            NodeEventKind::MetricsUpdated => {}
        }
    }

    fn forget_received(&self, peer: &NodeId) {
        if let Some(held) = self.received.remove(peer) {
            if held > 0 {
                self.steal_requests.add(-i64::from(held));
            }
        }
    }

    fn notify_listener(&self) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    /// Activate what fits and hand surplus jobs to peers that asked.
    /// Returns `(activated, rejected)`.
    fn check_busy(&self, waiting: &[Arc<JobHandle>], active_len: usize) -> (usize, usize) {
        let activate_cnt = (self.config.active_jobs_threshold as usize).saturating_sub(active_len);
        let wait_threshold = i64::from(self.config.wait_jobs_threshold);
        let waiting_len = waiting.len() as i64;

        let mut attempted = 0usize;
        let mut activated = 0usize;
        let mut rejected = 0usize;
        let mut remote: Option<Vec<GridNode>> = None;

        for job in waiting {
            if attempted < activate_cnt {
                attempted += 1;
                if job.activate() {
                    activated += 1;
                }
                continue;
            }

            if job.is_stealing_disabled() {
                continue;
            }

            if self.steal_requests.get() == 0 {
                continue;
            }

            let attempts = job.stealing_attempts();
            if attempts >= self.config.max_stealing_attempts {
                tracing::debug!(
                    job_id = %job.id(),
                    attempts,
                    "Job reached max stealing attempts, keeping it"
                );
                continue;
            }

            let jobs_to_reject = waiting_len - activated as i64 - rejected as i64 - wait_threshold;
            if jobs_to_reject <= 0 {
                break;
            }

            let remote = remote.get_or_insert_with(|| self.topology.remote_nodes());
            if self.reject_to_peer(job, remote) {
                rejected += 1;
            }
        }

        (activated, rejected)
    }

    /// Hands `job` to the first peer with a live request that may run it.
    fn reject_to_peer(&self, job: &JobHandle, remote: &[GridNode]) -> bool {
        let expire_time = self.expire_time();
        let mut task_nodes: Option<HashSet<NodeId>> = None;

        for (peer, entry) in self.received.snapshot() {
            if !remote.iter().any(|n| n.id == peer) {
                self.forget_received(&peer);
                continue;
            }

            let mut state = entry.lock();
            if state.is_detached() {
                continue;
            }

            let asked = state.jobs_to_steal();
            if asked == 0 {
                continue;
            }

            if state.is_expired(expire_time) {
                self.steal_requests.add(-i64::from(asked));
                state.reset(0);
                tracing::debug!(peer = %peer, jobs = asked, "Steal request expired");
                continue;
            }

            let allowed = task_nodes.get_or_insert_with(|| {
                self.task_topology
                    .task_topology(job.session, remote)
                    .into_iter()
                    .map(|n| n.id)
                    .collect()
            });
            if !allowed.contains(&peer) {
                continue;
            }

            if !job.cancel() {
                // Activated or stolen by an overlapping pass.
                return false;
            }

            job.mark_stolen(peer);
            state.decrement();
            self.steal_requests.add(-1);

            tracing::debug!(job_id = %job.id(), thief = %peer, "Job stolen");
            return true;
        }

        false
    }

    /// Ask busy peers for work. Returns the number of jobs requested.
    fn check_idle(&self, waiting_len: usize, active_len: usize) -> u64 {
        let capacity = u64::from(self.config.wait_jobs_threshold)
            + u64::from(self.config.active_jobs_threshold);
        let held = (waiting_len as u64).saturating_add(active_len as u64);
        let jobs_to_steal = capacity.saturating_sub(held);
        if jobs_to_steal == 0 {
            return 0;
        }

        let mut jobs_left = jobs_to_steal;
        let mut requested = 0u64;

        // One pass over the peers known at this point.
        let peer_count = self.node_queue.lock().len();
        for _ in 0..peer_count {
            if jobs_left == 0 {
                break;
            }

            let Some(peer_id) = self.node_queue.lock().pop_front() else {
                break;
            };

            if let Some(peer) = self.topology.node(&peer_id) {
                requested += self.request_from_peer(&peer, &mut jobs_left);
            }

            if self.topology.contains(&peer_id) {
                self.node_queue.lock().push_back(peer_id);
            }
        }

        requested
    }

    fn request_from_peer(&self, peer: &GridNode, jobs_left: &mut u64) -> u64 {
        if !self.config.stealing_attributes.matches(peer) {
            return 0;
        }

        let Some(peer_threshold) = peer
            .attribute(ATTR_WAIT_JOBS_THRESHOLD)
            .and_then(AttributeValue::as_i64)
        else {
            tracing::debug!(
                peer = %peer.id,
                "Peer does not publish a wait jobs threshold, job stealing is not configured there"
            );
            return 0;
        };

        let delta = i64::from(peer.metrics.current_waiting_jobs) - peer_threshold;
        if delta <= 0 {
            return 0;
        }

        let expire_time = self.expire_time();
        self.sent.update(peer.id, |state| {
            if state.is_expired(expire_time) {
                state.reset(0);
            }

            let outstanding = u64::from(state.jobs_to_steal());
            if outstanding > 0 {
                *jobs_left = jobs_left.saturating_sub(outstanding);
                return 0;
            }

            let jobs = (delta as u64).min(*jobs_left);
            let jobs = u32::try_from(jobs).unwrap_or(u32::MAX);

            let sent = encode(&StealRequest { delta: jobs }).and_then(|payload| {
                self.messaging.send(&peer.id, TOPIC_STEAL_REQUEST, payload)
            });
            match sent {
                Ok(()) => {
                    state.reset(jobs);
                    *jobs_left -= u64::from(jobs);
                    self.stats.requested.fetch_add(u64::from(jobs), Ordering::Relaxed);
                    tracing::debug!(peer = %peer.id, jobs, "Steal request sent");
                    u64::from(jobs)
                }
                Err(e) => {
                    tracing::warn!(peer = %peer.id, error = %e, "Failed to send steal request");
                    0
                }
            }
        })
    }
}

impl CollisionResolver for JobStealingResolver {
    fn on_collision(
        &self,
        waiting: &[Arc<JobHandle>],
        active: &[Arc<JobHandle>],
    ) -> CollisionOutcome {
        self.stats.waiting.store(waiting.len(), Ordering::Relaxed);
        self.stats.active.store(active.len(), Ordering::Relaxed);

        let (activated, rejected) = self.check_busy(waiting, active.len());
        self.stats.stolen.fetch_add(rejected as u64, Ordering::Relaxed);

        let mut outcome = CollisionOutcome {
            activated,
            rejected,
            requested: 0,
        };

        // Never hand jobs away and ask for jobs in the same pass.
        if rejected > 0 {
            return outcome;
        }

        if self.config.stealing_enabled {
            outcome.requested = self.check_idle(waiting.len(), active.len());
        }

        outcome
    }

    fn set_external_listener(&self, listener: Option<ExternalCollisionListener>) {
        *self.listener.write() = listener;
    }
}
