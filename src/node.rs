use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::balancer::{self, LoadBalancer, TaskEvent};
use crate::cluster::{Cluster, ClusterHandle, Envelope};
use crate::collision::{CollisionResolver, JobStealingResolver};
use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{PlacementError, Result};
use crate::failover::{FailoverContext, JobStealingFailover};
use crate::message::{
    self, JobRejected, JobResult, JobTransfer, StealRequest, TOPIC_JOB_REJECTED,
    TOPIC_JOB_RESULT, TOPIC_JOB_SUBMIT, TOPIC_STEAL_REQUEST,
};
use crate::scheduler::{JobHandle, JobQueue, JobSpec, SessionId};
use crate::topology::node::ATTR_NODE_BENCHMARK;
use crate::topology::{
    AttributeValue, DiscoveryEvent, GridNode, Messaging, NodeBenchmark, NodeId,
    SessionTopologies, TaskTopology, Topology,
};
use crate::worker::{ExecutionResult, HeartbeatSender, JobExecutor, MetricsTracker};

const BENCHMARK_BUDGET: Duration = Duration::from_millis(50);

/// Receivers a node's loops consume. Created before the node joins so no
/// event after the join is missed.
pub struct NodeInbox {
    events: broadcast::Receiver<DiscoveryEvent>,
    messages: mpsc::Receiver<Envelope>,
}

/// How `submit_task` places jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Every job goes through the load balancer.
    Balanced,
    /// Every job is queued on the submitting node.
    Local,
}

/// Final state of a task session.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub session: SessionId,
    pub results: Vec<JobResult>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct TaskHandle {
    pub session: SessionId,
    done: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub async fn wait(self) -> Result<TaskOutcome> {
        self.done
            .await
            .map_err(|_| PlacementError::Internal("task tracking dropped".to_string()))
    }
}

#[derive(Debug, Default)]
pub struct NodeStats {
    executed: AtomicU64,
    executed_stolen: AtomicU64,
    handed_off: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStatsSnapshot {
    /// Jobs run on this node.
    pub executed: u64,
    /// Of those, jobs that were stolen at least once.
    pub executed_stolen: u64,
    /// Jobs this node gave to thieves.
    pub handed_off: u64,
}

impl NodeStats {
    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            executed_stolen: self.executed_stolen.load(Ordering::Relaxed),
            handed_off: self.handed_off.load(Ordering::Relaxed),
        }
    }
}

struct PendingJob {
    transfer: JobTransfer,
    node: NodeId,
}

/// A task session mapped from this node.
struct TaskState {
    pending: HashMap<Uuid, PendingJob>,
    results: Vec<JobResult>,
    done: Option<oneshot::Sender<TaskOutcome>>,
}

/// One grid node: owns the local job queue and drives collision
/// resolution, load balancing and fail-over for the tasks it maps.
pub struct Node {
    pub config: NodeConfig,
    id: NodeId,
    cluster: Cluster,
    handle: Arc<ClusterHandle>,
    pub job_queue: Arc<RwLock<JobQueue>>,
    pub resolver: Arc<JobStealingResolver>,
    pub balancer: Arc<dyn LoadBalancer>,
    failover: JobStealingFailover,
    task_topology: Arc<SessionTopologies>,
    executor: JobExecutor,
    metrics: MetricsTracker,
    stats: Arc<NodeStats>,
    tasks: Mutex<HashMap<SessionId, TaskState>>,
    collision: Arc<Notify>,
    shutdown: CancellationToken,
    dashboard_addr: Option<SocketAddr>,
}

impl Node {
    /// Builds the node's components and joins `cluster`.
    pub fn new(
        config: NodeConfig,
        cluster: &Cluster,
        dashboard_addr: Option<SocketAddr>,
    ) -> Result<(Arc<Self>, NodeInbox)> {
        config.validate()?;

        let id = Uuid::new_v4();
        let handle = Arc::new(cluster.handle(id));
        let task_topology = Arc::new(SessionTopologies::new());

        let resolver = Arc::new(JobStealingResolver::new(
            config.stealing.clone(),
            handle.clone(),
            handle.clone(),
            task_topology.clone(),
        )?);
        let balancer = balancer::build_balancer(&config.balancer, handle.as_ref())?;
        let failover = JobStealingFailover::new(config.failover.clone(), balancer.clone());

        let collision = Arc::new(Notify::new());
        let notify = collision.clone();
        resolver.set_external_listener(Some(Arc::new(move || notify.notify_one())));

        let mut local = GridNode::new(id)
            .with_attributes(JobStealingResolver::node_attributes(&config.stealing))
            .with_attributes(balancer::node_attributes(&config.balancer));
        if config.publish_benchmark {
            let bench = NodeBenchmark::measure(BENCHMARK_BUDGET);
            local = local.with_attribute(ATTR_NODE_BENCHMARK, AttributeValue::Benchmark(bench));
        }

        let events = cluster.subscribe();
        let (_, messages) = cluster.join(local);

        let node = Arc::new(Self {
            job_queue: Arc::new(RwLock::new(JobQueue::with_capacity(config.max_jobs))),
            executor: JobExecutor::with_slowdown(config.work_slowdown),
            config,
            id,
            cluster: cluster.clone(),
            handle,
            resolver,
            balancer,
            failover,
            task_topology,
            metrics: MetricsTracker::new(),
            stats: Arc::new(NodeStats::default()),
            tasks: Mutex::new(HashMap::new()),
            collision,
            shutdown: CancellationToken::new(),
            dashboard_addr,
        });

        Ok((node, NodeInbox { events, messages }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn stats(&self) -> NodeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Per-session node restrictions consulted by stealing and fail-over.
    pub fn session_topologies(&self) -> &SessionTopologies {
        &self.task_topology
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn queue_sizes(&self) -> (usize, usize) {
        let queue = self.job_queue.read().await;
        (queue.waiting_len(), queue.active_len())
    }

    /// Spawns the node's loops and returns immediately.
    ///
    /// 1. Discovery loop: feeds membership changes to the resolver and the
    ///    balancer, re-places jobs lost with departed nodes
    /// 2. Inbox loop: steal requests, job transfers, rejections, results
    /// 3. Collision loop: runs the resolver whenever the job sets change
    /// 4. Heartbeat loop: publishes metrics and re-runs collision resolution
    /// 5. The dashboard, if an address was given
    pub fn start(self: &Arc<Self>, inbox: NodeInbox) {
        let NodeInbox { events, messages } = inbox;

        tokio::spawn(self.clone().discovery_loop(events));
        tokio::spawn(self.clone().inbox_loop(messages));
        tokio::spawn(self.clone().collision_loop());
        tokio::spawn(self.clone().heartbeat_loop());

        if let Some(addr) = self.dashboard_addr {
            let state = DashboardState {
                node_id: self.id,
                balancer: self.balancer.name(),
                job_queue: self.job_queue.clone(),
                resolver: self.resolver.clone(),
                stats: self.stats.clone(),
            };
            tokio::spawn(run_dashboard(addr, state, self.shutdown.clone()));
        }

        self.collision.notify_one();
        tracing::info!(node_id = %self.id, balancer = self.balancer.name(), "Node started");
    }

    /// Starts the node and waits for shutdown.
    pub async fn run(self: Arc<Self>, inbox: NodeInbox) {
        self.start(inbox);
        self.shutdown.cancelled().await;
    }

    /// Stops the loops and leaves the cluster.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.cluster.leave(&self.id);
        tracing::info!(node_id = %self.id, "Node stopped");
    }

    pub async fn submit_task(&self, jobs: Vec<JobSpec>) -> Result<TaskHandle> {
        self.submit_task_with(Uuid::new_v4(), jobs, Placement::Balanced)
            .await
    }

    /// Maps every job of a new task session, then reports the session
    /// mapped to the balancer. The handle resolves once every job reported
    /// a result or the task failed.
    pub async fn submit_task_with(
        &self,
        session: SessionId,
        jobs: Vec<JobSpec>,
        placement: Placement,
    ) -> Result<TaskHandle> {
        let (tx, rx) = oneshot::channel();
        let candidates = self.task_nodes(session);
        if candidates.is_empty() {
            return Err(PlacementError::EmptyCandidates(session));
        }

        let mut assignments = Vec::with_capacity(jobs.len());
        for spec in jobs {
            let target = match placement {
                Placement::Local => self.id,
                Placement::Balanced => self.balancer.pick_node(session, &candidates, &spec)?.id,
            };
            assignments.push((JobTransfer::new(session, self.id, spec), target));
        }

        {
            let mut tasks = self.tasks.lock();
            let pending = assignments
                .iter()
                .map(|(transfer, node)| {
                    (
                        transfer.spec.id,
                        PendingJob {
                            transfer: transfer.clone(),
                            node: *node,
                        },
                    )
                })
                .collect();
            tasks.insert(
                session,
                TaskState {
                    pending,
                    results: Vec::new(),
                    done: Some(tx),
                },
            );
        }

        let count = assignments.len();
        for (transfer, target) in assignments {
            self.place(transfer, target).await;
        }

        self.balancer.on_task_event(&TaskEvent::JobMapped(session));
        tracing::info!(session = %session, jobs = count, "Task mapped");

        // An empty task is finished as soon as it is mapped.
        if count == 0 {
            self.finish_task(session, None);
        }

        Ok(TaskHandle { session, done: rx })
    }

    /// Live nodes `session` may run on.
    fn task_nodes(&self, session: SessionId) -> Vec<GridNode> {
        self.task_topology
            .task_topology(session, &self.handle.all_nodes())
    }

    /// Hands `transfer` to `target`, failing over until some node accepts
    /// it or the attempts run out.
    async fn place(&self, mut transfer: JobTransfer, mut target: NodeId) {
        loop {
            match self.deliver(target, &transfer).await {
                Ok(()) => {
                    self.record_assignment(&transfer, target);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %transfer.spec.id,
                        node_id = %target,
                        error = %e,
                        "Job delivery failed, failing over"
                    );
                    match self.failover_target(&transfer, target, None) {
                        Ok(next) => {
                            transfer.failover_attempts += 1;
                            target = next;
                        }
                        Err(e) => {
                            self.finish_task(transfer.session, Some(e.to_string()));
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn deliver(&self, target: NodeId, transfer: &JobTransfer) -> Result<()> {
        if target == self.id {
            return self.enqueue(transfer.clone().into_handle()).await;
        }
        self.handle
            .send(&target, TOPIC_JOB_SUBMIT, message::encode(transfer)?)
    }

    async fn enqueue(&self, job: JobHandle) -> Result<()> {
        let job_id = job.id();
        let added = self.job_queue.write().await.add_job(Arc::new(job));
        if !added {
            return Err(PlacementError::QueueFull);
        }

        tracing::debug!(job_id = %job_id, "Job queued");
        self.collision.notify_one();
        Ok(())
    }

    fn failover_target(
        &self,
        transfer: &JobTransfer,
        rejected_by: NodeId,
        thief: Option<NodeId>,
    ) -> Result<NodeId> {
        let topology = self.task_nodes(transfer.session);
        let ctx = FailoverContext {
            session: transfer.session,
            job: &transfer.spec,
            rejected_by,
            thief,
            failover_attempts: transfer.failover_attempts,
            topology: &topology,
        };
        Ok(self.failover.failover(&ctx)?.id)
    }

    fn record_assignment(&self, transfer: &JobTransfer, node: NodeId) {
        let mut tasks = self.tasks.lock();
        if let Some(pending) = tasks
            .get_mut(&transfer.session)
            .and_then(|task| task.pending.get_mut(&transfer.spec.id))
        {
            pending.transfer = transfer.clone();
            pending.node = node;
        }
    }

    /// A job of a task mapped here was given away or refused.
    async fn on_job_rejected(&self, rejected: JobRejected) {
        let JobRejected {
            job,
            rejected_by,
            thief,
        } = rejected;

        let known = self
            .tasks
            .lock()
            .get(&job.session)
            .is_some_and(|task| task.pending.contains_key(&job.spec.id));
        if !known {
            tracing::debug!(job_id = %job.spec.id, "Rejection for unknown job ignored");
            return;
        }

        match self.failover_target(&job, rejected_by, thief) {
            Ok(target) => {
                let mut job = job;
                job.failover_attempts += 1;
                self.place(job, target).await;
            }
            Err(e) => self.finish_task(job.session, Some(e.to_string())),
        }
    }

    fn on_job_result(&self, result: JobResult) {
        let finished = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&result.session) else {
                return;
            };
            if task.pending.remove(&result.job_id).is_none() {
                // Duplicate after a fail-over.
                return;
            }
            task.results.push(result.clone());
            task.pending.is_empty()
        };

        if finished {
            self.finish_task(result.session, None);
        }
    }

    fn finish_task(&self, session: SessionId, error: Option<String>) {
        let Some(mut task) = self.tasks.lock().remove(&session) else {
            return;
        };

        let event = match &error {
            None => {
                tracing::info!(session = %session, jobs = task.results.len(), "Task finished");
                TaskEvent::TaskFinished(session)
            }
            Some(reason) => {
                tracing::warn!(session = %session, reason, "Task failed");
                TaskEvent::TaskFailed(session)
            }
        };
        self.balancer.on_task_event(&event);
        self.task_topology.remove(session);

        if let Some(done) = task.done.take() {
            let _ = done.send(TaskOutcome {
                session,
                results: task.results,
                error,
            });
        }
    }

    /// Jobs of local tasks that were sitting on `departed`.
    async fn reroute_lost_jobs(&self, departed: NodeId) {
        let lost: Vec<JobTransfer> = self
            .tasks
            .lock()
            .values()
            .flat_map(|task| task.pending.values())
            .filter(|p| p.node == departed)
            .map(|p| p.transfer.clone())
            .collect();

        for job in lost {
            tracing::info!(job_id = %job.spec.id, node_id = %departed, "Re-placing job of departed node");
            self.on_job_rejected(JobRejected {
                job,
                rejected_by: departed,
                thief: None,
            })
            .await;
        }
    }

    fn report(&self, to: NodeId, topic: &str, payload: Result<Vec<u8>>) {
        let sent = payload.and_then(|bytes| self.handle.send(&to, topic, bytes));
        if let Err(e) = sent {
            tracing::warn!(node_id = %to, topic, error = %e, "Failed to report to task origin");
        }
    }

    async fn report_rejected(&self, job: &JobHandle, thief: Option<NodeId>) {
        let rejected = JobRejected {
            job: JobTransfer::from_handle(job),
            rejected_by: self.id,
            thief,
        };
        if job.origin == self.id {
            self.on_job_rejected(rejected).await;
        } else {
            self.report(job.origin, TOPIC_JOB_REJECTED, message::encode(&rejected));
        }
    }

    fn report_result(&self, result: &ExecutionResult) {
        let msg = JobResult {
            session: result.session,
            job_id: result.job_id,
            executed_by: self.id,
            stealing_attempts: result.stealing_attempts,
            completed_at: Utc::now(),
        };
        if result.origin == self.id {
            self.on_job_result(msg);
        } else {
            self.report(result.origin, TOPIC_JOB_RESULT, message::encode(&msg));
        }
    }

    async fn discovery_loop(self: Arc<Self>, mut events: broadcast::Receiver<DiscoveryEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(event) => {
                    self.resolver.on_discovery_event(&event);
                    self.balancer.on_discovery_event(&event);
                    if event.kind.is_departure() && event.node.id != self.id {
                        self.reroute_lost_jobs(event.node.id).await;
                    }
                    self.collision.notify_one();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(node_id = %self.id, skipped, "Discovery events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn inbox_loop(self: Arc<Self>, mut messages: mpsc::Receiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                envelope = messages.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if let Err(e) = self.dispatch(envelope).await {
                tracing::warn!(node_id = %self.id, error = %e, "Failed to handle message");
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        match envelope.topic.as_str() {
            TOPIC_STEAL_REQUEST => {
                let request: StealRequest = message::decode(&envelope.payload)?;
                self.resolver.on_steal_request(envelope.from, request);
            }
            TOPIC_JOB_SUBMIT => {
                let transfer: JobTransfer = message::decode(&envelope.payload)?;
                let job = Arc::new(transfer.into_handle());
                let added = self.job_queue.write().await.add_job(job.clone());
                if !added {
                    // Hand the job back so its origin can fail it over.
                    tracing::warn!(job_id = %job.id(), "Job queue at capacity, rejecting job");
                    self.report_rejected(&job, None).await;
                }
                self.collision.notify_one();
            }
            TOPIC_JOB_REJECTED => {
                let rejected: JobRejected = message::decode(&envelope.payload)?;
                self.on_job_rejected(rejected).await;
            }
            TOPIC_JOB_RESULT => {
                let result: JobResult = message::decode(&envelope.payload)?;
                self.on_job_result(result);
            }
            other => {
                tracing::debug!(topic = other, from = %envelope.from, "Unknown topic ignored");
            }
        }
        Ok(())
    }

    async fn collision_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.collision.notified() => {}
            }

            let (waiting, active) = {
                let queue = self.job_queue.read().await;
                (queue.waiting_jobs(), queue.active_jobs())
            };

            let outcome = self.resolver.on_collision(&waiting, &active);
            let settled = self.job_queue.write().await.settle();

            if outcome.activated + outcome.rejected > 0 || outcome.requested > 0 {
                tracing::debug!(
                    node_id = %self.id,
                    activated = outcome.activated,
                    rejected = outcome.rejected,
                    requested = outcome.requested,
                    "Collision resolved"
                );
            }

            if !settled.cancelled.is_empty() {
                self.metrics.record_cancelled(settled.cancelled.len());
            }

            for job in settled.cancelled {
                let thief = job.thief();
                if thief.is_some() {
                    self.stats.handed_off.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_rejected(1);
                }
                self.report_rejected(&job, thief).await;
            }

            for job in settled.activated {
                tokio::spawn(self.clone().execute(job));
            }
        }
    }

    async fn execute(self: Arc<Self>, job: Arc<JobHandle>) {
        let result = self.executor.execute(&job).await;

        self.metrics
            .record_execution(result.wait_time, result.execute_time);
        self.stats.executed.fetch_add(1, Ordering::Relaxed);
        if result.stealing_attempts > 0 {
            self.stats.executed_stolen.fetch_add(1, Ordering::Relaxed);
        }

        self.job_queue.write().await.complete(&result.job_id);
        self.report_result(&result);
        self.collision.notify_one();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = HeartbeatSender::new(self.config.heartbeat_interval_ms);
        tokio::spawn({
            let shutdown = self.shutdown.clone();
            async move { sender.run(tx, shutdown).await }
        });

        while rx.recv().await.is_some() {
            let (waiting, active) = self.queue_sizes().await;
            let snapshot = self.metrics.snapshot(active, waiting);

            if let Err(e) = self.cluster.update_metrics(&self.id, snapshot) {
                tracing::debug!(node_id = %self.id, error = %e, "Metrics not published");
            }

            // Expired requests are only rolled back by a collision pass.
            self.collision.notify_one();
        }
    }
}
