use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::topology::NodeMetricsSnapshot;

/// Heartbeat sender that periodically sends heartbeat signals
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Ticks `tx` every interval until shutdown or the receiver is dropped.
    pub async fn run(&self, tx: mpsc::Sender<()>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if tx.send(()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct RunningAverage {
    sum: f64,
    count: u64,
}

impl RunningAverage {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn get(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Default)]
struct Tracked {
    active: RunningAverage,
    waiting: RunningAverage,
    cpu: RunningAverage,
    max_active: u32,
    max_waiting: u32,
    rejected: u32,
    cancelled: u32,
    last_execute_ms: u64,
    last_wait_ms: u64,
    execute: RunningAverage,
    wait: RunningAverage,
}

/// Accumulates the local numbers behind [`NodeMetricsSnapshot`].
///
/// CPU load is estimated as active jobs over available processors, capped
/// at 1.0, since jobs here are simulated.
pub struct MetricsTracker {
    started: Instant,
    total_cpus: u32,
    tracked: Mutex<Tracked>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsTracker {
    pub fn new() -> Self {
        let total_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::with_cpus(total_cpus)
    }

    pub fn with_cpus(total_cpus: u32) -> Self {
        Self {
            started: Instant::now(),
            total_cpus: total_cpus.max(1),
            tracked: Mutex::new(Tracked::default()),
        }
    }

    pub fn record_execution(&self, wait: Duration, execute: Duration) {
        let mut t = self.tracked.lock();
        let wait_ms = wait.as_millis() as u64;
        let execute_ms = execute.as_millis() as u64;
        t.last_wait_ms = wait_ms;
        t.last_execute_ms = execute_ms;
        t.wait.add(wait_ms as f64);
        t.execute.add(execute_ms as f64);
    }

    /// Jobs this node handed to thieves.
    pub fn record_rejected(&self, count: usize) {
        let mut t = self.tracked.lock();
        t.rejected = t.rejected.saturating_add(count as u32);
    }

    pub fn record_cancelled(&self, count: usize) {
        let mut t = self.tracked.lock();
        t.cancelled = t.cancelled.saturating_add(count as u32);
    }

    /// Samples the current job counts and returns the resulting snapshot.
    pub fn snapshot(&self, active: usize, waiting: usize) -> NodeMetricsSnapshot {
        let active = active as u32;
        let waiting = waiting as u32;
        let cpu_load = (f64::from(active) / f64::from(self.total_cpus)).min(1.0);

        let mut t = self.tracked.lock();
        t.active.add(f64::from(active));
        t.waiting.add(f64::from(waiting));
        t.cpu.add(cpu_load);
        t.max_active = t.max_active.max(active);
        t.max_waiting = t.max_waiting.max(waiting);

        NodeMetricsSnapshot {
            current_active_jobs: active,
            average_active_jobs: t.active.get(),
            maximum_active_jobs: t.max_active,
            current_waiting_jobs: waiting,
            average_waiting_jobs: t.waiting.get(),
            maximum_waiting_jobs: t.max_waiting,
            current_rejected_jobs: t.rejected,
            current_cancelled_jobs: t.cancelled,
            current_cpu_load: cpu_load,
            average_cpu_load: t.cpu.get(),
            total_cpus: self.total_cpus,
            current_job_execute_time_ms: t.last_execute_ms,
            average_job_execute_time_ms: t.execute.get(),
            current_job_wait_time_ms: t.last_wait_ms,
            average_job_wait_time_ms: t.wait.get(),
            up_time_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
