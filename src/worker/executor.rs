use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::scheduler::{JobHandle, SessionId};
use crate::topology::NodeId;

/// Result of job execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub session: SessionId,
    pub origin: NodeId,
    pub stealing_attempts: u32,
    /// Time from submission on this node until execution started.
    pub wait_time: Duration,
    pub execute_time: Duration,
}

/// Runs activated jobs. A job's work is simulated by sleeping for its
/// `work_ms`, which is all the placement layer needs to observe load.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    /// Multiplier applied to every job's work, to model slower nodes.
    slowdown: f64,
}

impl Default for JobExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl JobExecutor {
    pub fn new() -> Self {
        Self { slowdown: 1.0 }
    }

    pub fn with_slowdown(slowdown: f64) -> Self {
        Self {
            slowdown: slowdown.max(0.0),
        }
    }

    pub async fn execute(&self, job: &JobHandle) -> ExecutionResult {
        let wait_time = job.waited();
        let work = Duration::from_millis(job.spec.work_ms).mul_f64(self.slowdown);

        tracing::info!(
            job_id = %job.id(),
            session = %job.session,
            work_ms = work.as_millis() as u64,
            "Executing job"
        );

        let started = Instant::now();
        tokio::time::sleep(work).await;
        let execute_time = started.elapsed();

        tracing::info!(
            job_id = %job.id(),
            execute_ms = execute_time.as_millis() as u64,
            wait_ms = wait_time.as_millis() as u64,
            "Job completed"
        );

        ExecutionResult {
            job_id: job.id(),
            session: job.session,
            origin: job.origin,
            stealing_attempts: job.stealing_attempts(),
            wait_time,
            execute_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobSpec;

    #[tokio::test]
    async fn execute_reports_job_identity() {
        let job = JobHandle::new(Uuid::new_v4(), Uuid::new_v4(), JobSpec::new().with_work_ms(5));
        let result = JobExecutor::new().execute(&job).await;

        assert_eq!(result.job_id, job.id());
        assert_eq!(result.origin, job.origin);
        assert!(result.execute_time >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn zero_slowdown_skips_work() {
        let job = JobHandle::new(Uuid::new_v4(), Uuid::new_v4(), JobSpec::new().with_work_ms(10_000));
        let result = JobExecutor::with_slowdown(0.0).execute(&job).await;
        assert!(result.execute_time < Duration::from_secs(1));
    }
}
