//! Re-placement of jobs a node handed away during collision resolution.

use std::sync::Arc;

use crate::balancer::LoadBalancer;
use crate::config::FailoverConfig;
use crate::error::{PlacementError, Result};
use crate::scheduler::{JobSpec, SessionId};
use crate::topology::{GridNode, NodeId};

/// Everything known about one rejected job.
#[derive(Debug, Clone)]
pub struct FailoverContext<'a> {
    pub session: SessionId,
    pub job: &'a JobSpec,
    pub rejected_by: NodeId,
    pub thief: Option<NodeId>,
    /// Fail-overs this job already went through.
    pub failover_attempts: u32,
    /// Live nodes the session may run on.
    pub topology: &'a [GridNode],
}

pub struct JobStealingFailover {
    config: FailoverConfig,
    balancer: Arc<dyn LoadBalancer>,
}

impl JobStealingFailover {
    pub fn new(config: FailoverConfig, balancer: Arc<dyn LoadBalancer>) -> Self {
        Self { config, balancer }
    }

    pub fn max_failover_attempts(&self) -> u32 {
        self.config.max_failover_attempts
    }

    /// Picks the node a rejected job goes to next.
    ///
    /// The thief wins if it is still in the session topology and is not
    /// the node that gave the job away. Otherwise the balancer chooses
    /// among the remaining nodes.
    pub fn failover(&self, ctx: &FailoverContext<'_>) -> Result<GridNode> {
        if ctx.failover_attempts >= self.config.max_failover_attempts {
            tracing::warn!(
                job_id = %ctx.job.id,
                attempts = ctx.failover_attempts,
                "Job exceeded fail-over attempts"
            );
            return Err(PlacementError::FailoverExhausted(ctx.job.id));
        }

        if let Some(thief) = ctx.thief.filter(|t| *t != ctx.rejected_by) {
            if let Some(node) = ctx.topology.iter().find(|n| n.id == thief) {
                tracing::debug!(job_id = %ctx.job.id, thief = %thief, "Failing over to thief");
                return Ok(node.clone());
            }
            tracing::debug!(job_id = %ctx.job.id, thief = %thief, "Thief left, balancing instead");
        }

        let candidates: Vec<GridNode> = ctx
            .topology
            .iter()
            .filter(|n| n.id != ctx.rejected_by)
            .cloned()
            .collect();

        self.balancer.pick_node(ctx.session, &candidates, ctx.job)
    }
}
