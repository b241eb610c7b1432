//! Payloads exchanged between nodes. Encoded as JSON; the transport only
//! sees topic names and bytes.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::{JobHandle, JobSpec, SessionId};
use crate::topology::NodeId;

/// Idle node asking a busy peer to hand over jobs.
pub const TOPIC_STEAL_REQUEST: &str = "grid.collision.steal";
/// Job sent to the node that should queue it.
pub const TOPIC_JOB_SUBMIT: &str = "grid.job.submit";
/// Stolen job reported back to its task origin for fail-over.
pub const TOPIC_JOB_REJECTED: &str = "grid.job.rejected";
/// Execution result reported back to the task origin.
pub const TOPIC_JOB_RESULT: &str = "grid.job.result";

/// The sender wants `delta` jobs in total. Replaces, not adds to, any
/// earlier request from the same sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealRequest {
    pub delta: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTransfer {
    pub session: SessionId,
    pub origin: NodeId,
    pub spec: JobSpec,
    pub stealing_attempts: u32,
    pub failover_attempts: u32,
}

impl JobTransfer {
    pub fn new(session: SessionId, origin: NodeId, spec: JobSpec) -> Self {
        Self {
            session,
            origin,
            spec,
            stealing_attempts: 0,
            failover_attempts: 0,
        }
    }

    pub fn from_handle(job: &JobHandle) -> Self {
        Self {
            session: job.session,
            origin: job.origin,
            spec: job.spec.clone(),
            stealing_attempts: job.stealing_attempts(),
            failover_attempts: job.failover_attempts(),
        }
    }

    pub fn into_handle(self) -> JobHandle {
        JobHandle::new(self.session, self.origin, self.spec)
            .with_attempts(self.stealing_attempts, self.failover_attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRejected {
    pub job: JobTransfer,
    pub rejected_by: NodeId,
    pub thief: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub session: SessionId,
    pub job_id: Uuid,
    pub executed_by: NodeId,
    pub stealing_attempts: u32,
    pub completed_at: DateTime<Utc>,
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}
