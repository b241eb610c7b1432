use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::topology::NodeId;

pub type SessionId = Uuid;

/// What the caller submits: identity plus routing hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Uuid,
    /// Routes the job through the affinity ring when present.
    pub affinity_key: Option<String>,
    /// Jobs flagged here are never handed to a thief.
    pub stealing_disabled: bool,
    /// Simulated execution time.
    pub work_ms: u64,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSpec {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            affinity_key: None,
            stealing_disabled: false,
            work_ms: 0,
        }
    }

    pub fn with_affinity_key(mut self, key: impl Into<String>) -> Self {
        self.affinity_key = Some(key.into());
        self
    }

    pub fn with_stealing_disabled(mut self) -> Self {
        self.stealing_disabled = true;
        self
    }

    pub fn with_work_ms(mut self, work_ms: u64) -> Self {
        self.work_ms = work_ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobState {
    Waiting = 0,
    Active = 1,
    Cancelled = 2,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => JobState::Waiting,
            1 => JobState::Active,
            _ => JobState::Cancelled,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A job held by a node, shared between the queue, the collision resolver
/// and the executor.
///
/// State moves `Waiting -> Active` or `Waiting -> Cancelled` exactly once.
/// Both transitions are compare-and-swap, so concurrent callers racing on
/// the same handle see exactly one winner and the loser gets `false`.
#[derive(Debug)]
pub struct JobHandle {
    pub spec: JobSpec,
    pub session: SessionId,
    /// Node that mapped the task; results and rejections go back there.
    pub origin: NodeId,
    pub created_at: DateTime<Utc>,
    submitted_at: Instant,
    state: AtomicU8,
    stealing_attempts: AtomicU32,
    failover_attempts: u32,
    thief: Mutex<Option<NodeId>>,
}

impl JobHandle {
    pub fn new(session: SessionId, origin: NodeId, spec: JobSpec) -> Self {
        Self {
            spec,
            session,
            origin,
            created_at: Utc::now(),
            submitted_at: Instant::now(),
            state: AtomicU8::new(JobState::Waiting as u8),
            stealing_attempts: AtomicU32::new(0),
            failover_attempts: 0,
            thief: Mutex::new(None),
        }
    }

    /// Carries counters over from a previous placement of the same job.
    pub fn with_attempts(mut self, stealing_attempts: u32, failover_attempts: u32) -> Self {
        self.stealing_attempts = AtomicU32::new(stealing_attempts);
        self.failover_attempts = failover_attempts;
        self
    }

    pub fn id(&self) -> Uuid {
        self.spec.id
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stealing_disabled(&self) -> bool {
        self.spec.stealing_disabled
    }

    /// Waiting -> Active. Returns false if the job already left `Waiting`.
    pub fn activate(&self) -> bool {
        self.transition(JobState::Active)
    }

    /// Waiting -> Cancelled. Returns false if the job already left `Waiting`.
    pub fn cancel(&self) -> bool {
        self.transition(JobState::Cancelled)
    }

    fn transition(&self, to: JobState) -> bool {
        self.state
            .compare_exchange(
                JobState::Waiting as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn stealing_attempts(&self) -> u32 {
        self.stealing_attempts.load(Ordering::Acquire)
    }

    pub fn failover_attempts(&self) -> u32 {
        self.failover_attempts
    }

    pub fn thief(&self) -> Option<NodeId> {
        *self.thief.lock()
    }

    /// Stamps the node that stole this job. Only called after a successful
    /// `cancel()`.
    pub fn mark_stolen(&self, thief: NodeId) {
        *self.thief.lock() = Some(thief);
        self.stealing_attempts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn waited(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}
