use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use uuid::Uuid;

use crate::scheduler::job::{JobHandle, JobState};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Jobs whose state changed since the last [`JobQueue::settle`].
#[derive(Debug, Default)]
pub struct Settled {
    pub activated: Vec<Arc<JobHandle>>,
    pub cancelled: Vec<Arc<JobHandle>>,
}

/// Local waiting and active jobs of one node.
///
/// Waiting jobs keep submission order; that order is what the collision
/// resolver sees. Handles change state outside the queue (the resolver
/// activates or cancels them), so [`JobQueue::settle`] moves them to where
/// they now belong.
#[derive(Debug)]
pub struct JobQueue {
    waiting: VecDeque<Arc<JobHandle>>,
    active: HashMap<Uuid, Arc<JobHandle>>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            waiting: VecDeque::new(),
            active: HashMap::new(),
            max_jobs,
        }
    }

    /// Add a waiting job. Returns false if the queue is at capacity or the
    /// job is already held.
    pub fn add_job(&mut self, job: Arc<JobHandle>) -> bool {
        if self.is_full() || self.get_job(&job.id()).is_some() {
            return false;
        }
        self.waiting.push_back(job);
        true
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Arc<JobHandle>> {
        self.active
            .get(id)
            .or_else(|| self.waiting.iter().find(|j| j.id() == *id))
    }

    /// Waiting jobs in submission order.
    pub fn waiting_jobs(&self) -> Vec<Arc<JobHandle>> {
        self.waiting.iter().cloned().collect()
    }

    pub fn active_jobs(&self) -> Vec<Arc<JobHandle>> {
        self.active.values().cloned().collect()
    }

    /// Move activated jobs to the active set and drop cancelled ones.
    pub fn settle(&mut self) -> Settled {
        let mut settled = Settled::default();
        let mut still_waiting = VecDeque::with_capacity(self.waiting.len());

        for job in self.waiting.drain(..) {
            match job.state() {
                JobState::Waiting => still_waiting.push_back(job),
                JobState::Active => {
                    self.active.insert(job.id(), job.clone());
                    settled.activated.push(job);
                }
                JobState::Cancelled => settled.cancelled.push(job),
            }
        }

        self.waiting = still_waiting;
        settled
    }

    /// Remove a finished job.
    pub fn complete(&mut self, id: &Uuid) -> Option<Arc<JobHandle>> {
        self.active.remove(id)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_jobs
    }
}
