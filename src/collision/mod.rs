//! Collision resolution: deciding, on one node, which waiting jobs start,
//! which are handed to peers, and how much work to ask idle-time peers for.
//!
//! # Components
//!
//! - [`CollisionResolver`]: the pluggable decision interface
//! - [`JobStealingResolver`]: work-stealing implementation
//! - [`PeerRequestTable`] / [`StealCounter`]: per-peer steal request bookkeeping
//!
//! # Flow
//!
//! 1. The node calls [`CollisionResolver::on_collision`] whenever its
//!    waiting or active set changes.
//! 2. Jobs are activated up to the active threshold.
//! 3. Surplus waiting jobs are cancelled and stamped with a thief if some
//!    peer has asked for work.
//! 4. If nothing was handed over, busy peers are asked for jobs.
//! 5. Incoming requests update the tables and fire the external listener,
//!    which makes the node run step 1 again.

pub mod peer_table;
pub mod stealing;

use std::sync::Arc;

use serde::Serialize;

use crate::scheduler::JobHandle;

pub use peer_table::{PeerRequestState, PeerRequestTable, StealCounter};
pub use stealing::{JobStealingResolver, StealingMetrics};

/// Callback asking the owner to run collision resolution again.
pub type ExternalCollisionListener = Arc<dyn Fn() + Send + Sync>;

/// What a single pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollisionOutcome {
    pub activated: usize,
    pub rejected: usize,
    /// Jobs asked from peers.
    pub requested: u64,
}

pub trait CollisionResolver: Send + Sync {
    /// Decide over the node's current jobs. May run concurrently with
    /// itself; job transitions are cooperative so overlapping passes never
    /// act twice on one job.
    fn on_collision(&self, waiting: &[Arc<JobHandle>], active: &[Arc<JobHandle>])
        -> CollisionOutcome;

    fn set_external_listener(&self, listener: Option<ExternalCollisionListener>);
}
