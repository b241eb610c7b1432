//! Narrow views of the surrounding grid that the placement core consumes.
//!
//! - [`Topology`]: membership queries (local node, remote nodes, lookup by id)
//! - [`Messaging`]: fire-and-forget delivery to a peer on a named topic
//! - [`TaskTopology`]: nodes a task session may run on
//! - [`DiscoveryEvent`]: join/leave/fail/metrics notifications
//!
//! Real discovery and transports live outside this crate. The in-process
//! [`crate::cluster::Cluster`] implements these traits for wiring and tests.

pub mod event;
pub mod metrics;
pub mod node;
pub mod task;

pub use event::{DiscoveryEvent, NodeEventKind};
pub use metrics::{NodeBenchmark, NodeMetricsSnapshot};
pub use node::{AttributeFilter, AttributeValue, GridNode, NodeId};
pub use task::{SessionTopologies, TaskTopology, UnrestrictedTopology};

use crate::error::Result;

pub trait Topology: Send + Sync {
    fn local_node(&self) -> GridNode;

    /// All nodes including the local one.
    fn all_nodes(&self) -> Vec<GridNode>;

    fn remote_nodes(&self) -> Vec<GridNode>;

    fn node(&self, id: &NodeId) -> Option<GridNode>;

    fn local_id(&self) -> NodeId {
        self.local_node().id
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }
}

pub trait Messaging: Send + Sync {
    /// Sends without waiting for delivery. An error means the message was
    /// not handed to the transport at all.
    fn send(&self, to: &NodeId, topic: &str, payload: Vec<u8>) -> Result<()>;
}
