use serde::{Deserialize, Serialize};

use crate::topology::node::GridNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEventKind {
    Joined,
    Left,
    Failed,
    MetricsUpdated,
}

impl NodeEventKind {
    /// True for events after which the node is no longer in topology.
    pub fn is_departure(&self) -> bool {
        matches!(self, NodeEventKind::Left | NodeEventKind::Failed)
    }
}

impl std::fmt::Display for NodeEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeEventKind::Joined => write!(f, "joined"),
            NodeEventKind::Left => write!(f, "left"),
            NodeEventKind::Failed => write!(f, "failed"),
            NodeEventKind::MetricsUpdated => write!(f, "metrics_updated"),
        }
    }
}

/// Membership or metrics change reported by discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub kind: NodeEventKind,
    pub node: GridNode,
}

impl DiscoveryEvent {
    pub fn new(kind: NodeEventKind, node: GridNode) -> Self {
        Self { kind, node }
    }

    pub fn joined(node: GridNode) -> Self {
        Self::new(NodeEventKind::Joined, node)
    }

    pub fn left(node: GridNode) -> Self {
        Self::new(NodeEventKind::Left, node)
    }

    pub fn failed(node: GridNode) -> Self {
        Self::new(NodeEventKind::Failed, node)
    }

    pub fn metrics_updated(node: GridNode) -> Self {
        Self::new(NodeEventKind::MetricsUpdated, node)
    }
}
