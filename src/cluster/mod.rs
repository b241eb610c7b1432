//! In-process cluster: membership registry, discovery event broadcast and
//! a message bus between nodes living in one process.
//!
//! Each joined node gets a [`ClusterHandle`], which implements
//! [`Topology`] and [`Messaging`] from that node's point of view, and an
//! inbox receiver of [`Envelope`]s.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use crate::error::{PlacementError, Result};
use crate::topology::{
    DiscoveryEvent, GridNode, Messaging, NodeEventKind, NodeId, NodeMetricsSnapshot, Topology,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Envelopes a node inbox holds before senders see it as full.
pub const DEFAULT_INBOX_CAPACITY: usize = 4096;

/// One message on the bus.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeId,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct Members {
    /// Join order.
    nodes: Vec<GridNode>,
    inboxes: HashMap<NodeId, mpsc::Sender<Envelope>>,
}

struct ClusterInner {
    members: RwLock<Members>,
    inbox_capacity: usize,
    events: broadcast::Sender<DiscoveryEvent>,
}

#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_inbox_capacity(DEFAULT_INBOX_CAPACITY)
    }

    /// A full inbox rejects further sends until its node drains it.
    pub fn with_inbox_capacity(inbox_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClusterInner {
                members: RwLock::new(Members::default()),
                inbox_capacity: inbox_capacity.max(1),
                events,
            }),
        }
    }

    /// Discovery events from now on. Lagging receivers lose old events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    /// Adds `node` and returns its handle plus inbox. Joining twice replaces
    /// the previous inbox.
    pub fn join(&self, node: GridNode) -> (ClusterHandle, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(self.inner.inbox_capacity);
        let id = node.id;

        {
            let mut members = self.inner.members.write();
            members.nodes.retain(|n| n.id != id);
            members.nodes.push(node.clone());
            members.inboxes.insert(id, tx);
        }

        tracing::info!(node_id = %id, "Node joined cluster");
        self.publish(DiscoveryEvent::joined(node));

        (self.handle(id), rx)
    }

    /// Graceful departure.
    pub fn leave(&self, id: &NodeId) -> Option<GridNode> {
        self.remove(id, NodeEventKind::Left)
    }

    /// Abrupt departure.
    pub fn fail(&self, id: &NodeId) -> Option<GridNode> {
        self.remove(id, NodeEventKind::Failed)
    }

    fn remove(&self, id: &NodeId, kind: NodeEventKind) -> Option<GridNode> {
        let removed = {
            let mut members = self.inner.members.write();
            members.inboxes.remove(id);
            let pos = members.nodes.iter().position(|n| n.id == *id)?;
            members.nodes.remove(pos)
        };

        tracing::info!(node_id = %id, event = %kind, "Node removed from cluster");
        self.publish(DiscoveryEvent::new(kind, removed.clone()));
        Some(removed)
    }

    pub fn update_metrics(&self, id: &NodeId, metrics: NodeMetricsSnapshot) -> Result<()> {
        let updated = {
            let mut members = self.inner.members.write();
            let node = members
                .nodes
                .iter_mut()
                .find(|n| n.id == *id)
                .ok_or(PlacementError::NodeNotFound(*id))?;
            node.metrics = metrics;
            node.clone()
        };

        self.publish(DiscoveryEvent::metrics_updated(updated));
        Ok(())
    }

    fn publish(&self, event: DiscoveryEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn handle(&self, local: NodeId) -> ClusterHandle {
        ClusterHandle {
            cluster: self.clone(),
            local,
        }
    }

    pub fn nodes(&self) -> Vec<GridNode> {
        self.inner.members.read().nodes.clone()
    }

    pub fn node(&self, id: &NodeId) -> Option<GridNode> {
        self.inner
            .members
            .read()
            .nodes
            .iter()
            .find(|n| n.id == *id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.members.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.members.read().nodes.is_empty()
    }

    pub fn send(&self, from: NodeId, to: &NodeId, topic: &str, payload: Vec<u8>) -> Result<()> {
        let members = self.inner.members.read();
        let inbox = members
            .inboxes
            .get(to)
            .ok_or(PlacementError::NodeNotFound(*to))?;

        inbox
            .try_send(Envelope {
                from,
                topic: topic.to_string(),
                payload,
            })
            .map_err(|e| PlacementError::Delivery {
                node_id: *to,
                reason: match e {
                    mpsc::error::TrySendError::Full(_) => "inbox full".to_string(),
                    mpsc::error::TrySendError::Closed(_) => "inbox closed".to_string(),
                },
            })
    }
}

/// A node's view of the cluster.
#[derive(Clone)]
pub struct ClusterHandle {
    cluster: Cluster,
    local: NodeId,
}

impl ClusterHandle {
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }
}

impl Topology for ClusterHandle {
    fn local_node(&self) -> GridNode {
        self.cluster
            .node(&self.local)
            .unwrap_or_else(|| GridNode::new(self.local))
    }

    fn all_nodes(&self) -> Vec<GridNode> {
        self.cluster.nodes()
    }

    fn remote_nodes(&self) -> Vec<GridNode> {
        self.cluster
            .nodes()
            .into_iter()
            .filter(|n| n.id != self.local)
            .collect()
    }

    fn node(&self, id: &NodeId) -> Option<GridNode> {
        self.cluster.node(id)
    }

    fn local_id(&self) -> NodeId {
        self.local
    }
}

impl Messaging for ClusterHandle {
    fn send(&self, to: &NodeId, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.cluster.send(self.local, to, topic, payload)
    }
}
