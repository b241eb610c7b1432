use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::scheduler::job::SessionId;
use crate::topology::node::{GridNode, NodeId};

/// Resolves the subset of nodes a task session is allowed to run on.
pub trait TaskTopology: Send + Sync {
    fn task_topology(&self, session: SessionId, candidates: &[GridNode]) -> Vec<GridNode>;
}

/// Every node is allowed for every session.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnrestrictedTopology;

impl TaskTopology for UnrestrictedTopology {
    fn task_topology(&self, _session: SessionId, candidates: &[GridNode]) -> Vec<GridNode> {
        candidates.to_vec()
    }
}

/// Per-session allowed node sets. Sessions without a registered set are
/// unrestricted.
#[derive(Debug, Default)]
pub struct SessionTopologies {
    sessions: RwLock<HashMap<SessionId, HashSet<NodeId>>>,
}

impl SessionTopologies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: SessionId, nodes: impl IntoIterator<Item = NodeId>) {
        self.sessions
            .write()
            .insert(session, nodes.into_iter().collect());
    }

    pub fn allowed(&self, session: SessionId) -> Option<Vec<NodeId>> {
        self.sessions
            .read()
            .get(&session)
            .map(|set| set.iter().copied().collect())
    }

    pub fn remove(&self, session: SessionId) {
        self.sessions.write().remove(&session);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl TaskTopology for SessionTopologies {
    fn task_topology(&self, session: SessionId, candidates: &[GridNode]) -> Vec<GridNode> {
        match self.sessions.read().get(&session) {
            Some(allowed) => candidates
                .iter()
                .filter(|n| allowed.contains(&n.id))
                .cloned()
                .collect(),
            None => candidates.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn unregistered_session_is_unrestricted() {
        let tops = SessionTopologies::new();
        let nodes = vec![GridNode::random(), GridNode::random()];
        assert_eq!(tops.task_topology(Uuid::new_v4(), &nodes).len(), 2);
    }

    #[test]
    fn registered_session_filters_candidates() {
        let tops = SessionTopologies::new();
        let a = GridNode::random();
        let b = GridNode::random();
        let session = Uuid::new_v4();
        tops.register(session, [a.id]);

        let allowed = tops.task_topology(session, &[a.clone(), b]);
        assert_eq!(allowed, vec![a]);

        tops.remove(session);
        assert!(tops.is_empty());
    }
}
