//! Consistent-hash ring with virtual replicas.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use md5::{Digest, Md5};
use parking_lot::RwLock;

use crate::topology::NodeId;

/// Hashes bytes to a ring position. `None` means the digest is not
/// available and the ring should use its fallback.
pub trait AffinityHasher: Send + Sync {
    fn digest(&self, bytes: &[u8]) -> Option<u32>;
}

/// MD5 folded to 32 bits by XOR-ing its four big-endian words.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Hasher;

impl AffinityHasher for Md5Hasher {
    fn digest(&self, bytes: &[u8]) -> Option<u32> {
        let digest = Md5::digest(bytes);
        Some(
            digest
                .chunks_exact(4)
                .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
                .fold(0, |acc, w| acc ^ w),
        )
    }
}

struct RingHasher {
    inner: Arc<dyn AffinityHasher>,
    warned: AtomicBool,
}

impl RingHasher {
    fn hash(&self, bytes: &[u8]) -> u32 {
        if let Some(h) = self.inner.digest(bytes) {
            return h;
        }

        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("Affinity digest unavailable, falling back to std hasher");
        }

        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }
}

#[derive(Debug, Default)]
struct RingState {
    positions: BTreeMap<u32, NodeId>,
    /// Positions each node actually won, for exact removal.
    owned: HashMap<NodeId, Vec<u32>>,
}

pub struct AffinityRing {
    seed: String,
    hasher: RingHasher,
    state: RwLock<RingState>,
}

impl AffinityRing {
    pub fn new(seed: impl Into<String>, hasher: Arc<dyn AffinityHasher>) -> Self {
        Self {
            seed: seed.into(),
            hasher: RingHasher {
                inner: hasher,
                warned: AtomicBool::new(false),
            },
            state: RwLock::new(RingState::default()),
        }
    }

    pub fn with_md5(seed: impl Into<String>) -> Self {
        Self::new(seed, Arc::new(Md5Hasher))
    }

    pub fn key_hash(&self, key: &[u8]) -> u32 {
        self.hasher.hash(key)
    }

    fn position(&self, node: &NodeId, replica: u32) -> u32 {
        let bytes = format!("{}{}{}", self.seed, node, replica);
        self.hasher.hash(bytes.as_bytes())
    }

    /// Places `replicas` positions for `node`. Positions already taken by
    /// another node stay with it. Returns the number of positions won; a
    /// node already on the ring is left untouched.
    pub fn add_node(&self, node: NodeId, replicas: u32) -> usize {
        // Hash outside the lock.
        let candidates: Vec<u32> = (0..replicas).map(|i| self.position(&node, i)).collect();

        let mut state = self.state.write();
        if state.owned.contains_key(&node) {
            return 0;
        }

        let mut won = Vec::with_capacity(candidates.len());
        for pos in candidates {
            if let std::collections::btree_map::Entry::Vacant(slot) = state.positions.entry(pos) {
                slot.insert(node);
                won.push(pos);
            }
        }

        let count = won.len();
        state.owned.insert(node, won);
        count
    }

    /// Removes exactly the positions `node` owns.
    pub fn remove_node(&self, node: &NodeId) -> usize {
        let mut state = self.state.write();
        let Some(owned) = state.owned.remove(node) else {
            return 0;
        };

        for pos in &owned {
            state.positions.remove(pos);
        }
        owned.len()
    }

    /// First node at or after the key's hash, wrapping once around the
    /// ring, for which `accept` holds.
    pub fn get(&self, key: &[u8], accept: impl Fn(&NodeId) -> bool) -> Option<NodeId> {
        let h = self.key_hash(key);
        let state = self.state.read();

        state
            .positions
            .range(h..)
            .chain(state.positions.range(..h))
            .map(|(_, node)| node)
            .find(|node| accept(node))
            .copied()
    }

    /// Unrestricted lookup.
    pub fn lookup(&self, key: &[u8]) -> Option<NodeId> {
        self.get(key, |_| true)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.state.read().owned.contains_key(node)
    }

    pub fn positions_of(&self, node: &NodeId) -> usize {
        self.state.read().owned.get(node).map_or(0, Vec::len)
    }

    pub fn node_count(&self) -> usize {
        self.state.read().owned.len()
    }

    /// Total positions on the ring.
    pub fn len(&self) -> usize {
        self.state.read().positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct Unavailable;

    impl AffinityHasher for Unavailable {
        fn digest(&self, _bytes: &[u8]) -> Option<u32> {
            None
        }
    }

    struct Constant;

    impl AffinityHasher for Constant {
        fn digest(&self, _bytes: &[u8]) -> Option<u32> {
            Some(7)
        }
    }

    #[test]
    fn md5_fold_is_stable() {
        let a = Md5Hasher.digest(b"key");
        assert_eq!(a, Md5Hasher.digest(b"key"));
        assert_ne!(a, Md5Hasher.digest(b"other"));
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = AffinityRing::with_md5("");
        assert!(ring.lookup(b"k").is_none());
    }

    #[test]
    fn fallback_hasher_still_places_nodes() {
        let ring = AffinityRing::new("", Arc::new(Unavailable));
        let node = Uuid::new_v4();
        assert_eq!(ring.add_node(node, 10), 10);
        assert_eq!(ring.lookup(b"k"), Some(node));
    }

    #[test]
    fn collisions_keep_first_owner() {
        let ring = AffinityRing::new("", Arc::new(Constant));
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(ring.add_node(first, 5), 1);
        assert_eq!(ring.add_node(second, 5), 0);
        assert_eq!(ring.lookup(b"k"), Some(first));

        // Removing the loser must not touch the winner's position.
        assert_eq!(ring.remove_node(&second), 0);
        assert_eq!(ring.lookup(b"k"), Some(first));
    }

    #[test]
    fn re_adding_a_node_is_noop() {
        let ring = AffinityRing::with_md5("seed");
        let node = Uuid::new_v4();
        assert_eq!(ring.add_node(node, 100), 100);
        assert_eq!(ring.add_node(node, 100), 0);
        assert_eq!(ring.len(), 100);
    }

    #[test]
    fn walk_skips_rejected_nodes() {
        let ring = AffinityRing::with_md5("");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        ring.add_node(a, 50);
        ring.add_node(b, 50);

        for i in 0..20 {
            let key = format!("key-{i}");
            assert_eq!(ring.get(key.as_bytes(), |n| *n == b), Some(b));
        }
        assert!(ring.get(b"k", |_| false).is_none());
    }
}
