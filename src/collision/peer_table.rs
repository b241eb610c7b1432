use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::topology::NodeId;

/// Outstanding steal request for one peer.
#[derive(Debug)]
pub struct PeerRequestState {
    jobs_to_steal: u32,
    timestamp: Instant,
    detached: bool,
}

impl PeerRequestState {
    fn new() -> Self {
        Self {
            jobs_to_steal: 0,
            timestamp: Instant::now(),
            detached: false,
        }
    }

    pub fn jobs_to_steal(&self) -> u32 {
        self.jobs_to_steal
    }

    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    pub fn is_expired(&self, expire_time: Duration) -> bool {
        self.jobs_to_steal > 0 && self.age() >= expire_time
    }

    /// Replace the request and restart its clock.
    pub fn reset(&mut self, jobs_to_steal: u32) {
        self.jobs_to_steal = jobs_to_steal;
        self.timestamp = Instant::now();
    }

    /// One job handed over; the request keeps its original timestamp.
    pub fn decrement(&mut self) {
        debug_assert!(self.jobs_to_steal > 0, "steal request decremented below zero");
        self.jobs_to_steal = self.jobs_to_steal.saturating_sub(1);
    }

    /// True once the entry was removed from its table. Writers that raced
    /// with the removal must look the peer up again.
    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

/// Per-peer request bookkeeping.
///
/// The map is write-locked only to add or remove peers; each entry has its
/// own mutex so traffic for one peer never waits on another. Never take the
/// map lock while holding an entry lock.
#[derive(Debug, Default)]
pub struct PeerRequestTable {
    peers: RwLock<HashMap<NodeId, Arc<Mutex<PeerRequestState>>>>,
}

impl PeerRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &NodeId) -> Option<Arc<Mutex<PeerRequestState>>> {
        self.peers.read().get(peer).cloned()
    }

    fn entry(&self, peer: NodeId) -> Arc<Mutex<PeerRequestState>> {
        if let Some(state) = self.get(&peer) {
            return state;
        }
        self.peers
            .write()
            .entry(peer)
            .or_insert_with(|| Arc::new(Mutex::new(PeerRequestState::new())))
            .clone()
    }

    /// Run `f` on the peer's state under its lock, creating the entry if
    /// needed.
    pub fn update<R>(&self, peer: NodeId, f: impl FnOnce(&mut PeerRequestState) -> R) -> R {
        loop {
            let entry = self.entry(peer);
            let mut state = entry.lock();
            if !state.detached {
                return f(&mut state);
            }
        }
    }

    /// Entries at this instant. Callers lock each entry themselves.
    pub fn snapshot(&self) -> Vec<(NodeId, Arc<Mutex<PeerRequestState>>)> {
        self.peers
            .read()
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect()
    }

    /// Drop a peer. Returns the amount it still held so the caller can roll
    /// it back from any aggregate counter.
    pub fn remove(&self, peer: &NodeId) -> Option<u32> {
        let entry = self.peers.write().remove(peer)?;
        let mut state = entry.lock();
        state.detached = true;
        let held = state.jobs_to_steal;
        state.jobs_to_steal = 0;
        Some(held)
    }

    pub fn jobs_to_steal(&self, peer: &NodeId) -> Option<u32> {
        self.get(peer).map(|state| state.lock().jobs_to_steal)
    }

    /// Sum over every entry, expired or not.
    pub fn total(&self) -> u64 {
        self.snapshot()
            .iter()
            .map(|(_, state)| u64::from(state.lock().jobs_to_steal))
            .sum()
    }

    /// Sum over entries that have not expired.
    pub fn live_total(&self, expire_time: Duration) -> u64 {
        self.snapshot()
            .iter()
            .map(|(_, state)| {
                let state = state.lock();
                if state.is_expired(expire_time) {
                    0
                } else {
                    u64::from(state.jobs_to_steal)
                }
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

/// Process-wide count of jobs peers have asked this node for.
///
/// Always equals the sum of the received-request table; expired entries
/// are rolled back at the next collision pass.
#[derive(Debug, Default)]
pub struct StealCounter {
    value: AtomicI64,
}

impl StealCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Adds `delta` and returns the new value.
    pub fn add(&self, delta: i64) -> i64 {
        let updated = self.value.fetch_add(delta, Ordering::AcqRel) + delta;
        debug_assert!(updated >= 0, "steal request counter went negative: {}", updated);
        updated
    }
}
