use std::collections::HashMap;

use crate::scheduler::SessionId;

#[derive(Debug)]
struct CacheEntry<T> {
    mapped: bool,
    value: Option<T>,
}

/// Result of looking a session up.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    /// First balance call for this session.
    Miss,
    /// Mapping is still in progress; reuse this.
    Cached(T),
    /// The task already finished mapping. Anything balanced now is a
    /// fail-over and must see the current topology, so nothing is cached.
    Mapped,
}

/// Per-task-session cache shared by the balancers.
///
/// An entry is created by the first balance call of a session, flips to
/// `mapped` once when the task reports its jobs mapped (dropping the cached
/// value), and is removed when the task finishes or fails. Not synchronized;
/// owners keep it behind their own lock.
#[derive(Debug)]
pub struct TaskSessionCache<T> {
    entries: HashMap<SessionId, CacheEntry<T>>,
}

impl<T> Default for TaskSessionCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Clone> TaskSessionCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, session: SessionId) -> CacheLookup<T> {
        match self.entries.get(&session) {
            None => CacheLookup::Miss,
            Some(entry) if entry.mapped => CacheLookup::Mapped,
            Some(entry) => match &entry.value {
                Some(value) => CacheLookup::Cached(value.clone()),
                None => CacheLookup::Miss,
            },
        }
    }

    /// Caches `value` for an unmapped session and returns what the session
    /// should use. If another caller cached first, theirs wins so one
    /// session never balances over two different snapshots. Mapped
    /// sessions get `value` back uncached.
    pub fn insert(&mut self, session: SessionId, value: T) -> T {
        let entry = self.entries.entry(session).or_insert(CacheEntry {
            mapped: false,
            value: None,
        });

        if entry.mapped {
            return value;
        }

        entry.value.get_or_insert(value).clone()
    }

    /// Returns true if this call flipped the session to mapped.
    pub fn mark_mapped(&mut self, session: SessionId) -> bool {
        match self.entries.get_mut(&session) {
            Some(entry) if !entry.mapped => {
                entry.mapped = true;
                entry.value = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_mapped(&self, session: SessionId) -> bool {
        self.entries.get(&session).is_some_and(|e| e.mapped)
    }

    pub fn remove(&mut self, session: SessionId) -> bool {
        self.entries.remove(&session).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
