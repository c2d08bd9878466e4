use std::collections::BTreeMap;

use bytes::Bytes;
use foundation::time::TimeKey;
use futures::future::{LocalBoxFuture, Shared};

use crate::loader::LoadError;

/// A fetch shared between every consumer of the same key.
pub type SharedFetch = Shared<LocalBoxFuture<'static, Result<Bytes, LoadError>>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryBudget {
    pub max_bytes: usize,
}

impl MemoryBudget {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryState {
    InFlight,
    Resident,
}

struct CacheEntry {
    fetch: SharedFetch,
    state: EntryState,
    bytes: usize,
    last_used_tick: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    BudgetExceeded { requested: usize, max: usize },
    NoEvictableEntries,
    UnknownKey,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::BudgetExceeded { requested, max } => {
                write!(
                    f,
                    "snapshot too large for budget: requested={requested} max={max}"
                )
            }
            CacheError::NoEvictableEntries => write!(f, "no evictable entries (all protected?)"),
            CacheError::UnknownKey => write!(f, "unknown cache key"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Encoded snapshot bytes by time key, bounded by a byte budget.
///
/// In-flight fetches are shared so overlapping ring windows never request
/// the same key twice. Entries count against the budget once resolved.
/// Eviction is LRU by `last_used_tick`, ties broken by key order; keys the
/// caller marks protected (the live ring) are never evicted.
pub struct ImageCache {
    budget: MemoryBudget,
    used_bytes: usize,
    tick: u64,
    entries: BTreeMap<TimeKey, CacheEntry>,
}

impl ImageCache {
    pub fn new(budget: MemoryBudget) -> Self {
        Self {
            budget,
            used_bytes: 0,
            tick: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: TimeKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn state(&self, key: TimeKey) -> Option<EntryState> {
        self.entries.get(&key).map(|e| e.state)
    }

    pub fn keys(&self) -> impl Iterator<Item = TimeKey> + '_ {
        self.entries.keys().copied()
    }

    /// The shared fetch for `key`, refreshing its LRU position.
    pub fn get(&mut self, key: TimeKey) -> Option<SharedFetch> {
        self.tick += 1;
        let entry = self.entries.get_mut(&key)?;
        entry.last_used_tick = self.tick;
        Some(entry.fetch.clone())
    }

    pub fn insert(&mut self, key: TimeKey, fetch: SharedFetch) {
        self.tick += 1;
        if let Some(old) = self.entries.insert(
            key,
            CacheEntry {
                fetch,
                state: EntryState::InFlight,
                bytes: 0,
                last_used_tick: self.tick,
            },
        ) {
            self.used_bytes = self.used_bytes.saturating_sub(old.bytes);
        }
    }

    /// Records the size of a resolved fetch and evicts down to budget.
    /// When only protected entries remain, `key` itself is dropped so the
    /// cache never stays over budget.
    pub fn mark_resident(
        &mut self,
        key: TimeKey,
        bytes: usize,
        protected: &[TimeKey],
    ) -> Result<Vec<TimeKey>, CacheError> {
        if bytes > self.budget.max_bytes {
            self.remove(key);
            return Err(CacheError::BudgetExceeded {
                requested: bytes,
                max: self.budget.max_bytes,
            });
        }
        self.tick += 1;
        let entry = self.entries.get_mut(&key).ok_or(CacheError::UnknownKey)?;
        if entry.state == EntryState::Resident {
            self.used_bytes = self.used_bytes.saturating_sub(entry.bytes);
        }
        entry.bytes = bytes;
        entry.state = EntryState::Resident;
        entry.last_used_tick = self.tick;
        self.used_bytes += bytes;

        let evicted = self.evict_as_needed(key, protected);
        if evicted.is_err() {
            self.remove(key);
        }
        evicted
    }

    pub fn remove(&mut self, key: TimeKey) -> bool {
        match self.entries.remove(&key) {
            Some(e) => {
                self.used_bytes = self.used_bytes.saturating_sub(e.bytes);
                true
            }
            None => false,
        }
    }

    fn evict_as_needed(
        &mut self,
        just_resident: TimeKey,
        protected: &[TimeKey],
    ) -> Result<Vec<TimeKey>, CacheError> {
        let mut evicted = Vec::new();
        while self.used_bytes > self.budget.max_bytes {
            let pick = |allow_new: bool| {
                self.entries
                    .iter()
                    .filter(|(k, e)| {
                        e.state == EntryState::Resident
                            && !protected.contains(k)
                            && (allow_new || **k != just_resident)
                    })
                    .min_by(|(ka, ea), (kb, eb)| {
                        ea.last_used_tick
                            .cmp(&eb.last_used_tick)
                            .then_with(|| ka.cmp(kb))
                    })
                    .map(|(k, _)| *k)
            };

            // Prefer older entries; the fresh one goes only if nothing else can.
            let Some(key) = pick(false).or_else(|| pick(true)) else {
                return Err(CacheError::NoEvictableEntries);
            };
            self.remove(key);
            evicted.push(key);
        }
        Ok(evicted)
    }
}
