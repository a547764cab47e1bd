use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::key::FlowKey;
use super::stage::MAX_STAGES;

/// Fraction of the table evicted when the capacity cap is hit (1/8).
const EVICT_DIVISOR: usize = 8;

/// Stage timestamps captured so far for one in-flight flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEntry {
    /// Timestamp per stage slot, indexed by the stage's position in its protocol.
    pub stamps: [Option<u64>; MAX_STAGES],
    /// Timestamp of the first observation, used to pick eviction victims.
    pub first_seen_ns: u64,
    /// Latest timestamp written, used by the idle sweep.
    pub last_seen_ns: u64,
}

impl FlowEntry {
    fn new(slot: usize, ts: u64) -> Self {
        let mut entry = Self {
            stamps: [None; MAX_STAGES],
            first_seen_ns: ts,
            last_seen_ns: ts,
        };
        entry.stamp(slot, ts);
        entry
    }

    fn stamp(&mut self, slot: usize, ts: u64) {
        if let Some(s) = self.stamps.get_mut(slot) {
            *s = Some(ts);
        }
        self.first_seen_ns = self.first_seen_ns.min(ts);
        self.last_seen_ns = self.last_seen_ns.max(ts);
    }
}

/// Concurrent `FlowKey × stage → timestamp` join table.
///
/// Memory is bounded two ways: a capacity cap that evicts the oldest eighth
/// of entries in one batch when a new key arrives at a full table, and an
/// idle sweep driven by the report tick. Writes to the same slot are
/// last-write-wins.
pub struct StageTable {
    entries: DashMap<FlowKey, FlowEntry>,
    capacity: usize,
    live: AtomicUsize,
    evicted: AtomicU64,
    swept: AtomicU64,
}

impl StageTable {
    /// Create a table holding at most `capacity` in-flight flows.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            live: AtomicUsize::new(0),
            evicted: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }
    }

    /// Store `ts` for stage slot `slot` of `key`, creating the entry if needed.
    pub fn record(&self, key: FlowKey, slot: usize, ts: u64) {
        // Eviction walks every shard, so it must run before this call takes
        // the entry's shard lock.
        if self.live.load(Ordering::Relaxed) >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }

        match self.entries.entry(key) {
            Entry::Occupied(mut e) => e.get_mut().stamp(slot, ts),
            Entry::Vacant(v) => {
                // Count while the shard lock is held so a racing `take` of
                // this key always decrements after the increment.
                let _guard = v.insert(FlowEntry::new(slot, ts));
                self.live.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove and return the entry for `key`.
    pub fn take(&self, key: &FlowKey) -> Option<FlowEntry> {
        let (_, entry) = self.entries.remove(key)?;
        self.live.fetch_sub(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Copy of the entry for `key`, if any.
    pub fn get(&self, key: &FlowKey) -> Option<FlowEntry> {
        self.entries.get(key).map(|e| *e.value())
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of in-flight flows.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop entries whose last write is at least `horizon_ns` older than
    /// `now_ns`. Returns the number removed.
    pub fn sweep_idle(&self, now_ns: u64, horizon_ns: u64) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|_, entry| {
            let keep = now_ns.saturating_sub(entry.last_seen_ns) < horizon_ns;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            self.live.fetch_sub(removed, Ordering::Relaxed);
            self.swept.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every in-flight flow. Returns the number discarded.
    pub fn clear(&self) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|_, _| {
            removed += 1;
            false
        });
        self.live.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    /// Read and reset the capacity-eviction counter.
    pub fn take_evicted(&self) -> u64 {
        self.evicted.swap(0, Ordering::Relaxed)
    }

    /// Read and reset the idle-sweep counter.
    pub fn take_swept(&self) -> u64 {
        self.swept.swap(0, Ordering::Relaxed)
    }

    fn evict_oldest(&self) {
        let mut ages: Vec<(u64, FlowKey)> = self
            .entries
            .iter()
            .map(|e| (e.value().first_seen_ns, *e.key()))
            .collect();
        if ages.is_empty() {
            return;
        }

        let n = (ages.len() / EVICT_DIVISOR).max(1);
        ages.select_nth_unstable(n - 1);

        for (_, key) in ages.iter().take(n) {
            if self.entries.remove(key).is_some() {
                self.live.fetch_sub(1, Ordering::Relaxed);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl std::fmt::Debug for StageTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
