use std::collections::HashMap;
use std::fmt;

use tracing::debug;

/// Identity of the thread of execution an event fired on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionContextId(pub u64);

impl fmt::Display for ExecutionContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of reclaim scope that opened an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ScopeKind {
    Direct = 0,
    Node = 1,
    Memcg = 2,
    Indirect = 3,
}

impl ScopeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Node => "node",
            Self::Memcg => "memcg",
            Self::Indirect => "indirect",
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Direct),
            1 => Some(Self::Node),
            2 => Some(Self::Memcg),
            3 => Some(Self::Indirect),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "direct" => Some(Self::Direct),
            "node" => Some(Self::Node),
            "memcg" => Some(Self::Memcg),
            "indirect" => Some(Self::Indirect),
            _ => None,
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named counters summed into an active reclaim scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubMetric {
    AnonPages = 0,
    FilePages = 1,
    SlabObjects = 2,
    PrunedInodes = 3,
    Buffers = 4,
}

/// Number of [`SubMetric`] variants.
pub const SUBMETRIC_COUNT: usize = 5;

impl SubMetric {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AnonPages => "anon",
            Self::FilePages => "file",
            Self::SlabObjects => "slab",
            Self::PrunedInodes => "inodes",
            Self::Buffers => "buffers",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            Self::AnonPages,
            Self::FilePages,
            Self::SlabObjects,
            Self::PrunedInodes,
            Self::Buffers,
        ]
    }
}

/// Result of closing a reclaim scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimSummary {
    pub ctx: ExecutionContextId,
    pub scope: ScopeKind,
    pub start_ns: u64,
    pub end_ns: u64,
    pub duration_ns: u64,
    pub counters: [u64; SUBMETRIC_COUNT],
}

impl ReclaimSummary {
    pub fn get(&self, metric: SubMetric) -> u64 {
        self.counters[metric as usize]
    }
}

#[derive(Debug, Clone)]
struct ContextSlot {
    ctx: ExecutionContextId,
    scope: ScopeKind,
    start_ns: u64,
    counters: [u64; SUBMETRIC_COUNT],
    nested: [Option<u64>; SUBMETRIC_COUNT],
}

impl ContextSlot {
    fn open(ctx: ExecutionContextId, scope: ScopeKind, start_ns: u64) -> Self {
        Self {
            ctx,
            scope,
            start_ns,
            counters: [0; SUBMETRIC_COUNT],
            nested: [None; SUBMETRIC_COUNT],
        }
    }
}

/// Counters kept by an [`IntervalAccumulator`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorCounts {
    /// `begin` while already active; the old scope was discarded.
    pub reentrant_begins: u64,
    /// `begin` refused because the arena was full.
    pub dropped_begins: u64,
    /// Sub-metric or `end` events seen with no active scope.
    pub idle_events: u64,
}

/// Per-execution-context reclaim scopes held in an arena.
///
/// Each context moves `Idle -> Active -> Idle`. Re-entering `begin` while
/// active overwrites the open scope; nesting is not supported. Owned by a
/// single processing task, so no synchronization.
pub struct IntervalAccumulator {
    index: HashMap<ExecutionContextId, usize>,
    slots: Vec<ContextSlot>,
    free: Vec<usize>,
    max_contexts: usize,
    counts: AccumulatorCounts,
}

impl IntervalAccumulator {
    pub fn new(max_contexts: usize) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            max_contexts: max_contexts.max(1),
            counts: AccumulatorCounts::default(),
        }
    }

    /// Open a scope for `ctx`, zeroing its counters.
    ///
    /// Returns false only when the arena is full and `ctx` had no slot.
    pub fn begin(&mut self, ctx: ExecutionContextId, scope: ScopeKind, ts: u64) -> bool {
        if let Some(&idx) = self.index.get(&ctx) {
            if let Some(slot) = self.slots.get_mut(idx) {
                debug!(
                    ctx = ctx.0,
                    previous = slot.scope.as_str(),
                    scope = scope.as_str(),
                    "reentrant reclaim begin, discarding open scope"
                );
                *slot = ContextSlot::open(ctx, scope, ts);
                self.counts.reentrant_begins += 1;
                return true;
            }
        }

        if self.index.len() >= self.max_contexts {
            self.counts.dropped_begins += 1;
            return false;
        }

        let fresh = ContextSlot::open(ctx, scope, ts);
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = fresh;
                idx
            }
            None => {
                self.slots.push(fresh);
                self.slots.len() - 1
            }
        };
        self.index.insert(ctx, idx);
        true
    }

    /// Add `delta` to `metric` in the scope open for `ctx`. No-op when idle.
    pub fn add_submetric(&mut self, ctx: ExecutionContextId, metric: SubMetric, delta: u64) {
        match self.active_mut(ctx) {
            Some(slot) => {
                let c = &mut slot.counters[metric as usize];
                *c = c.saturating_add(delta);
            }
            None => self.counts.idle_events += 1,
        }
    }

    /// Open a narrower interval for `metric` with its starting `reading`.
    pub fn begin_nested(&mut self, ctx: ExecutionContextId, metric: SubMetric, reading: u64) {
        match self.active_mut(ctx) {
            Some(slot) => slot.nested[metric as usize] = Some(reading),
            None => self.counts.idle_events += 1,
        }
    }

    /// Close the narrower interval for `metric`, adding the progress since
    /// its begin into the outer scope. Unmatched ends are ignored.
    pub fn end_nested(&mut self, ctx: ExecutionContextId, metric: SubMetric, reading: u64) {
        match self.active_mut(ctx) {
            Some(slot) => {
                if let Some(start) = slot.nested[metric as usize].take() {
                    let c = &mut slot.counters[metric as usize];
                    *c = c.saturating_add(reading.saturating_sub(start));
                }
            }
            None => self.counts.idle_events += 1,
        }
    }

    /// Close the scope for `ctx` and release its slot.
    pub fn end(&mut self, ctx: ExecutionContextId, ts: u64) -> Option<ReclaimSummary> {
        let Some(idx) = self.index.remove(&ctx) else {
            self.counts.idle_events += 1;
            return None;
        };
        self.free.push(idx);
        let slot = self.slots.get(idx)?;

        Some(ReclaimSummary {
            ctx,
            scope: slot.scope,
            start_ns: slot.start_ns,
            end_ns: ts,
            duration_ns: ts.saturating_sub(slot.start_ns),
            counters: slot.counters,
        })
    }

    pub fn is_active(&self, ctx: ExecutionContextId) -> bool {
        self.index.contains_key(&ctx)
    }

    /// Number of open scopes.
    pub fn active_len(&self) -> usize {
        self.index.len()
    }

    /// Drop every open scope. Returns the number discarded.
    pub fn discard_all(&mut self) -> usize {
        let n = self.index.len();
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        n
    }

    /// Read and reset counters.
    pub fn take_counts(&mut self) -> AccumulatorCounts {
        std::mem::take(&mut self.counts)
    }

    fn active_mut(&mut self, ctx: ExecutionContextId) -> Option<&mut ContextSlot> {
        let idx = *self.index.get(&ctx)?;
        self.slots.get_mut(idx).filter(|slot| slot.ctx == ctx)
    }
}
