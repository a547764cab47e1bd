use std::sync::atomic::{AtomicU64, Ordering};

use super::key::FlowKey;
use super::stage::{Protocol, Stage, MAX_STAGES};
use super::table::StageTable;

/// Value rendered in place of a missing timestamp, delta or total.
pub const SENTINEL: i64 = -1;

/// Clamp a nanosecond value into the signed record fields. Values past
/// `i64::MAX` saturate so they never collide with [`SENTINEL`].
fn signed(ns: u64) -> i64 {
    i64::try_from(ns).unwrap_or(i64::MAX)
}

/// A flow whose terminal stage has fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedRecord {
    pub protocol: &'static Protocol,
    pub key: FlowKey,
    /// Per-stage timestamps in protocol order, [`SENTINEL`] when missing.
    pub stamps: [i64; MAX_STAGES],
    /// `stamps[i + 1] - stamps[i]`, [`SENTINEL`] when either side is missing.
    pub deltas: [i64; MAX_STAGES - 1],
    /// Terminal time minus first-stage time, [`SENTINEL`] when the first
    /// stage was never seen.
    pub total: i64,
    /// Set when a later stage carried an earlier timestamp than its
    /// predecessor. The affected delta is clamped to zero.
    pub out_of_order: bool,
}

impl FinalizedRecord {
    pub fn stage_count(&self) -> usize {
        self.protocol.stages.len()
    }

    /// Deltas for this record's protocol, without unused trailing slots.
    pub fn deltas(&self) -> &[i64] {
        &self.deltas[..self.stage_count() - 1]
    }

    /// Timestamps for this record's protocol, without unused trailing slots.
    pub fn stamps(&self) -> &[i64] {
        &self.stamps[..self.stage_count()]
    }

    /// `(from, to, delta)` for each adjacent stage pair.
    pub fn segments(&self) -> impl Iterator<Item = (Stage, Stage, i64)> + '_ {
        self.protocol
            .segments()
            .zip(self.deltas.iter())
            .map(|((from, to), d)| (from, to, *d))
    }

    /// Defined total in nanoseconds.
    pub fn total_ns(&self) -> Option<u64> {
        u64::try_from(self.total).ok()
    }

    /// True when every stage was observed.
    pub fn is_complete(&self) -> bool {
        self.stamps().iter().all(|s| *s != SENTINEL)
    }
}

/// Counters kept by a [`FlowCorrelator`]. Read with swap-to-zero.
#[derive(Debug, Default)]
pub struct CorrelatorStats {
    finalized: AtomicU64,
    orphaned: AtomicU64,
    foreign_stage: AtomicU64,
}

/// Point-in-time copy of [`CorrelatorStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorCounts {
    pub finalized: u64,
    pub orphaned: u64,
    pub foreign_stage: u64,
    pub evicted: u64,
    pub swept: u64,
}

impl CorrelatorCounts {
    pub fn add(&mut self, other: &Self) {
        self.finalized += other.finalized;
        self.orphaned += other.orphaned;
        self.foreign_stage += other.foreign_stage;
        self.evicted += other.evicted;
        self.swept += other.swept;
    }
}

/// Joins stage hits for one protocol and computes inter-stage deltas.
///
/// All operations are total: unknown stages are ignored, orphaned terminal
/// events return `None`, missing stages become [`SENTINEL`]. Safe for
/// concurrent use.
pub struct FlowCorrelator {
    protocol: &'static Protocol,
    table: StageTable,
    stats: CorrelatorStats,
}

impl FlowCorrelator {
    pub fn new(protocol: &'static Protocol, capacity: usize) -> Self {
        Self {
            protocol,
            table: StageTable::new(capacity),
            stats: CorrelatorStats::default(),
        }
    }

    pub fn protocol(&self) -> &'static Protocol {
        self.protocol
    }

    /// Store or overwrite the timestamp for `(key, stage)`.
    pub fn record(&self, key: FlowKey, stage: Stage, ts: u64) {
        match self.protocol.position(stage) {
            Some(slot) => self.table.record(key, slot, ts),
            None => {
                self.stats.foreign_stage.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Close out `key` at `now` for the terminal stage `terminal`.
    ///
    /// Returns `None` when nothing was recorded for `key`; such orphaned
    /// terminal events are counted. The key's state is removed either way.
    pub fn finalize(&self, key: FlowKey, terminal: Stage, now: u64) -> Option<FinalizedRecord> {
        let Some(entry) = self.table.take(&key) else {
            self.stats.orphaned.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let count = self.protocol.stages.len();
        let mut raw = entry.stamps;
        if let Some(slot) = self.protocol.position(terminal) {
            if let Some(s) = raw.get_mut(slot) {
                *s = Some(now);
            }
        }

        let mut stamps = [SENTINEL; MAX_STAGES];
        for (out, ts) in stamps.iter_mut().zip(raw.iter()).take(count) {
            if let Some(ts) = ts {
                *out = signed(*ts);
            }
        }

        let mut deltas = [SENTINEL; MAX_STAGES - 1];
        let mut out_of_order = false;
        for i in 0..count.saturating_sub(1) {
            if let (Some(prev), Some(next)) = (raw[i], raw[i + 1]) {
                if next < prev {
                    out_of_order = true;
                }
                deltas[i] = signed(next.saturating_sub(prev));
            }
        }

        let total = match raw[0] {
            Some(first) => {
                if now < first {
                    out_of_order = true;
                }
                signed(now.saturating_sub(first))
            }
            None => SENTINEL,
        };

        self.stats.finalized.fetch_add(1, Ordering::Relaxed);

        Some(FinalizedRecord {
            protocol: self.protocol,
            key,
            stamps,
            deltas,
            total,
            out_of_order,
        })
    }

    /// Record `stage`, finalizing when it is this protocol's terminal stage.
    pub fn observe(&self, key: FlowKey, stage: Stage, ts: u64) -> Option<FinalizedRecord> {
        if self.protocol.is_terminal(stage) {
            self.finalize(key, stage, ts)
        } else {
            self.record(key, stage, ts);
            None
        }
    }

    /// Number of in-flight flows.
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// True when `key` has recorded stages.
    pub fn is_tracking(&self, key: &FlowKey) -> bool {
        self.table.contains(key)
    }

    /// Drop flows idle for at least `horizon_ns`.
    pub fn sweep_idle(&self, now_ns: u64, horizon_ns: u64) -> usize {
        self.table.sweep_idle(now_ns, horizon_ns)
    }

    /// Discard every in-flight flow.
    pub fn discard_in_flight(&self) -> usize {
        self.table.clear()
    }

    /// Read and reset counters.
    pub fn take_counts(&self) -> CorrelatorCounts {
        CorrelatorCounts {
            finalized: self.stats.finalized.swap(0, Ordering::Relaxed),
            orphaned: self.stats.orphaned.swap(0, Ordering::Relaxed),
            foreign_stage: self.stats.foreign_stage.swap(0, Ordering::Relaxed),
            evicted: self.table.take_evicted(),
            swept: self.table.take_swept(),
        }
    }
}
