use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;

use super::histogram::Log2Histogram;
use super::interval::ScopeKind;
use super::stage::Stage;

/// What a histogram group measures within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Series {
    /// First stage to terminal stage.
    Total,
    /// One adjacent stage pair.
    Segment(Stage, Stage),
    /// Reclaim scope duration.
    Scope(ScopeKind),
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Total => f.write_str("total"),
            Self::Segment(from, to) => write!(f, "{from}->{to}"),
            Self::Scope(scope) => write!(f, "{scope}"),
        }
    }
}

/// Reporting key for one histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub pipeline: &'static str,
    pub series: Series,
}

impl GroupKey {
    pub const fn new(pipeline: &'static str, series: Series) -> Self {
        Self { pipeline, series }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.pipeline, self.series)
    }
}

/// One drained group: key and its non-zero `(bucket, count)` pairs.
pub type GroupSnapshot<G> = (G, Vec<(usize, u64)>);

/// Log2 histograms grouped by a reporting key.
///
/// Uses `DashMap` so producers on different groups do not contend. A
/// non-zero `max_groups` caps cardinality; adds for new groups beyond it
/// are dropped and counted.
pub struct HistogramAggregator<G = GroupKey> {
    groups: DashMap<G, Log2Histogram>,
    max_groups: usize,
    live: AtomicUsize,
    dropped: AtomicU64,
}

impl<G> HistogramAggregator<G>
where
    G: Eq + Hash + Clone + Ord,
{
    /// Create an aggregator. `max_groups == 0` means unbounded.
    pub fn new(max_groups: usize) -> Self {
        Self {
            groups: DashMap::new(),
            max_groups,
            live: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Insert `value` into `group`. Returns false when the group cap dropped it.
    pub fn add(&self, group: &G, value: u64) -> bool {
        if let Some(h) = self.groups.get(group) {
            h.add(value);
            return true;
        }

        if self.max_groups > 0 && self.live.load(Ordering::Relaxed) >= self.max_groups {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.groups
            .entry(group.clone())
            .or_insert_with(|| {
                self.live.fetch_add(1, Ordering::Relaxed);
                Log2Histogram::new()
            })
            .add(value);
        true
    }

    /// Non-zero counts for `group`, zeroed atomically with respect to `add`.
    pub fn snapshot_and_reset(&self, group: &G) -> Vec<(usize, u64)> {
        self.groups
            .get(group)
            .map(|h| h.snapshot_and_reset())
            .unwrap_or_default()
    }

    /// Counts for `group` without resetting.
    pub fn snapshot(&self, group: &G) -> Vec<(usize, u64)> {
        self.groups
            .get(group)
            .map(|h| h.snapshot())
            .unwrap_or_default()
    }

    /// Remove every group and return the non-empty ones, sorted by key.
    ///
    /// A group is removed before it is read, so an `add` racing with the
    /// drain either completes before the removal or recreates the group for
    /// the next window.
    pub fn drain(&self) -> Vec<GroupSnapshot<G>> {
        let keys: Vec<G> = self.groups.iter().map(|e| e.key().clone()).collect();
        let mut out = Vec::with_capacity(keys.len());

        for key in keys {
            if let Some((key, h)) = self.groups.remove(&key) {
                self.live.fetch_sub(1, Ordering::Relaxed);
                let buckets = h.snapshot_and_reset();
                if !buckets.is_empty() {
                    out.push((key, buckets));
                }
            }
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn group_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Read and reset the dropped-add counter.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}
