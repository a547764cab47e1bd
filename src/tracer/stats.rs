use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{EventType, MAX_EVENT_TYPE};

/// Lock-free ingest counters: decoded events per probe plus rejected records.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EventStats {
    counts: [AtomicU64; MAX_EVENT_TYPE + 1],
    parse_errors: AtomicU64,
}

/// Counters drained by [`EventStats::snapshot`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Non-zero per-probe counts in probe order.
    pub by_probe: Vec<(EventType, u64)>,
    pub parse_errors: u64,
}

impl StatsSnapshot {
    pub fn events(&self) -> u64 {
        self.by_probe.iter().map(|(_, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_probe.is_empty() && self.parse_errors == 0
    }
}

impl EventStats {
    /// Create a new zeroed EventStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            parse_errors: AtomicU64::new(0),
        }
    }

    /// Count one decoded event of type `t`.
    pub fn record(&self, t: EventType) {
        if let Some(counter) = self.counts.get(t as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one record that failed to decode.
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let by_probe = self
            .counts
            .iter()
            .enumerate()
            .filter_map(|(i, counter)| {
                let v = counter.swap(0, Ordering::Relaxed);
                let et = EventType::from_u8(u8::try_from(i).ok()?)?;
                (v > 0).then_some((et, v))
            })
            .collect();

        StatsSnapshot {
            by_probe,
            parse_errors: self.parse_errors.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = EventStats::new();
        stats.record(EventType::RdsSend);
        stats.record(EventType::RdsSend);
        stats.record(EventType::BlockIssue);
        stats.record_parse_error();

        let snap = stats.snapshot();
        assert_eq!(
            snap.by_probe,
            vec![(EventType::RdsSend, 2), (EventType::BlockIssue, 1)]
        );
        assert_eq!(snap.events(), 3);
        assert_eq!(snap.parse_errors, 1);
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = EventStats::new();
        stats.record(EventType::ReclaimBegin);

        let snap1 = stats.snapshot();
        assert_eq!(snap1.by_probe.len(), 1);

        let snap2 = stats.snapshot();
        assert!(snap2.is_empty());
    }
}
