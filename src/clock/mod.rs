use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic nanosecond timestamp source.
///
/// Event timestamps come from the producer; the clock is only consulted
/// for housekeeping decisions such as idle sweeps and flush timing.
pub trait Clock: Send + Sync {
    /// Returns the current monotonic time in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Called with each event timestamp as it is consumed. Wall clocks
    /// ignore it.
    fn observe_event_time(&self, _ts_ns: u64) {}
}

/// `CLOCK_MONOTONIC` backed clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        monotonic_ns()
    }
}

/// Clock whose value only moves when told to. Replayed traces advance it
/// from event timestamps so idle sweeps see trace time, not wall time.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at `start_ns`.
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    /// Set the clock to `ns`. Never moves backwards.
    pub fn advance_to(&self, ns: u64) {
        self.now.fetch_max(ns, Ordering::Relaxed);
    }

    /// Move the clock forward by `delta_ns`.
    pub fn advance_by(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn observe_event_time(&self, ts_ns: u64) {
        self.advance_to(ts_ns);
    }
}

/// Returns current monotonic clock value in nanoseconds.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and does not
    // require any Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}
