use std::sync::atomic::{AtomicU64, Ordering};

/// Number of histogram buckets: one zero bucket plus one per bit of `u64`.
pub const NUM_BUCKETS: usize = 65;

/// Power-of-two histogram. Bucket `0` holds zero, bucket `k + 1` holds
/// values whose highest set bit is `k`, i.e. `[2^k, 2^(k+1))`.
/// All operations are atomic and safe for concurrent use.
pub struct Log2Histogram {
    buckets: [AtomicU64; NUM_BUCKETS],
}

impl Log2Histogram {
    /// Creates a new histogram with all buckets at zero.
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Records a value to the bucket selected by [`quantize`].
    pub fn add(&self, value: u64) {
        if let Some(bucket) = self.buckets.get(quantize(value)) {
            bucket.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns non-zero `(bucket, count)` pairs and zeroes them.
    ///
    /// Each bucket is swapped individually, so a concurrent `add` lands in
    /// either this snapshot or the next one, never neither.
    pub fn snapshot_and_reset(&self) -> Vec<(usize, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                let v = b.swap(0, Ordering::Relaxed);
                (v > 0).then_some((i, v))
            })
            .collect()
    }

    /// Returns non-zero `(bucket, count)` pairs without resetting.
    pub fn snapshot(&self) -> Vec<(usize, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                let v = b.load(Ordering::Relaxed);
                (v > 0).then_some((i, v))
            })
            .collect()
    }

    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.load(Ordering::Relaxed) == 0)
    }
}

impl Default for Log2Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Log2Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log2Histogram")
            .field("buckets", &self.snapshot())
            .finish()
    }
}

/// Bucket index for `value`.
#[inline]
pub const fn quantize(value: u64) -> usize {
    (u64::BITS - value.leading_zeros()) as usize
}

/// Smallest value that lands in `bucket`.
pub const fn bucket_lower_bound(bucket: usize) -> u64 {
    if bucket == 0 {
        0
    } else if bucket >= NUM_BUCKETS {
        u64::MAX
    } else {
        1u64 << (bucket - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_small_values() {
        assert_eq!(quantize(0), 0);
        assert_eq!(quantize(1), 1);
        assert_eq!(quantize(2), 2);
        assert_eq!(quantize(3), 2);
        assert_eq!(quantize(4), 3);
        assert_eq!(quantize(1023), 10);
        assert_eq!(quantize(1024), 11);
        assert_eq!(quantize(u64::MAX), 64);
    }

    #[test]
    fn test_power_of_two_boundaries() {
        for k in 0..63u32 {
            let lo = 1u64 << k;
            let next = 1u64 << (k + 1);
            assert_eq!(quantize(lo), quantize(next - 1), "k={k}");
            assert_eq!(quantize(next), quantize(lo) + 1, "k={k}");
            assert_eq!(bucket_lower_bound(quantize(lo)), lo);
        }
    }

    #[test]
    fn test_lower_bounds() {
        assert_eq!(bucket_lower_bound(0), 0);
        assert_eq!(bucket_lower_bound(1), 1);
        assert_eq!(bucket_lower_bound(2), 2);
        assert_eq!(bucket_lower_bound(3), 4);
        assert_eq!(bucket_lower_bound(64), 1u64 << 63);
    }

    #[test]
    fn test_reset_then_single_add() {
        let h = Log2Histogram::new();
        for v in [0u64, 5, 5, 900, 1 << 40] {
            h.add(v);
        }
        assert_eq!(h.count(), 5);
        let first = h.snapshot_and_reset();
        assert_eq!(first, vec![(0, 1), (3, 2), (10, 1), (41, 1)]);
        assert!(h.is_empty());

        h.add(3000);
        assert_eq!(h.snapshot_and_reset(), vec![(quantize(3000), 1)]);
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let h = std::sync::Arc::new(Log2Histogram::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let h = std::sync::Arc::clone(&h);
                std::thread::spawn(move || {
                    for i in 0..10_000u64 {
                        h.add(i);
                    }
                })
            })
            .collect();

        let mut seen = 0u64;
        for _ in 0..50 {
            seen += h.snapshot_and_reset().iter().map(|(_, c)| c).sum::<u64>();
        }
        for w in writers {
            w.join().expect("writer");
        }
        seen += h.snapshot_and_reset().iter().map(|(_, c)| c).sum::<u64>();
        assert_eq!(seen, 40_000);
    }
}
