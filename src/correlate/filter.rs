use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::correlator::FinalizedRecord;
use super::key::FlowKey;

/// Drops finalized records whose total is below a minimum duration.
///
/// Records without a defined total are never accepted; they are counted
/// as incomplete instead.
#[derive(Debug)]
pub struct ThresholdFilter {
    min_ns: u64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    incomplete: AtomicU64,
}

/// Point-in-time copy of the filter counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterCounts {
    pub accepted: u64,
    pub rejected: u64,
    pub incomplete: u64,
}

impl ThresholdFilter {
    pub fn new(min_ns: u64) -> Self {
        Self {
            min_ns,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            incomplete: AtomicU64::new(0),
        }
    }

    pub fn min_ns(&self) -> u64 {
        self.min_ns
    }

    pub fn accept(&self, record: &FinalizedRecord) -> bool {
        self.accept_duration(record.total_ns())
    }

    /// Same rule for durations that do not come from a [`FinalizedRecord`].
    pub fn accept_duration(&self, total_ns: Option<u64>) -> bool {
        match total_ns {
            Some(total) if total >= self.min_ns => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => {
                self.incomplete.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Read and reset counters.
    pub fn take_counts(&self) -> FilterCounts {
        FilterCounts {
            accepted: self.accepted.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            incomplete: self.incomplete.swap(0, Ordering::Relaxed),
        }
    }
}

/// Restricts address-keyed flows to one host and/or port.
///
/// Either side of the key may match. An empty filter matches everything.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeyFilter {
    pub address: Option<Ipv4Addr>,
    pub port: Option<u16>,
}

impl KeyFilter {
    pub fn is_empty(&self) -> bool {
        self.address.is_none() && self.port.is_none()
    }

    pub fn matches(&self, key: &FlowKey) -> bool {
        if let Some(addr) = self.address {
            let id = u64::from(u32::from(addr));
            if key.src_id != id && key.dst_id != id {
                return false;
            }
        }

        if let Some(port) = self.port {
            let port = u32::from(port);
            if key.src_port != port && key.dst_port != port {
                return false;
            }
        }

        true
    }
}
