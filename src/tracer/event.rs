use std::fmt;

use crate::correlate::interval::{ExecutionContextId, ScopeKind, SubMetric};
use crate::correlate::key::FlowKey;
use crate::correlate::stage::{Pipeline, Stage};

/// EventType identifies the kernel probe an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    RdsSend = 1,
    RdsXmit = 2,
    RdsComplete = 3,
    RdsRecv = 4,
    RdsDeliver = 5,
    BlockIssue = 6,
    BlockComplete = 7,
    NetQueue = 8,
    NetXmit = 9,
    CongSet = 10,
    CongClear = 11,
    ReclaimBegin = 12,
    ReclaimEnd = 13,
    LruShrink = 14,
    SlabShrinkBegin = 15,
    SlabShrinkEnd = 16,
    InodePruneBegin = 17,
    InodePruneEnd = 18,
    BufferFreeBegin = 19,
    BufferFreeEnd = 20,
}

/// Maximum EventType value, used for array sizing.
pub const MAX_EVENT_TYPE: usize = 20;

impl EventType {
    /// Returns the probe name used in input records and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RdsSend => "rds_send",
            Self::RdsXmit => "rds_xmit",
            Self::RdsComplete => "rds_complete",
            Self::RdsRecv => "rds_recv",
            Self::RdsDeliver => "rds_deliver",
            Self::BlockIssue => "block_issue",
            Self::BlockComplete => "block_complete",
            Self::NetQueue => "net_queue",
            Self::NetXmit => "net_xmit",
            Self::CongSet => "cong_set",
            Self::CongClear => "cong_clear",
            Self::ReclaimBegin => "reclaim_begin",
            Self::ReclaimEnd => "reclaim_end",
            Self::LruShrink => "lru_shrink",
            Self::SlabShrinkBegin => "slab_shrink_begin",
            Self::SlabShrinkEnd => "slab_shrink_end",
            Self::InodePruneBegin => "inode_prune_begin",
            Self::InodePruneEnd => "inode_prune_end",
            Self::BufferFreeBegin => "buffer_free_begin",
            Self::BufferFreeEnd => "buffer_free_end",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::all().get(usize::from(v).checked_sub(1)?).copied()
    }

    /// Convert from the probe name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.as_str() == name)
    }

    /// Return all event types in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::RdsSend,
            Self::RdsXmit,
            Self::RdsComplete,
            Self::RdsRecv,
            Self::RdsDeliver,
            Self::BlockIssue,
            Self::BlockComplete,
            Self::NetQueue,
            Self::NetXmit,
            Self::CongSet,
            Self::CongClear,
            Self::ReclaimBegin,
            Self::ReclaimEnd,
            Self::LruShrink,
            Self::SlabShrinkBegin,
            Self::SlabShrinkEnd,
            Self::InodePruneBegin,
            Self::InodePruneEnd,
            Self::BufferFreeBegin,
            Self::BufferFreeEnd,
        ]
    }

    /// Stage this probe marks, for flow probes.
    pub const fn stage(self) -> Option<Stage> {
        match self {
            Self::RdsSend => Some(Stage::Sent),
            Self::RdsXmit | Self::NetXmit => Some(Stage::Transmitted),
            Self::RdsComplete | Self::BlockComplete => Some(Stage::Completed),
            Self::RdsRecv => Some(Stage::ReceivedIncoming),
            Self::RdsDeliver => Some(Stage::DeliveredToConsumer),
            Self::BlockIssue => Some(Stage::Issued),
            Self::NetQueue => Some(Stage::Queued),
            Self::CongSet => Some(Stage::Congested),
            Self::CongClear => Some(Stage::Uncongested),
            _ => None,
        }
    }

    /// Sub-metric fed by a nested begin/end probe pair.
    pub const fn nested_metric(self) -> Option<SubMetric> {
        match self {
            Self::SlabShrinkBegin | Self::SlabShrinkEnd => Some(SubMetric::SlabObjects),
            Self::InodePruneBegin | Self::InodePruneEnd => Some(SubMetric::PrunedInodes),
            Self::BufferFreeBegin | Self::BufferFreeEnd => Some(SubMetric::Buffers),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common header of every event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub timestamp_ns: u64,
    pub ctx: ExecutionContextId,
    pub event_type: EventType,
}

/// A stage hit for one correlated pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEvent {
    pub pipeline: Pipeline,
    pub stage: Stage,
    pub key: FlowKey,
}

/// Decoded payload of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedEvent {
    Flow(FlowEvent),
    ReclaimBegin { scope: ScopeKind },
    ReclaimEnd,
    /// Pages reclaimed from the LRU lists by one shrink pass.
    LruShrink { anon: u64, file: u64 },
    NestedBegin { metric: SubMetric, reading: u64 },
    NestedEnd { metric: SubMetric, reading: u64 },
}

/// Fully decoded event with header and typed payload.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub raw: Event,
    pub typed: TypedEvent,
}
