use tracing::debug;

use super::aggregator::{GroupKey, GroupSnapshot, HistogramAggregator, Series};
use super::correlator::{CorrelatorCounts, FinalizedRecord, FlowCorrelator, SENTINEL};
use super::filter::{FilterCounts, KeyFilter, ThresholdFilter};
use super::interval::{AccumulatorCounts, IntervalAccumulator, ReclaimSummary, SubMetric};
use super::stage::{Endpoints, Pipeline, PIPELINE_COUNT};
use crate::tracer::event::{ParsedEvent, TypedEvent};

/// Pipeline label used for reclaim scope rows and histograms.
pub const RECLAIM_PIPELINE: &str = "reclaim";

/// Construction parameters for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Correlated pipelines to track. Events for others are ignored.
    pub pipelines: Vec<Pipeline>,
    /// Track reclaim scopes.
    pub reclaim: bool,
    pub min_duration_ns: u64,
    /// Applied to address-keyed pipelines only.
    pub key_filter: KeyFilter,
    pub stage_table_capacity: usize,
    pub max_histogram_groups: usize,
    pub max_contexts: usize,
    pub max_pending_rows: usize,
    /// Also histogram each adjacent stage pair, not just the total.
    pub segment_histograms: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pipelines: Pipeline::all().to_vec(),
            reclaim: true,
            min_duration_ns: 0,
            key_filter: KeyFilter::default(),
            stage_table_capacity: 65_536,
            max_histogram_groups: 1_024,
            max_contexts: 4_096,
            max_pending_rows: 65_536,
            segment_histograms: false,
        }
    }
}

/// One accepted output row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Flow(FinalizedRecord),
    Reclaim(ReclaimSummary),
}

/// Everything accumulated since the previous flush.
#[derive(Debug, Default)]
pub struct WindowReport {
    pub rows: Vec<Row>,
    pub histograms: Vec<GroupSnapshot<GroupKey>>,
}

impl WindowReport {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.histograms.is_empty()
    }
}

/// Counters drained by [`Engine::take_counts`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineCounts {
    pub flows: CorrelatorCounts,
    pub filter: FilterCounts,
    pub accumulator: AccumulatorCounts,
    /// Events for keys outside the address/port filter.
    pub key_filtered: u64,
    pub histogram_groups_dropped: u64,
    pub rows_dropped: u64,
}

/// Routes decoded events through the correlators, the reclaim
/// accumulator, the threshold filter and the histogram aggregator.
///
/// Owned by the single processing task.
pub struct Engine {
    correlators: [Option<FlowCorrelator>; PIPELINE_COUNT],
    reclaim: bool,
    threshold: ThresholdFilter,
    key_filter: KeyFilter,
    histograms: HistogramAggregator<GroupKey>,
    intervals: IntervalAccumulator,
    rows: Vec<Row>,
    max_pending_rows: usize,
    segment_histograms: bool,
    key_filtered: u64,
    rows_dropped: u64,
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        let mut correlators: [Option<FlowCorrelator>; PIPELINE_COUNT] = Default::default();
        for pipeline in &settings.pipelines {
            correlators[*pipeline as usize] = Some(FlowCorrelator::new(
                pipeline.protocol(),
                settings.stage_table_capacity,
            ));
        }

        Self {
            correlators,
            reclaim: settings.reclaim,
            threshold: ThresholdFilter::new(settings.min_duration_ns),
            key_filter: settings.key_filter,
            histograms: HistogramAggregator::new(settings.max_histogram_groups),
            intervals: IntervalAccumulator::new(settings.max_contexts),
            rows: Vec::new(),
            max_pending_rows: settings.max_pending_rows,
            segment_histograms: settings.segment_histograms,
            key_filtered: 0,
            rows_dropped: 0,
        }
    }

    /// Feed one event. Never fails; anomalies are counted.
    pub fn process(&mut self, event: &ParsedEvent) {
        let ts = event.raw.timestamp_ns;
        let ctx = event.raw.ctx;

        match &event.typed {
            TypedEvent::Flow(flow) => {
                let Some(correlator) = &self.correlators[flow.pipeline as usize] else {
                    return;
                };
                let protocol = correlator.protocol();
                if protocol.endpoints == Endpoints::Inet && !self.key_filter.matches(&flow.key) {
                    self.key_filtered += 1;
                    return;
                }
                if let Some(record) = correlator.observe(flow.key, flow.stage, ts) {
                    self.accept_flow(record);
                }
            }
            _ if !self.reclaim => {}
            TypedEvent::ReclaimBegin { scope } => {
                self.intervals.begin(ctx, *scope, ts);
            }
            TypedEvent::LruShrink { anon, file } => {
                self.intervals.add_submetric(ctx, SubMetric::AnonPages, *anon);
                self.intervals.add_submetric(ctx, SubMetric::FilePages, *file);
            }
            TypedEvent::NestedBegin { metric, reading } => {
                self.intervals.begin_nested(ctx, *metric, *reading);
            }
            TypedEvent::NestedEnd { metric, reading } => {
                self.intervals.end_nested(ctx, *metric, *reading);
            }
            TypedEvent::ReclaimEnd => {
                if let Some(summary) = self.intervals.end(ctx, ts) {
                    self.accept_reclaim(summary);
                }
            }
        }
    }

    fn accept_flow(&mut self, record: FinalizedRecord) {
        if !self.threshold.accept(&record) {
            return;
        }
        let pipeline = record.protocol.name;
        if let Some(total) = record.total_ns() {
            self.histograms
                .add(&GroupKey::new(pipeline, Series::Total), total);
        }
        if self.segment_histograms {
            for (from, to, delta) in record.segments() {
                if delta == SENTINEL {
                    continue;
                }
                if let Ok(delta) = u64::try_from(delta) {
                    self.histograms
                        .add(&GroupKey::new(pipeline, Series::Segment(from, to)), delta);
                }
            }
        }
        self.push_row(Row::Flow(record));
    }

    fn accept_reclaim(&mut self, summary: ReclaimSummary) {
        if !self.threshold.accept_duration(Some(summary.duration_ns)) {
            return;
        }
        self.histograms.add(
            &GroupKey::new(RECLAIM_PIPELINE, Series::Scope(summary.scope)),
            summary.duration_ns,
        );
        self.push_row(Row::Reclaim(summary));
    }

    fn push_row(&mut self, row: Row) {
        if self.rows.len() >= self.max_pending_rows {
            self.rows_dropped += 1;
            return;
        }
        self.rows.push(row);
    }

    /// Take rows and histogram contents accumulated since the last flush.
    pub fn flush(&mut self) -> WindowReport {
        WindowReport {
            rows: std::mem::take(&mut self.rows),
            histograms: self.histograms.drain(),
        }
    }

    /// Drop flow entries not touched within `horizon_ns` of `now_ns`.
    pub fn sweep_idle(&self, now_ns: u64, horizon_ns: u64) -> usize {
        let swept: usize = self
            .correlators
            .iter()
            .flatten()
            .map(|c| c.sweep_idle(now_ns, horizon_ns))
            .sum();
        if swept > 0 {
            debug!(swept, horizon_ns, "swept idle flows");
        }
        swept
    }

    /// Flows waiting for their terminal stage.
    pub fn in_flight(&self) -> usize {
        self.correlators.iter().flatten().map(|c| c.in_flight()).sum()
    }

    /// Open reclaim scopes.
    pub fn open_scopes(&self) -> usize {
        self.intervals.active_len()
    }

    /// Forget all non-terminal flows and open scopes.
    /// Returns `(flows, scopes)` discarded.
    pub fn discard_in_flight(&mut self) -> (usize, usize) {
        let flows = self
            .correlators
            .iter()
            .flatten()
            .map(|c| c.discard_in_flight())
            .sum();
        (flows, self.intervals.discard_all())
    }

    /// Read and reset every counter.
    pub fn take_counts(&mut self) -> EngineCounts {
        let mut flows = CorrelatorCounts::default();
        for correlator in self.correlators.iter().flatten() {
            flows.add(&correlator.take_counts());
        }

        EngineCounts {
            flows,
            filter: self.threshold.take_counts(),
            accumulator: self.intervals.take_counts(),
            key_filtered: std::mem::take(&mut self.key_filtered),
            histogram_groups_dropped: self.histograms.take_dropped(),
            rows_dropped: std::mem::take(&mut self.rows_dropped),
        }
    }
}
