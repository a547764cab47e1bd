pub mod render;

use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, ManualClock, MonotonicClock};
use crate::config::{ClockSource, Config, ReportConfig};
use crate::correlate::engine::{Engine, EngineCounts, EngineSettings};
use crate::export::health::HealthMetrics;
use crate::sink::Sink;
use crate::tracer::event::ParsedEvent;
use crate::tracer::EventSender;

use self::render::Reporter;

/// Events handled per wakeup before the loop checks its other branches.
const BATCH_SIZE: usize = 256;

type Output = Box<dyn Write + Send>;

/// Correlates events and writes a report every interval and at shutdown.
pub struct ReportSink {
    report: ReportConfig,
    settings: EngineSettings,
    flow_idle_horizon: Duration,
    clock: Arc<dyn Clock>,
    health: Arc<HealthMetrics>,
    output: Option<Output>,

    /// Event channel sender handed to sources.
    sender: EventSender,
    /// Event channel receiver, taken by `start`.
    event_rx: Option<mpsc::Receiver<ParsedEvent>>,

    /// Handle for the sink run task.
    run_task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl ReportSink {
    /// Creates a sink writing to the configured output.
    pub fn new(cfg: &Config, health: Arc<HealthMetrics>) -> Result<Self> {
        let output: Output = if cfg.report.output == "-" {
            Box::new(BufWriter::new(std::io::stdout()))
        } else {
            let file = std::fs::File::create(&cfg.report.output)
                .with_context(|| format!("creating report output {}", cfg.report.output))?;
            Box::new(BufWriter::new(file))
        };
        Self::with_output(cfg, health, output)
    }

    /// Creates a sink writing to `output`.
    pub fn with_output(cfg: &Config, health: Arc<HealthMetrics>, output: Output) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel(cfg.input.channel_size);
        let clock: Arc<dyn Clock> = match cfg.input.clock {
            ClockSource::Trace => Arc::new(ManualClock::new(0)),
            ClockSource::Monotonic => Arc::new(MonotonicClock),
        };

        Ok(Self {
            report: cfg.report.clone(),
            settings: cfg.engine_settings()?,
            flow_idle_horizon: cfg.limits.flow_idle_horizon,
            clock,
            health,
            output: Some(output),
            sender: EventSender::new(event_tx, cfg.input.overflow),
            event_rx: Some(event_rx),
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    /// Waits for the sink run task to finish.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "report sink task join failed");
            }
        }
    }
}

/// State owned by the run task.
struct ReportLoop {
    engine: Engine,
    reporter: Reporter<Output>,
    clock: Arc<dyn Clock>,
    health: Arc<HealthMetrics>,
    sender: EventSender,
    horizon_ns: u64,
}

impl ReportLoop {
    fn process(&mut self, event: &ParsedEvent) {
        self.clock.observe_event_time(event.raw.timestamp_ns);
        self.health.events_received.inc();
        self.engine.process(event);
    }

    fn tick(&mut self) {
        self.engine.sweep_idle(self.clock.now_ns(), self.horizon_ns);
        self.flush();
    }

    /// Write the current window and fold its counters into the metrics.
    fn flush(&mut self) -> usize {
        let started = Instant::now();
        let report = self.engine.flush();
        let rows = report.rows.len();
        let histograms = report.histograms.len();

        let written = match self.reporter.write_window(&report) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "report write failed");
                0
            }
        };
        self.health
            .flush_duration
            .observe(started.elapsed().as_secs_f64());
        self.health.report_flushes.inc();

        let counts = self.engine.take_counts();
        let dropped = self.sender.take_dropped();
        self.health.record_engine(&counts);
        self.health.events_dropped.inc_by(dropped as f64);
        self.health
            .flows_in_flight
            .set(self.engine.in_flight() as f64);
        self.health.open_scopes.set(self.engine.open_scopes() as f64);

        debug!(
            rows,
            histograms,
            written,
            finalized = counts.flows.finalized,
            accepted = counts.filter.accepted,
            in_flight = self.engine.in_flight(),
            queued = self.sender.queued(),
            "report window"
        );
        warn_on_loss(&counts, dropped);

        rows
    }

    fn finish(&mut self) {
        let rows = self.flush();
        let (flows, scopes) = self.engine.discard_in_flight();
        info!(
            rows,
            discarded_flows = flows,
            discarded_scopes = scopes,
            "final flush"
        );
    }
}

fn warn_on_loss(counts: &EngineCounts, events_dropped: u64) {
    let lost = counts.flows.evicted
        + counts.histogram_groups_dropped
        + counts.accumulator.dropped_begins
        + counts.rows_dropped
        + events_dropped;
    if lost > 0 {
        warn!(
            evicted = counts.flows.evicted,
            histogram_groups_dropped = counts.histogram_groups_dropped,
            contexts_dropped = counts.accumulator.dropped_begins,
            rows_dropped = counts.rows_dropped,
            events_dropped,
            "resource limits reached during window"
        );
    }
}

impl Sink for ReportSink {
    fn name(&self) -> &str {
        "report"
    }

    async fn start(&mut self, ctx: tokio_util::sync::CancellationToken) -> Result<()> {
        let mut event_rx = self
            .event_rx
            .take()
            .context("report sink started more than once")?;
        let output = self
            .output
            .take()
            .context("report sink started more than once")?;

        let mut state = ReportLoop {
            engine: Engine::new(self.settings.clone()),
            reporter: Reporter::new(
                output,
                self.report.format,
                self.report.rows,
                self.report.histograms,
            ),
            clock: Arc::clone(&self.clock),
            health: Arc::clone(&self.health),
            sender: self.sender.clone(),
            horizon_ns: u64::try_from(self.flow_idle_horizon.as_nanos()).unwrap_or(u64::MAX),
        };
        let interval = self.report.interval;

        let run_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        // Events already queued belong to the final window.
                        while let Ok(event) = event_rx.try_recv() {
                            state.process(&event);
                        }
                        state.finish();
                        return;
                    }

                    Some(event) = event_rx.recv() => {
                        state.process(&event);

                        // Drain up to BATCH_SIZE-1 more events without blocking.
                        for _ in 0..BATCH_SIZE - 1 {
                            match event_rx.try_recv() {
                                Ok(event) => state.process(&event),
                                Err(_) => break,
                            }
                        }
                    }

                    _ = ticker.tick() => {
                        state.tick();
                    }
                }
            }
        });
        *self.run_task.lock().await = Some(run_task);

        info!(
            interval = ?self.report.interval,
            format = ?self.report.format,
            output = %self.report.output,
            pipelines = self.settings.pipelines.len(),
            reclaim = self.settings.reclaim,
            "report sink started"
        );

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // Final flush handled in the spawned task via cancellation token.
        Ok(())
    }

    fn event_sender(&self) -> EventSender {
        self.sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::correlate::interval::ExecutionContextId;
    use crate::correlate::key::FlowKey;
    use crate::correlate::stage::Pipeline;
    use crate::tracer::event::{Event, EventType, FlowEvent, TypedEvent};

    /// Writer whose contents stay readable after the sink takes it.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn block(ts: u64, event_type: EventType, sector: u64) -> ParsedEvent {
        ParsedEvent {
            raw: Event {
                timestamp_ns: ts,
                ctx: ExecutionContextId(1),
                event_type,
            },
            typed: TypedEvent::Flow(FlowEvent {
                pipeline: Pipeline::BlockIo,
                stage: event_type.stage().expect("flow probe"),
                key: FlowKey::object(8, sector, 0),
            }),
        }
    }

    fn sink(cfg: &Config) -> (ReportSink, SharedBuf, Arc<HealthMetrics>) {
        let buf = SharedBuf::default();
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let sink = ReportSink::with_output(cfg, Arc::clone(&health), Box::new(buf.clone()))
            .expect("sink");
        (sink, buf, health)
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queued_events() {
        let cfg = Config::default();
        let (mut sink, buf, health) = sink(&cfg);
        let sender = sink.event_sender();

        // Queue before the loop runs so the events are drained on cancel.
        sender.deliver(block(100, EventType::BlockIssue, 1)).await;
        sender.deliver(block(700, EventType::BlockComplete, 1)).await;
        sender.deliver(block(800, EventType::BlockIssue, 2)).await;

        let ctx = CancellationToken::new();
        ctx.cancel();
        sink.start(ctx).await.expect("start");
        sink.wait_for_shutdown().await;

        let out = buf.text();
        assert!(out.contains("block_io"), "{out}");
        assert!(out.contains("dev 8 sector 1 R"), "{out}");
        assert!(out.contains("block_io total (ns)"), "{out}");
        assert!(!out.contains("sector 2 "), "{out}");

        assert_eq!(health.events_received.get() as u64, 3);
        assert_eq!(health.flows_accepted.get() as u64, 1);
        assert_eq!(health.report_flushes.get() as u64, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_writes_window() {
        let cfg = Config::default();
        let (mut sink, buf, health) = sink(&cfg);
        let sender = sink.event_sender();

        let ctx = CancellationToken::new();
        sink.start(ctx.clone()).await.expect("start");

        sender.deliver(block(100, EventType::BlockIssue, 1)).await;
        sender.deliver(block(300, EventType::BlockComplete, 1)).await;
        tokio::time::sleep(cfg.report.interval + Duration::from_millis(10)).await;

        assert!(buf.text().contains("dev 8 sector 1 R"));
        assert!(health.report_flushes.get() as u64 >= 1);

        ctx.cancel();
        sink.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_trace_clock_drives_idle_sweep() {
        let mut cfg = Config::default();
        cfg.limits.flow_idle_horizon = Duration::from_nanos(1_000);
        let (mut sink, _buf, health) = sink(&cfg);
        let sender = sink.event_sender();

        let ctx = CancellationToken::new();
        sink.start(ctx.clone()).await.expect("start");

        sender.deliver(block(100, EventType::BlockIssue, 1)).await;
        sender.deliver(block(50_000, EventType::BlockIssue, 2)).await;
        tokio::time::sleep(cfg.report.interval + Duration::from_millis(10)).await;

        assert_eq!(health.flows_swept.get() as u64, 1);
        assert_eq!(health.flows_in_flight.get() as u64, 1);

        ctx.cancel();
        sink.wait_for_shutdown().await;
    }
}
