use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::sink::report::ReportSink;
use crate::sink::Sink;
use crate::tracer::fields::{
    detect_kernel_release, select_accessor, FieldAccessor, KernelRelease, CURRENT_LAYOUT_SINCE,
};
use crate::tracer::parse::ParseError;
use crate::tracer::replay::{ReplayInput, ReplaySource};
use crate::tracer::stats::EventStats;
use crate::tracer::EventSource;

/// How often ingest counters are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Agent wires the event source, the report sink and health metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    sink: Option<ReportSink>,
    source: Option<ReplaySource>,
    ingest_stats: Arc<EventStats>,
    cancel: CancellationToken,
    /// Cancelled when the source runs out of input.
    finished: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            sink: None,
            source: None,
            ingest_stats: Arc::new(EventStats::new()),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        })
    }

    /// Token cancelled once the input is exhausted.
    pub fn finished(&self) -> CancellationToken {
        self.finished.clone()
    }

    /// Start all components and begin processing.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health metrics server, when configured.
        if self.health.is_enabled() {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 2. Field layout for the target kernel.
        let release = self.resolve_kernel_release()?;
        let fields: Arc<dyn FieldAccessor> = Arc::from(select_accessor(release));
        info!(
            kernel_release = %release,
            layout = fields.name(),
            "selected probe field layout"
        );

        // 3. Report sink.
        let mut sink =
            ReportSink::new(&self.cfg, Arc::clone(&self.health)).context("creating report sink")?;
        sink.start(self.cancel.child_token())
            .await
            .context("starting report sink")?;
        info!(sink = sink.name(), "sink started");

        // 4. Event source feeding the sink.
        let mut source = ReplaySource::new(
            ReplayInput::from_arg(&self.cfg.input.path),
            fields,
            Arc::clone(&self.ingest_stats),
        );

        let health_err = Arc::clone(&self.health);
        source.on_error(Box::new(move |err| {
            match err.downcast_ref::<ParseError>() {
                Some(parse) => {
                    health_err
                        .event_parse_errors
                        .with_label_values(&[parse.kind()])
                        .inc();
                    debug!(error = %format!("{err:#}"), "skipping malformed record");
                }
                None => error!(error = %format!("{err:#}"), "event source error"),
            }
        }));

        let finished = self.finished.clone();
        source.on_exhausted(Box::new(move || finished.cancel()));

        source
            .start(self.cancel.child_token(), sink.event_sender())
            .await
            .with_context(|| format!("starting {} source", source.name()))?;

        self.sink = Some(sink);
        self.source = Some(source);

        // 5. Background reporters.
        self.spawn_event_stats_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        if let Some(source) = &mut self.source {
            if let Err(e) = source.stop().await {
                error!(error = %e, "error stopping event source");
            }
        }

        // Wait for the sink to drain its channel and write the final report.
        if let Some(sink) = &mut self.sink {
            sink.wait_for_shutdown().await;
            if let Err(e) = sink.stop().await {
                error!(error = %e, "error stopping sink");
            }
        }

        log_ingest(&self.ingest_stats, &self.health);

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    fn resolve_kernel_release(&self) -> Result<KernelRelease> {
        if let Some(release) = self.cfg.kernel_release()? {
            return Ok(release);
        }
        match detect_kernel_release() {
            Ok(release) => Ok(release),
            Err(e) => {
                warn!(
                    error = %format!("{e:#}"),
                    fallback = %CURRENT_LAYOUT_SINCE,
                    "kernel release detection failed, assuming current layout"
                );
                Ok(CURRENT_LAYOUT_SINCE)
            }
        }
    }

    /// Spawn background event stats reporter.
    fn spawn_event_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let ingest_stats = Arc::clone(&self.ingest_stats);
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => log_ingest(&ingest_stats, &health),
                }
            }
        });
    }
}

fn log_ingest(stats: &EventStats, health: &HealthMetrics) {
    let snapshot = stats.snapshot();
    if snapshot.is_empty() {
        return;
    }
    health.record_ingest(&snapshot);

    info!(
        events = snapshot.events(),
        parse_errors = snapshot.parse_errors,
        "ingest stats"
    );
    for (event_type, count) in &snapshot.by_probe {
        debug!(event_type = %event_type, count, "  by probe");
    }
}
