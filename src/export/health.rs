use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::correlate::engine::EngineCounts;
use crate::tracer::stats::StatsSnapshot;

const NAMESPACE: &str = "flowscope";

/// Prometheus metrics describing the correlator's own health.
///
/// Everything that the core degrades silently (orphans, evictions, caps)
/// surfaces here as a counter.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Input ===
    /// Events handed to the processing task.
    pub events_received: Counter,
    /// Events lost because the processing channel was full or closed.
    pub events_dropped: Counter,
    /// Undecodable input records by error_type.
    pub event_parse_errors: CounterVec,
    /// Decoded events by probe.
    pub events_by_type: CounterVec,

    // === Correlation ===
    pub flows_finalized: Counter,
    /// Terminal stages with no recorded flow.
    pub flows_orphaned: Counter,
    /// Finalized flows whose total was undefined.
    pub flows_incomplete: Counter,
    pub flows_accepted: Counter,
    /// Finalized flows below the minimum duration.
    pub flows_rejected: Counter,
    /// Flows dropped to keep a stage table under capacity.
    pub flows_evicted: Counter,
    /// Flows dropped by the idle sweep.
    pub flows_swept: Counter,
    /// Flows outside the address/port filter.
    pub flows_filtered: Counter,
    pub flows_in_flight: Gauge,

    // === Aggregation ===
    pub histogram_groups_dropped: Counter,
    pub reentrant_begins: Counter,
    /// Reclaim begins refused because the context arena was full.
    pub contexts_dropped: Counter,
    pub open_scopes: Gauge,
    pub rows_dropped: Counter,

    // === Reporting ===
    pub report_flushes: Counter,
    /// Time spent rendering one report window.
    pub flush_duration: Histogram,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn counter_vec(name: &str, help: &str, label: &str) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        &[label],
    )?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = counter(
            "events_received_total",
            "Total events handed to the processing task.",
        )?;
        let events_dropped = counter(
            "events_dropped_total",
            "Total events dropped because the processing channel was unavailable.",
        )?;
        let event_parse_errors = counter_vec(
            "event_parse_errors_total",
            "Total undecodable input records by error type.",
            "error_type",
        )?;
        let events_by_type = counter_vec(
            "events_by_type_total",
            "Total decoded events by probe.",
            "event_type",
        )?;

        let flows_finalized = counter("flows_finalized_total", "Total flows finalized.")?;
        let flows_orphaned = counter(
            "flows_orphaned_total",
            "Total terminal stages seen for keys with no recorded stages.",
        )?;
        let flows_incomplete = counter(
            "flows_incomplete_total",
            "Total finalized flows missing their first stage.",
        )?;
        let flows_accepted = counter(
            "flows_accepted_total",
            "Total records at or above the minimum duration.",
        )?;
        let flows_rejected = counter(
            "flows_rejected_total",
            "Total records below the minimum duration.",
        )?;
        let flows_evicted = counter(
            "flows_evicted_total",
            "Total in-flight flows evicted at stage table capacity.",
        )?;
        let flows_swept = counter(
            "flows_swept_total",
            "Total in-flight flows dropped by the idle sweep.",
        )?;
        let flows_filtered = counter(
            "flows_filtered_total",
            "Total events outside the address/port filter.",
        )?;
        let flows_in_flight = gauge("flows_in_flight", "Flows waiting for their terminal stage.")?;

        let histogram_groups_dropped = counter(
            "histogram_groups_dropped_total",
            "Total histogram adds dropped at the group cap.",
        )?;
        let reentrant_begins = counter(
            "reentrant_begins_total",
            "Total reclaim begins that overwrote an open scope.",
        )?;
        let contexts_dropped = counter(
            "contexts_dropped_total",
            "Total reclaim begins dropped at the context cap.",
        )?;
        let open_scopes = gauge("open_scopes", "Reclaim scopes currently open.")?;
        let rows_dropped = counter(
            "rows_dropped_total",
            "Total accepted rows dropped at the pending row cap.",
        )?;

        let report_flushes = counter("report_flushes_total", "Total report windows written.")?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to render and write one report window.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(event_parse_errors.clone()))?;
        registry.register(Box::new(events_by_type.clone()))?;
        registry.register(Box::new(flows_finalized.clone()))?;
        registry.register(Box::new(flows_orphaned.clone()))?;
        registry.register(Box::new(flows_incomplete.clone()))?;
        registry.register(Box::new(flows_accepted.clone()))?;
        registry.register(Box::new(flows_rejected.clone()))?;
        registry.register(Box::new(flows_evicted.clone()))?;
        registry.register(Box::new(flows_swept.clone()))?;
        registry.register(Box::new(flows_filtered.clone()))?;
        registry.register(Box::new(flows_in_flight.clone()))?;
        registry.register(Box::new(histogram_groups_dropped.clone()))?;
        registry.register(Box::new(reentrant_begins.clone()))?;
        registry.register(Box::new(contexts_dropped.clone()))?;
        registry.register(Box::new(open_scopes.clone()))?;
        registry.register(Box::new(rows_dropped.clone()))?;
        registry.register(Box::new(report_flushes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_dropped,
            event_parse_errors,
            events_by_type,
            flows_finalized,
            flows_orphaned,
            flows_incomplete,
            flows_accepted,
            flows_rejected,
            flows_evicted,
            flows_swept,
            flows_filtered,
            flows_in_flight,
            histogram_groups_dropped,
            reentrant_begins,
            contexts_dropped,
            open_scopes,
            rows_dropped,
            report_flushes,
            flush_duration,
        })
    }

    /// Fold one window of engine counters into the metrics.
    pub fn record_engine(&self, counts: &EngineCounts) {
        self.flows_finalized.inc_by(counts.flows.finalized as f64);
        self.flows_orphaned.inc_by(counts.flows.orphaned as f64);
        self.flows_evicted.inc_by(counts.flows.evicted as f64);
        self.flows_swept.inc_by(counts.flows.swept as f64);
        self.flows_incomplete.inc_by(counts.filter.incomplete as f64);
        self.flows_accepted.inc_by(counts.filter.accepted as f64);
        self.flows_rejected.inc_by(counts.filter.rejected as f64);
        self.flows_filtered.inc_by(counts.key_filtered as f64);
        self.histogram_groups_dropped
            .inc_by(counts.histogram_groups_dropped as f64);
        self.reentrant_begins
            .inc_by(counts.accumulator.reentrant_begins as f64);
        self.contexts_dropped
            .inc_by(counts.accumulator.dropped_begins as f64);
        self.rows_dropped.inc_by(counts.rows_dropped as f64);
    }

    /// Fold ingest counters into the per-probe metrics.
    pub fn record_ingest(&self, snap: &StatsSnapshot) {
        for (event_type, n) in &snap.by_probe {
            self.events_by_type
                .with_label_values(&[event_type.as_str()])
                .inc_by(*n as f64);
        }
    }

    /// Whether an HTTP listener is configured.
    pub fn is_enabled(&self) -> bool {
        !self.addr.is_empty()
    }

    /// Render the registry in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::correlate::correlator::CorrelatorCounts;
    use crate::correlate::filter::FilterCounts;
    use crate::tracer::event::EventType;

    #[test]
    fn test_record_engine_counts() {
        let metrics = HealthMetrics::new("").expect("metrics");
        assert!(!metrics.is_enabled());

        metrics.record_engine(&EngineCounts {
            flows: CorrelatorCounts {
                finalized: 4,
                orphaned: 1,
                evicted: 2,
                ..Default::default()
            },
            filter: FilterCounts {
                accepted: 3,
                rejected: 1,
                incomplete: 0,
            },
            rows_dropped: 5,
            ..Default::default()
        });
        metrics.record_ingest(&StatsSnapshot {
            by_probe: vec![(EventType::BlockIssue, 7)],
            parse_errors: 0,
        });

        assert_eq!(metrics.flows_finalized.get() as u64, 4);
        assert_eq!(metrics.flows_evicted.get() as u64, 2);
        assert_eq!(metrics.rows_dropped.get() as u64, 5);

        let text = metrics.encode().expect("encode");
        assert!(text.contains("flowscope_flows_accepted_total 3"));
        assert!(text.contains("flowscope_events_by_type_total{event_type=\"block_issue\"} 7"));
    }

    #[tokio::test]
    async fn test_server_serves_healthz() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        let addr = metrics.start().await.expect("start");

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        metrics.stop().await.expect("stop");
    }
}
