use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::correlate::engine::EngineSettings;
use crate::correlate::filter::KeyFilter;
use crate::correlate::stage::Pipeline;
use crate::tracer::fields::KernelRelease;
use crate::tracer::OverflowPolicy;

/// Top-level configuration for flowscope.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Force debug logging regardless of `log_level`.
    #[serde(default)]
    pub verbose: bool,

    /// Kernel release used to pick the probe field layout. Detected from
    /// /proc when empty.
    #[serde(default)]
    pub kernel_release: String,

    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub pipelines: PipelinesConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub report: ReportConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Trace input configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Trace file to replay, or "-" for stdin. Default: "-".
    #[serde(default = "default_stdio")]
    pub path: String,

    /// Time base for idle sweeps. Default: trace.
    #[serde(default)]
    pub clock: ClockSource,

    /// Capacity of the channel between the reader and the processing task.
    /// Default: 65536.
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,

    /// Behaviour when the channel is full. Default: block.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Time base for housekeeping decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// Follow event timestamps. Suited to replays.
    #[default]
    Trace,
    /// `CLOCK_MONOTONIC`. Suited to live input.
    Monotonic,
}

/// Which correlations to run.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelinesConfig {
    /// RDS request and response flows. Default: true.
    #[serde(default = "default_true")]
    pub rds: bool,

    /// Block request issue to completion. Default: true.
    #[serde(default = "default_true")]
    pub block_io: bool,

    /// Network buffer queue to transmit. Default: true.
    #[serde(default = "default_true")]
    pub net_xmit: bool,

    /// Connection congestion set to clear. Default: true.
    #[serde(default = "default_true")]
    pub congestion: bool,

    /// Memory reclaim scopes. Default: true.
    #[serde(default = "default_true")]
    pub reclaim: bool,
}

/// Row filtering configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    /// Records shorter than this are not reported. Default: 0.
    #[serde(default, with = "humantime_serde")]
    pub min_duration: Duration,

    /// Only report address-keyed flows touching this IPv4 address.
    #[serde(default)]
    pub address: Option<String>,

    /// Only report address-keyed flows touching this port.
    #[serde(default)]
    pub port: Option<u16>,
}

/// Report output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Report period. Default: 1s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Output format. Default: text.
    #[serde(default)]
    pub format: ReportFormat,

    /// Output file, or "-" for stdout. Default: "-".
    #[serde(default = "default_stdio")]
    pub output: String,

    /// Print one row per accepted record. Default: true.
    #[serde(default = "default_true")]
    pub rows: bool,

    /// Print histogram tables. Default: true.
    #[serde(default = "default_true")]
    pub histograms: bool,

    /// Histogram each adjacent stage pair as well as the total. Default: false.
    #[serde(default)]
    pub segment_histograms: bool,
}

/// Report output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

/// Resource bounds. Exceeding any of them is counted, never fatal.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// In-flight flows per pipeline. Default: 65536.
    #[serde(default = "default_stage_table_capacity")]
    pub stage_table_capacity: usize,

    /// Flows untouched for this long are dropped. Default: 30s.
    #[serde(default = "default_flow_idle_horizon", with = "humantime_serde")]
    pub flow_idle_horizon: Duration,

    /// Distinct histogram groups, 0 for unbounded. Default: 1024.
    #[serde(default = "default_max_histogram_groups")]
    pub max_histogram_groups: usize,

    /// Concurrently open reclaim scopes. Default: 4096.
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,

    /// Rows buffered between reports. Default: 65536.
    #[serde(default = "default_max_pending_rows")]
    pub max_pending_rows: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address for the metrics HTTP server. Disabled when empty.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stdio() -> String {
    "-".to_string()
}

fn default_channel_size() -> usize {
    65_536
}

fn default_true() -> bool {
    true
}

fn default_report_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_stage_table_capacity() -> usize {
    65_536
}

fn default_flow_idle_horizon() -> Duration {
    Duration::from_secs(30)
}

fn default_max_histogram_groups() -> usize {
    1_024
}

fn default_max_contexts() -> usize {
    4_096
}

fn default_max_pending_rows() -> usize {
    65_536
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            verbose: false,
            kernel_release: String::new(),
            input: InputConfig::default(),
            pipelines: PipelinesConfig::default(),
            filter: FilterConfig::default(),
            report: ReportConfig::default(),
            limits: LimitsConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: default_stdio(),
            clock: ClockSource::default(),
            channel_size: default_channel_size(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            rds: true,
            block_io: true,
            net_xmit: true,
            congestion: true,
            reclaim: true,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: default_report_interval(),
            format: ReportFormat::default(),
            output: default_stdio(),
            rows: true,
            histograms: true,
            segment_histograms: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            stage_table_capacity: default_stage_table_capacity(),
            flow_idle_horizon: default_flow_idle_horizon(),
            max_histogram_groups: default_max_histogram_groups(),
            max_contexts: default_max_contexts(),
            max_pending_rows: default_max_pending_rows(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => bail!("invalid log_level: {other}"),
        }

        if !self.kernel_release.is_empty() {
            self.kernel_release
                .parse::<KernelRelease>()
                .context("invalid kernel_release")?;
        }

        if self.input.path.is_empty() {
            bail!("input.path is required");
        }

        if self.input.channel_size == 0 {
            bail!("input.channel_size must be positive");
        }

        if self.report.interval.is_zero() {
            bail!("report.interval must be positive");
        }

        if self.report.output.is_empty() {
            bail!("report.output is required");
        }

        if u64::try_from(self.filter.min_duration.as_nanos()).is_err() {
            bail!("filter.min_duration is too large");
        }

        if let Some(addr) = &self.filter.address {
            addr.parse::<Ipv4Addr>()
                .with_context(|| format!("invalid filter.address {addr:?}"))?;
        }

        if self.filter.port == Some(0) {
            bail!("filter.port must be positive");
        }

        if self.limits.stage_table_capacity == 0 {
            bail!("limits.stage_table_capacity must be positive");
        }

        if self.limits.flow_idle_horizon.is_zero() {
            bail!("limits.flow_idle_horizon must be positive");
        }

        if self.limits.max_contexts == 0 {
            bail!("limits.max_contexts must be positive");
        }

        if self.limits.max_pending_rows == 0 {
            bail!("limits.max_pending_rows must be positive");
        }

        if self.pipelines.enabled().is_empty() && !self.pipelines.reclaim {
            bail!("at least one pipeline must be enabled");
        }

        Ok(())
    }

    /// Kernel release override, if configured.
    pub fn kernel_release(&self) -> Result<Option<KernelRelease>> {
        if self.kernel_release.is_empty() {
            return Ok(None);
        }
        self.kernel_release
            .parse()
            .map(Some)
            .context("invalid kernel_release")
    }

    /// Effective log filter, honouring `verbose`.
    pub fn effective_log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }

    /// Address/port filter for address-keyed flows.
    pub fn key_filter(&self) -> Result<KeyFilter> {
        let address = self
            .filter
            .address
            .as_deref()
            .map(str::parse::<Ipv4Addr>)
            .transpose()
            .context("invalid filter.address")?;

        Ok(KeyFilter {
            address,
            port: self.filter.port,
        })
    }

    /// Settings for the correlation engine.
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        Ok(EngineSettings {
            pipelines: self.pipelines.enabled(),
            reclaim: self.pipelines.reclaim,
            min_duration_ns: u64::try_from(self.filter.min_duration.as_nanos())
                .context("filter.min_duration is too large")?,
            key_filter: self.key_filter()?,
            stage_table_capacity: self.limits.stage_table_capacity,
            max_histogram_groups: self.limits.max_histogram_groups,
            max_contexts: self.limits.max_contexts,
            max_pending_rows: self.limits.max_pending_rows,
            segment_histograms: self.report.segment_histograms,
        })
    }
}

impl PipelinesConfig {
    /// Correlated pipelines switched on.
    pub fn enabled(&self) -> Vec<Pipeline> {
        Pipeline::all()
            .iter()
            .copied()
            .filter(|p| match p {
                Pipeline::RdsRequest | Pipeline::RdsResponse => self.rds,
                Pipeline::BlockIo => self.block_io,
                Pipeline::NetXmit => self.net_xmit,
                Pipeline::Congestion => self.congestion,
            })
            .collect()
    }
}
