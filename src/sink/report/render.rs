use std::collections::BTreeMap;
use std::io::Write;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::ReportFormat;
use crate::correlate::aggregator::GroupKey;
use crate::correlate::correlator::FinalizedRecord;
use crate::correlate::engine::{Row, WindowReport};
use crate::correlate::histogram::{bucket_lower_bound, NUM_BUCKETS};
use crate::correlate::interval::{ReclaimSummary, SubMetric};
use crate::correlate::key::FlowKey;
use crate::correlate::stage::{Endpoints, Protocol, Stage};

/// Width of the `@` bar in text histograms.
const BAR_WIDTH: u64 = 40;

/// Writes report windows in the configured format.
pub struct Reporter<W: Write> {
    out: W,
    format: ReportFormat,
    rows: bool,
    histograms: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, format: ReportFormat, rows: bool, histograms: bool) -> Self {
        Self {
            out,
            format,
            rows,
            histograms,
        }
    }

    /// Write one window and flush the writer. Returns the number of rows
    /// and histograms written; text column headers are not counted.
    pub fn write_window(&mut self, report: &WindowReport) -> Result<usize> {
        let mut written = 0;

        if self.rows {
            let mut last_pipeline = None;
            for row in &report.rows {
                match self.format {
                    ReportFormat::Text => {
                        if let Row::Flow(record) = row {
                            if last_pipeline != Some(record.protocol.name) {
                                writeln!(self.out, "{}", format_flow_header(record.protocol))
                                    .context("writing report header")?;
                                last_pipeline = Some(record.protocol.name);
                            }
                        }
                        self.text_row(row)?
                    }
                    ReportFormat::Json => self.json_line(&JsonLine::from_row(row))?,
                }
                written += 1;
            }
        }

        if self.histograms {
            for (group, buckets) in &report.histograms {
                match self.format {
                    ReportFormat::Text => self.text_histogram(group, buckets)?,
                    ReportFormat::Json => {
                        self.json_line(&JsonLine::from_histogram(group, buckets))?
                    }
                }
                written += 1;
            }
        }

        self.out.flush().context("flushing report output")?;
        Ok(written)
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn text_row(&mut self, row: &Row) -> Result<()> {
        let line = match row {
            Row::Flow(record) => format_flow(record),
            Row::Reclaim(summary) => format_reclaim(summary),
        };
        writeln!(self.out, "{line}").context("writing report row")
    }

    fn text_histogram(&mut self, group: &GroupKey, buckets: &[(usize, u64)]) -> Result<()> {
        let table = format_quantize(group, buckets);
        self.out
            .write_all(table.as_bytes())
            .context("writing histogram")
    }

    fn json_line(&mut self, line: &JsonLine<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, line).context("encoding report line")?;
        self.out.write_all(b"\n").context("writing report line")
    }
}

fn format_endpoints(endpoints: Endpoints, key: &FlowKey) -> String {
    match endpoints {
        Endpoints::Inet => format!(
            "{}:{} > {}:{} tos {}",
            ipv4(key.src_id),
            key.src_port,
            ipv4(key.dst_id),
            key.dst_port,
            key.class
        ),
        Endpoints::Device => format!(
            "dev {} sector {} {}",
            key.src_id,
            key.dst_id,
            if key.class == 0 { "R" } else { "W" }
        ),
        Endpoints::Buffer => format!("skb {:#x}", key.src_id),
    }
}

fn ipv4(id: u64) -> Ipv4Addr {
    Ipv4Addr::from(u32::try_from(id).unwrap_or(u32::MAX))
}

fn segment_label(from: Stage, to: Stage) -> String {
    format!("{from}->{to}")
}

/// Column width for one pipeline: wide enough for every segment label.
fn column_width(protocol: &Protocol) -> usize {
    protocol
        .segments()
        .map(|(from, to)| segment_label(from, to).len())
        .max()
        .unwrap_or(0)
        .max(10)
}

/// Column header for [`format_flow`] rows of one pipeline.
pub fn format_flow_header(protocol: &Protocol) -> String {
    let width = column_width(protocol);
    let labels = protocol
        .segments()
        .map(|(from, to)| format!("{:>width$}", segment_label(from, to)))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{:<13} {:<44} {} {:>width$}", protocol.name, "endpoints", labels, "total")
}

/// `pipeline  endpoints  d1 d2 ... total`, missing values as -1.
pub fn format_flow(record: &FinalizedRecord) -> String {
    let width = column_width(record.protocol);
    let deltas = record
        .deltas()
        .iter()
        .map(|d| format!("{d:>width$}"))
        .collect::<Vec<_>>()
        .join(" ");
    let mut line = format!(
        "{:<13} {:<44} {} {:>width$}",
        record.protocol.name,
        format_endpoints(record.protocol.endpoints, &record.key),
        deltas,
        record.total
    );
    if record.out_of_order {
        line.push_str(" reordered");
    }
    line
}

pub fn format_reclaim(summary: &ReclaimSummary) -> String {
    let counters = SubMetric::all()
        .iter()
        .map(|m| format!("{}={}", m.as_str(), summary.get(*m)))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{:<13} ctx {:<10} {:<8} {:>10} {}",
        "reclaim",
        summary.ctx,
        summary.scope.as_str(),
        summary.duration_ns,
        counters
    )
}

/// Quantized distribution table with one row per power-of-two bucket,
/// padded by an empty bucket on each side.
pub fn format_quantize(group: &GroupKey, buckets: &[(usize, u64)]) -> String {
    let mut out = format!("\n  {group} (ns)\n");
    let (Some(&(lo, _)), Some(&(hi, _))) = (buckets.first(), buckets.last()) else {
        return out;
    };

    let total: u64 = buckets.iter().map(|(_, c)| c).sum();
    let first = lo.saturating_sub(1);
    let last = (hi + 1).min(NUM_BUCKETS - 1);
    let counts: BTreeMap<usize, u64> = buckets.iter().copied().collect();

    out.push_str(&format!(
        "{:>16}  {:-^width$} count\n",
        "value",
        " Distribution ",
        width = BAR_WIDTH as usize
    ));
    for bucket in first..=last {
        let count = counts.get(&bucket).copied().unwrap_or(0);
        let bar = if total == 0 {
            0
        } else {
            (count * BAR_WIDTH + total / 2) / total
        };
        out.push_str(&format!(
            "{:>16} |{:<width$} {}\n",
            bucket_lower_bound(bucket),
            "@".repeat(bar as usize),
            count,
            width = BAR_WIDTH as usize
        ));
    }
    out
}

#[derive(Serialize)]
struct JsonKey {
    src: String,
    dst: String,
    class: u32,
    src_port: u32,
    dst_port: u32,
}

impl JsonKey {
    fn new(endpoints: Endpoints, key: &FlowKey) -> Self {
        let (src, dst) = match endpoints {
            Endpoints::Inet => (ipv4(key.src_id).to_string(), ipv4(key.dst_id).to_string()),
            Endpoints::Device => (key.src_id.to_string(), key.dst_id.to_string()),
            Endpoints::Buffer => (format!("{:#x}", key.src_id), key.dst_id.to_string()),
        };
        Self {
            src,
            dst,
            class: key.class,
            src_port: key.src_port,
            dst_port: key.dst_port,
        }
    }
}

#[derive(Serialize)]
struct JsonBucket {
    lower: u64,
    count: u64,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonLine<'a> {
    Flow {
        pipeline: &'static str,
        key: JsonKey,
        stamps: &'a [i64],
        deltas: &'a [i64],
        total: i64,
        out_of_order: bool,
    },
    Reclaim {
        ctx: u64,
        scope: &'static str,
        start_ns: u64,
        end_ns: u64,
        duration_ns: u64,
        counters: BTreeMap<&'static str, u64>,
    },
    Histogram {
        pipeline: &'static str,
        series: String,
        count: u64,
        buckets: Vec<JsonBucket>,
    },
}

impl<'a> JsonLine<'a> {
    fn from_row(row: &'a Row) -> Self {
        match row {
            Row::Flow(record) => Self::Flow {
                pipeline: record.protocol.name,
                key: JsonKey::new(record.protocol.endpoints, &record.key),
                stamps: record.stamps(),
                deltas: record.deltas(),
                total: record.total,
                out_of_order: record.out_of_order,
            },
            Row::Reclaim(summary) => Self::Reclaim {
                ctx: summary.ctx.0,
                scope: summary.scope.as_str(),
                start_ns: summary.start_ns,
                end_ns: summary.end_ns,
                duration_ns: summary.duration_ns,
                counters: SubMetric::all()
                    .iter()
                    .map(|m| (m.as_str(), summary.get(*m)))
                    .collect(),
            },
        }
    }

    fn from_histogram(group: &GroupKey, buckets: &[(usize, u64)]) -> Self {
        Self::Histogram {
            pipeline: group.pipeline,
            series: group.series.to_string(),
            count: buckets.iter().map(|(_, c)| c).sum(),
            buckets: buckets
                .iter()
                .map(|&(bucket, count)| JsonBucket {
                    lower: bucket_lower_bound(bucket),
                    count,
                })
                .collect(),
        }
    }
}
