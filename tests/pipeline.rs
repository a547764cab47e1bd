use std::net::Ipv4Addr;

use flowscope::config::ReportFormat;
use flowscope::correlate::aggregator::{GroupKey, Series};
use flowscope::correlate::filter::KeyFilter;
use flowscope::correlate::histogram::quantize;
use flowscope::correlate::interval::{ExecutionContextId, ScopeKind, SubMetric};
use flowscope::correlate::key::FlowKey;
use flowscope::correlate::{Engine, EngineSettings, Row, WindowReport};
use flowscope::sink::report::render::Reporter;
use flowscope::tracer::fields::CurrentLayout;
use flowscope::tracer::parse::{parse_event, ParseError};

/// A recorded session mixing every event family, one malformed record, an
/// orphaned terminal and a block request that never completes.
const TRACE: &str = "\
# host-a, 6.1.0
100 3 reclaim_begin scope=direct
200 3 lru_shrink anon=4 file=12
300 3 slab_shrink_begin progress=10
400 3 slab_shrink_end progress=25
900 3 reclaim_end
1000 7 rds_send saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634
1200 7 tcp_send saddr=10.0.0.1
1500 7 rds_xmit saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634
2000 1 block_issue dev=8 sector=2048 rwbs=W
2800 1 block_complete dev=8 sector=2048 rwbs=W
3000 2 block_issue dev=8 sector=4096 rwbs=R
4000 7 rds_complete saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634

5000 8 rds_recv saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634
7000 8 rds_deliver saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634
7500 4 net_xmit skb=0xdead
";

/// One RDS exchange: the request and its reply travelling the other way,
/// with the reply's stages landing between the request's.
const EXCHANGE: &str = "\
1000 7 rds_send saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634
1100 9 rds_send saddr=10.0.0.2 daddr=10.0.0.1 tos=0 sport=18634 dport=4000 reply=1
1300 9 rds_xmit saddr=10.0.0.2 daddr=10.0.0.1 tos=0 sport=18634 dport=4000 reply=1
1500 7 rds_xmit saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634
1600 9 rds_complete saddr=10.0.0.2 daddr=10.0.0.1 tos=0 sport=18634 dport=4000 reply=1
2100 10 rds_recv saddr=10.0.0.2 daddr=10.0.0.1 tos=0 sport=18634 dport=4000 reply=1
2600 10 rds_deliver saddr=10.0.0.2 daddr=10.0.0.1 tos=0 sport=18634 dport=4000 reply=1
4000 7 rds_complete saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634
5000 8 rds_recv saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634
7000 8 rds_deliver saddr=10.0.0.1 daddr=10.0.0.2 tos=0 sport=4000 dport=18634
";

fn replay(settings: EngineSettings) -> (Engine, Vec<ParseError>) {
    replay_trace(TRACE, settings)
}

fn replay_trace(trace: &str, settings: EngineSettings) -> (Engine, Vec<ParseError>) {
    let mut engine = Engine::new(settings);
    let mut errors = Vec::new();
    for line in trace.lines() {
        match parse_event(line, &CurrentLayout) {
            Ok(Some(event)) => engine.process(&event),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }
    (engine, errors)
}

fn histogram<'a>(report: &'a WindowReport, group: GroupKey) -> &'a [(usize, u64)] {
    report
        .histograms
        .iter()
        .find(|(g, _)| *g == group)
        .map(|(_, b)| b.as_slice())
        .unwrap_or_else(|| panic!("no histogram for {group}"))
}

#[test]
fn test_replay_rows_and_histograms() {
    let (mut engine, errors) = replay(EngineSettings::default());

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), "unknown_probe");

    let report = engine.flush();
    assert_eq!(report.rows.len(), 3);

    let Row::Reclaim(summary) = &report.rows[0] else {
        panic!("expected reclaim row first");
    };
    assert_eq!(summary.ctx, ExecutionContextId(3));
    assert_eq!(summary.scope, ScopeKind::Direct);
    assert_eq!(summary.duration_ns, 800);
    assert_eq!(summary.get(SubMetric::AnonPages), 4);
    assert_eq!(summary.get(SubMetric::FilePages), 12);
    assert_eq!(summary.get(SubMetric::SlabObjects), 15);
    assert_eq!(summary.get(SubMetric::Buffers), 0);

    let Row::Flow(block) = &report.rows[1] else {
        panic!("expected block row second");
    };
    assert_eq!(block.protocol.name, "block_io");
    assert_eq!(block.key, FlowKey::object(8, 2048, 1));
    assert_eq!(block.total, 800);

    let Row::Flow(rds) = &report.rows[2] else {
        panic!("expected rds row third");
    };
    assert_eq!(rds.protocol.name, "rds_request");
    assert_eq!(rds.stamps(), &[1000, 1500, 4000, 5000, 7000]);
    assert_eq!(rds.deltas(), &[500, 2500, 1000, 2000]);
    assert_eq!(rds.total, 6000);
    assert!(!rds.out_of_order);

    assert_eq!(report.histograms.len(), 3);
    assert_eq!(
        histogram(&report, GroupKey::new("block_io", Series::Total)),
        &[(quantize(800), 1)]
    );
    assert_eq!(
        histogram(&report, GroupKey::new("rds_request", Series::Total)),
        &[(quantize(6000), 1)]
    );
    assert_eq!(
        histogram(&report, GroupKey::new("reclaim", Series::Scope(ScopeKind::Direct))),
        &[(quantize(800), 1)]
    );

    let counts = engine.take_counts();
    assert_eq!(counts.flows.finalized, 2);
    assert_eq!(counts.flows.orphaned, 1);
    assert_eq!(counts.filter.accepted, 3);

    assert_eq!(engine.in_flight(), 1);
    assert_eq!(engine.discard_in_flight(), (1, 0));
    assert!(engine.flush().is_empty());
}

#[test]
fn test_request_and_reply_correlate_independently() {
    let (mut engine, errors) = replay_trace(EXCHANGE, EngineSettings::default());
    assert!(errors.is_empty());

    let report = engine.flush();
    assert_eq!(report.rows.len(), 2);

    let Row::Flow(reply) = &report.rows[0] else {
        panic!("expected reply row first");
    };
    assert_eq!(reply.protocol.name, "rds_response");
    assert_eq!(reply.stamps(), &[1100, 1300, 1600, 2100, 2600]);
    assert_eq!(reply.deltas(), &[200, 300, 500, 500]);
    assert_eq!(reply.total, 1500);
    assert!(!reply.out_of_order);

    let Row::Flow(request) = &report.rows[1] else {
        panic!("expected request row second");
    };
    assert_eq!(request.protocol.name, "rds_request");
    assert_eq!(request.stamps(), &[1000, 1500, 4000, 5000, 7000]);
    assert_eq!(request.deltas(), &[500, 2500, 1000, 2000]);
    assert_eq!(request.total, 6000);
    assert!(!request.out_of_order);

    // Both directions name the connection the same way.
    assert_eq!(reply.key, request.key);

    assert_eq!(report.histograms.len(), 2);
    assert_eq!(
        histogram(&report, GroupKey::new("rds_response", Series::Total)),
        &[(quantize(1500), 1)]
    );
    assert_eq!(
        histogram(&report, GroupKey::new("rds_request", Series::Total)),
        &[(quantize(6000), 1)]
    );

    let counts = engine.take_counts();
    assert_eq!(counts.flows.finalized, 2);
    assert_eq!(counts.flows.orphaned, 0);
    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn test_min_duration_and_key_filter() {
    let (mut engine, _) = replay(EngineSettings {
        min_duration_ns: 1_000,
        ..Default::default()
    });
    let report = engine.flush();
    assert_eq!(report.rows.len(), 1);
    assert!(matches!(&report.rows[0], Row::Flow(r) if r.protocol.name == "rds_request"));
    assert_eq!(report.histograms.len(), 1);

    let counts = engine.take_counts();
    assert_eq!(counts.filter.accepted, 1);
    assert_eq!(counts.filter.rejected, 2);

    let (mut engine, _) = replay(EngineSettings {
        key_filter: KeyFilter {
            address: Some(Ipv4Addr::new(10, 0, 0, 9)),
            port: None,
        },
        ..Default::default()
    });
    let report = engine.flush();
    // Device-keyed and reclaim rows are not subject to the address filter.
    assert_eq!(report.rows.len(), 2);
    assert!(report
        .rows
        .iter()
        .all(|r| !matches!(r, Row::Flow(f) if f.protocol.name == "rds_request")));
    assert_eq!(engine.take_counts().key_filtered, 5);
}

#[test]
fn test_segment_histograms() {
    let (mut engine, _) = replay(EngineSettings {
        segment_histograms: true,
        reclaim: false,
        ..Default::default()
    });
    let report = engine.flush();

    // One row per flow, no reclaim row.
    assert_eq!(report.rows.len(), 2);
    // block_io: total + 1 segment, rds_request: total + 4 segments.
    assert_eq!(report.histograms.len(), 7);
    assert_eq!(engine.open_scopes(), 0);
}

#[test]
fn test_json_report() {
    let (mut engine, _) = replay(EngineSettings::default());
    let report = engine.flush();

    let mut reporter = Reporter::new(Vec::new(), ReportFormat::Json, true, true);
    assert_eq!(reporter.write_window(&report).expect("write"), 6);

    let out = String::from_utf8(reporter.into_inner()).expect("utf8");
    let lines: Vec<serde_json::Value> = out
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 6);

    assert_eq!(lines[0]["kind"], "reclaim");
    assert_eq!(lines[0]["counters"]["slab"], 15);
    assert_eq!(lines[1]["kind"], "flow");
    assert_eq!(lines[1]["key"]["src"], "8");
    assert_eq!(lines[2]["pipeline"], "rds_request");
    assert_eq!(lines[2]["key"]["src"], "10.0.0.1");
    assert_eq!(lines[2]["key"]["dst_port"], 18634);
    assert_eq!(lines[2]["total"], 6000);

    let histograms: Vec<_> = lines.iter().filter(|l| l["kind"] == "histogram").collect();
    assert_eq!(histograms.len(), 3);
    assert!(histograms.iter().all(|h| h["count"] == 1));
}

#[test]
fn test_text_report() {
    let (mut engine, _) = replay(EngineSettings::default());
    let report = engine.flush();

    let mut reporter = Reporter::new(Vec::new(), ReportFormat::Text, true, true);
    reporter.write_window(&report).expect("write");
    let out = String::from_utf8(reporter.into_inner()).expect("utf8");

    assert!(out.contains("10.0.0.1:4000 > 10.0.0.2:18634"));
    assert!(out.contains("dev 8 sector 2048 W"));
    assert!(out.contains("slab=15"));
    assert!(out.contains("  block_io total (ns)"));
    assert!(out.contains("  reclaim direct (ns)"));

    // Rows only.
    let (mut engine, _) = replay(EngineSettings::default());
    let mut reporter = Reporter::new(Vec::new(), ReportFormat::Text, true, false);
    assert_eq!(reporter.write_window(&engine.flush()).expect("write"), 3);
    let out = String::from_utf8(reporter.into_inner()).expect("utf8");
    assert!(!out.contains("Distribution"));
}
