use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fields::FieldAccessor;
use super::parse::{parse_event, ParseError};
use super::stats::EventStats;
use super::{ErrorHandler, EventSender, EventSource, ExhaustedHandler};

/// Longest record accepted. The rest of a longer line is read and dropped.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Where replayed records are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayInput {
    Stdin,
    File(PathBuf),
}

impl ReplayInput {
    /// `-` selects standard input, anything else is a file path.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            Self::Stdin
        } else {
            Self::File(PathBuf::from(arg))
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Stdin => "stdin".to_string(),
            Self::File(path) => path.display().to_string(),
        }
    }
}

/// Replays a recorded probe trace, one record per line.
///
/// Whether a full channel stalls the reader or drops events is decided by
/// the [`EventSender`]'s overflow policy.
pub struct ReplaySource {
    input: ReplayInput,
    fields: Arc<dyn FieldAccessor>,
    stats: Arc<EventStats>,
    on_error: Option<ErrorHandler>,
    on_exhausted: Option<ExhaustedHandler>,
    task: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn new(input: ReplayInput, fields: Arc<dyn FieldAccessor>, stats: Arc<EventStats>) -> Self {
        Self {
            input,
            fields,
            stats,
            on_error: None,
            on_exhausted: None,
            task: None,
        }
    }
}

/// What ended a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayEnd {
    Exhausted,
    Cancelled,
    ConsumerGone,
}

struct Pump {
    fields: Arc<dyn FieldAccessor>,
    stats: Arc<EventStats>,
    on_error: Option<ErrorHandler>,
}

impl Pump {
    fn report(&self, err: anyhow::Error) {
        match &self.on_error {
            Some(handler) => handler(err),
            None => warn!(error = %err, "replay error"),
        }
    }

    fn reject(&self, err: ParseError, line_no: u64) {
        self.stats.record_parse_error();
        self.report(anyhow::Error::new(err).context(format!("line {line_no}")));
    }

    async fn run<R>(
        &self,
        mut reader: R,
        ctx: &CancellationToken,
        events: &EventSender,
    ) -> Result<ReplayEnd>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        let mut line_no: u64 = 0;

        loop {
            buf.clear();
            let read = tokio::select! {
                _ = ctx.cancelled() => return Ok(ReplayEnd::Cancelled),
                read = read_capped(&mut reader, &mut buf) => read.context("reading trace input")?,
            };
            if read == 0 {
                return Ok(ReplayEnd::Exhausted);
            }
            line_no += 1;

            let line = match decode_line(&buf) {
                Ok(line) => line,
                Err(e) => {
                    self.reject(e, line_no);
                    continue;
                }
            };
            let event = match parse_event(line, self.fields.as_ref()) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    self.reject(e, line_no);
                    continue;
                }
            };
            self.stats.record(event.raw.event_type);

            tokio::select! {
                _ = ctx.cancelled() => return Ok(ReplayEnd::Cancelled),
                delivered = events.deliver(event) => {
                    if !delivered {
                        return Ok(ReplayEnd::ConsumerGone);
                    }
                }
            }
        }
    }
}

/// Read one line into `buf`, keeping at most `MAX_LINE_BYTES + 1` bytes of
/// it. Returns the bytes consumed from `reader`, 0 at end of input.
async fn read_capped<R>(mut reader: R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = (&mut reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if !is_truncated(buf) {
        return Ok(consumed);
    }

    loop {
        let (used, done) = {
            let chunk = reader.fill_buf().await?;
            match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (chunk.len(), chunk.is_empty()),
            }
        };
        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}

fn is_truncated(buf: &[u8]) -> bool {
    buf.len() > MAX_LINE_BYTES && buf.last() != Some(&b'\n')
}

fn decode_line(buf: &[u8]) -> Result<&str, ParseError> {
    if is_truncated(buf) {
        return Err(ParseError::LineTooLong {
            limit: MAX_LINE_BYTES,
        });
    }
    std::str::from_utf8(buf).map_err(|e| ParseError::InvalidUtf8 {
        offset: e.valid_up_to(),
    })
}

impl EventSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    async fn start(
        &mut self,
        ctx: CancellationToken,
        events: EventSender,
    ) -> Result<()> {
        let reader: Box<dyn AsyncBufRead + Send + Unpin> = match &self.input {
            ReplayInput::Stdin => Box::new(BufReader::new(tokio::io::stdin())),
            ReplayInput::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("opening trace {}", path.display()))?;
                Box::new(BufReader::new(file))
            }
        };

        let pump = Pump {
            fields: Arc::clone(&self.fields),
            stats: Arc::clone(&self.stats),
            on_error: self.on_error.take(),
        };
        let on_exhausted = self.on_exhausted.take();
        let input = self.input.describe();

        info!(input = %input, layout = self.fields.name(), "replay source started");

        self.task = Some(tokio::spawn(async move {
            match pump.run(reader, &ctx, &events).await {
                Ok(ReplayEnd::Exhausted) => {
                    info!(input = %input, "trace input exhausted");
                    if let Some(handler) = on_exhausted {
                        handler();
                    }
                }
                Ok(end) => debug!(input = %input, ?end, "replay stopped"),
                Err(e) => {
                    pump.report(e);
                    if let Some(handler) = on_exhausted {
                        handler();
                    }
                }
            }
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "replay task join failed");
                }
            }
        }
        Ok(())
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        self.on_error = Some(handler);
    }

    fn on_exhausted(&mut self, handler: ExhaustedHandler) {
        self.on_exhausted = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::tracer::event::{EventType, ParsedEvent};
    use crate::tracer::OverflowPolicy;
    use crate::tracer::fields::CurrentLayout;

    fn trace_file(contents: &str) -> tempfile::NamedTempFile {
        trace_bytes(contents.as_bytes())
    }

    fn trace_bytes(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents).expect("write trace");
        file
    }

    /// Replay `file` to the end, returning the delivered events and the
    /// rejected line messages with their error kinds.
    async fn replay_all(
        file: &tempfile::NamedTempFile,
        stats: &Arc<EventStats>,
    ) -> (Vec<ParsedEvent>, Vec<(String, &'static str)>) {
        let mut source = ReplaySource::new(
            ReplayInput::File(file.path().to_path_buf()),
            Arc::new(CurrentLayout),
            Arc::clone(stats),
        );

        let rejected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&rejected);
        source.on_error(Box::new(move |err| {
            let kind = err.downcast_ref::<ParseError>().expect("parse error").kind();
            sink.lock().push((format!("{err:#}"), kind));
        }));

        let done = CancellationToken::new();
        let finished = done.clone();
        source.on_exhausted(Box::new(move || finished.cancel()));

        let (tx, mut rx) = mpsc::channel(16);
        source
            .start(CancellationToken::new(), EventSender::new(tx, OverflowPolicy::Block))
            .await
            .expect("start");
        done.cancelled().await;
        source.stop().await.expect("stop");

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let rejected = std::mem::take(&mut *rejected.lock());
        (events, rejected)
    }

    #[test]
    fn test_input_from_arg() {
        assert_eq!(ReplayInput::from_arg("-"), ReplayInput::Stdin);
        assert_eq!(
            ReplayInput::from_arg("/tmp/t.trace"),
            ReplayInput::File(PathBuf::from("/tmp/t.trace"))
        );
    }

    #[tokio::test]
    async fn test_replay_delivers_events_and_reports_errors() {
        let file = trace_file(
            "# recorded trace\n\
             100 7 block_issue dev=8 sector=2048 rwbs=W\n\
             \n\
             150 7 bogus_probe\n\
             900 7 block_complete dev=8 sector=2048 rwbs=W\n",
        );

        let stats = Arc::new(EventStats::new());
        let mut source = ReplaySource::new(
            ReplayInput::File(file.path().to_path_buf()),
            Arc::new(CurrentLayout),
            Arc::clone(&stats),
        );

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        source.on_error(Box::new(move |err| {
            assert!(err.downcast_ref::<ParseError>().is_some());
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let done = CancellationToken::new();
        let finished = done.clone();
        source.on_exhausted(Box::new(move || finished.cancel()));

        let (tx, mut rx) = mpsc::channel(1);
        source
            .start(CancellationToken::new(), EventSender::new(tx, OverflowPolicy::Block))
            .await
            .expect("start");

        let first = rx.recv().await.expect("first event");
        assert_eq!(first.raw.event_type, EventType::BlockIssue);
        assert_eq!(first.raw.timestamp_ns, 100);
        let second = rx.recv().await.expect("second event");
        assert_eq!(second.raw.event_type, EventType::BlockComplete);

        done.cancelled().await;
        source.stop().await.expect("stop");

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        let snap = stats.snapshot();
        assert_eq!(snap.events(), 2);
        assert_eq!(snap.parse_errors, 1);
    }

    #[tokio::test]
    async fn test_replay_skips_invalid_utf8_line() {
        let mut trace = b"100 7 block_issue dev=8 sector=2048 rwbs=W\n".to_vec();
        trace.extend_from_slice(b"150 7 net_queue skb=0x\xff\xfe\n");
        trace.extend_from_slice(b"900 7 block_complete dev=8 sector=2048 rwbs=W\n");
        let file = trace_bytes(&trace);

        let stats = Arc::new(EventStats::new());
        let (events, rejected) = replay_all(&file, &stats).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].raw.event_type, EventType::BlockIssue);
        assert_eq!(events[1].raw.event_type, EventType::BlockComplete);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].1, "invalid_utf8");
        assert!(rejected[0].0.starts_with("line 2"));

        let snap = stats.snapshot();
        assert_eq!(snap.events(), 2);
        assert_eq!(snap.parse_errors, 1);
    }

    #[tokio::test]
    async fn test_replay_skips_overlong_line() {
        let mut trace = String::from("1 1 net_queue skb=0x10\n");
        trace.push_str("2 1 net_queue skb=0x20 pad=");
        trace.push_str(&"x".repeat(3 * MAX_LINE_BYTES));
        trace.push('\n');
        trace.push_str("3 1 net_queue skb=0x30\n");
        // Exactly at the limit, newline excluded.
        let at_limit = "4 1 net_queue skb=0x40 pad=";
        trace.push_str(at_limit);
        trace.push_str(&"y".repeat(MAX_LINE_BYTES - at_limit.len()));
        trace.push('\n');
        let file = trace_file(&trace);

        let stats = Arc::new(EventStats::new());
        let (events, rejected) = replay_all(&file, &stats).await;

        let stamps: Vec<u64> = events.iter().map(|e| e.raw.timestamp_ns).collect();
        assert_eq!(stamps, &[1, 3, 4]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].1, "line_too_long");
        assert!(rejected[0].0.starts_with("line 2"));
        assert_eq!(stats.snapshot().parse_errors, 1);
    }

    #[tokio::test]
    async fn test_replay_missing_file_fails_start() {
        let mut source = ReplaySource::new(
            ReplayInput::File(PathBuf::from("/nonexistent/flowscope.trace")),
            Arc::new(CurrentLayout),
            Arc::new(EventStats::new()),
        );
        let (tx, _rx) = mpsc::channel(1);
        assert!(source
            .start(CancellationToken::new(), EventSender::new(tx, OverflowPolicy::Block))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_replay_stops_on_cancel() {
        let file = trace_file(
            "1 1 net_queue skb=0x10\n\
             2 1 net_queue skb=0x20\n\
             3 1 net_queue skb=0x30\n",
        );
        let mut source = ReplaySource::new(
            ReplayInput::File(file.path().to_path_buf()),
            Arc::new(CurrentLayout),
            Arc::new(EventStats::new()),
        );
        let exhausted = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&exhausted);
        source.on_exhausted(Box::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));

        // Nobody reads: the pump parks on the second send until cancelled.
        let ctx = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        source
            .start(ctx.clone(), EventSender::new(tx, OverflowPolicy::Block))
            .await
            .expect("start");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        ctx.cancel();
        source.stop().await.expect("stop");

        assert_eq!(exhausted.load(Ordering::SeqCst), 0);
    }
}
