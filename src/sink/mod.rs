pub mod report;

use anyhow::Result;

use crate::tracer::EventSender;

/// Sink consumes parsed events and reports on them.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Spawn the processing loop. It runs until `ctx` is cancelled, then
    /// drains queued events and writes a final report.
    fn start(
        &mut self,
        ctx: tokio_util::sync::CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Shut down the sink.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Channel handle that sources deliver events through.
    fn event_sender(&self) -> EventSender;
}
