pub mod event;
pub mod fields;
pub mod parse;
pub mod replay;
pub mod stats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use self::event::ParsedEvent;

/// Callback for source errors such as undecodable records.
pub type ErrorHandler = Box<dyn Fn(anyhow::Error) + Send + Sync>;

/// Callback invoked once when a finite source has delivered everything.
pub type ExhaustedHandler = Box<dyn Fn() + Send + Sync>;

/// What a source does when the processing channel is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for space. Nothing is lost; the source slows down.
    #[default]
    Block,
    /// Drop the event and count it.
    Drop,
}

/// Sending half of the processing channel, shared by sources.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ParsedEvent>,
    policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<ParsedEvent>, policy: OverflowPolicy) -> Self {
        Self {
            tx,
            policy,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hand `event` to the processing task. Returns false once the
    /// receiver is gone.
    pub async fn deliver(&self, event: ParsedEvent) -> bool {
        match self.policy {
            OverflowPolicy::Block => self.tx.send(event).await.is_ok(),
            OverflowPolicy::Drop => match self.tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
        }
    }

    /// Read and reset the overflow drop counter.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Events currently queued.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// EventSource produces decoded probe events.
///
/// Events are pushed through the [`EventSender`] given to `start`.
/// Timestamps must be non-decreasing per execution context; no ordering is
/// required across contexts.
pub trait EventSource: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Begin delivering events into `events`.
    fn start(
        &mut self,
        ctx: CancellationToken,
        events: EventSender,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Stop delivering events and wait for the reader to exit.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Register a handler for source errors.
    fn on_error(&mut self, handler: ErrorHandler);

    /// Register a handler for end of input.
    fn on_exhausted(&mut self, handler: ExhaustedHandler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::interval::ExecutionContextId;
    use crate::tracer::event::{Event, EventType, TypedEvent};

    fn event(ts: u64) -> ParsedEvent {
        ParsedEvent {
            raw: Event {
                timestamp_ns: ts,
                ctx: ExecutionContextId(1),
                event_type: EventType::ReclaimEnd,
            },
            typed: TypedEvent::ReclaimEnd,
        }
    }

    #[tokio::test]
    async fn test_drop_policy_counts_overflow() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx, OverflowPolicy::Drop);

        assert!(sender.deliver(event(1)).await);
        assert!(sender.deliver(event(2)).await);
        assert_eq!(sender.queued(), 1);
        assert_eq!(sender.take_dropped(), 1);
        assert_eq!(sender.take_dropped(), 0);

        assert_eq!(rx.recv().await.map(|e| e.raw.timestamp_ns), Some(1));
        drop(rx);
        assert!(!sender.deliver(event(3)).await);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx, OverflowPolicy::Block);

        assert!(sender.deliver(event(1)).await);
        let pending = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.deliver(event(2)).await })
        };

        assert_eq!(rx.recv().await.map(|e| e.raw.timestamp_ns), Some(1));
        assert_eq!(rx.recv().await.map(|e| e.raw.timestamp_ns), Some(2));
        assert!(pending.await.expect("join"));
        assert_eq!(sender.take_dropped(), 0);
    }
}
