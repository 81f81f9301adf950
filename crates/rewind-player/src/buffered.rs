//! Read-Ahead Buffering
//!
//! `BufferedSource` decouples how fast a source produces messages from how
//! fast the playback tick consumes them. A producer task pulls from the
//! underlying iterator ahead of the consumer into an in-order queue; the
//! tick then drains already-buffered items without ever touching I/O.
//!
//! ## The Bound is a Time Window
//!
//! The queue is bounded by *how far ahead of the consumer* the producer may
//! run (default 10 seconds of timeline), never by an item count. Payloads
//! vary by orders of magnitude between topics: a thousand IMU samples and
//! a thousand camera frames are not remotely the same amount of memory, but
//! ten seconds of timeline is ten seconds of timeline.
//!
//! ```text
//! producer task ──→ [ queue (≤ read-ahead window) ] ──→ consumer
//!      │ suspends when the window is full     │ suspends when empty
//!      │ (backpressure)                       │ and producer still running
//! ```
//!
//! ## Cancellation
//!
//! Dropping the iterator cancels the producer through its
//! `CancellationToken` and closes the queue. A seek is exactly that: drop
//! the old iterator, create a new one at the new position. No stale message
//! survives, because the queue dies with the iterator that owned it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rewind_core::{duration_to_nanos, MessageEvent, Time};

use crate::error::Result;
use crate::source::{
    Initialization, IterableSource, IteratorItem, MessageIterator, ReadArgs,
};

/// Read-ahead wrapper around any [`IterableSource`].
pub struct BufferedSource {
    inner: Arc<dyn IterableSource>,
    read_ahead: Duration,
}

impl BufferedSource {
    pub fn new(inner: Arc<dyn IterableSource>, read_ahead: Duration) -> Self {
        Self { inner, read_ahead }
    }

    /// Create a read-ahead iterator with its producer task running.
    ///
    /// This is the concrete-typed variant of
    /// [`IterableSource::message_iterator`]; the playback controller uses
    /// it directly for its non-blocking [`BufferedIterator::try_next`].
    pub async fn buffered_iterator(&self, args: ReadArgs) -> Result<BufferedIterator> {
        let inner_iter = self.inner.message_iterator(args.clone()).await?;
        let shared = Arc::new(Shared {
            consumer_time: AtomicU64::new(args.range.start),
            notify: Notify::new(),
        });
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let window = duration_to_nanos(self.read_ahead);
        let producer = tokio::spawn(produce(
            inner_iter,
            tx,
            shared.clone(),
            token.clone(),
            window,
        ));

        Ok(BufferedIterator {
            rx,
            shared,
            token,
            _producer: producer,
            finished: false,
        })
    }
}

#[async_trait]
impl IterableSource for BufferedSource {
    async fn initialize(&self) -> Result<Initialization> {
        self.inner.initialize().await
    }

    async fn message_iterator(&self, args: ReadArgs) -> Result<Box<dyn MessageIterator>> {
        Ok(Box::new(self.buffered_iterator(args).await?))
    }

    async fn get_backfill(
        &self,
        time: Time,
        topics: &std::collections::HashSet<String>,
    ) -> Result<Vec<MessageEvent>> {
        self.inner.get_backfill(time, topics).await
    }
}

struct Shared {
    /// Timeline position of the last item the consumer took
    consumer_time: AtomicU64,
    /// Signaled on consumer progress so a suspended producer re-checks
    notify: Notify,
}

/// Producer task: pull from the inner iterator, respect the window, push.
async fn produce(
    mut iter: Box<dyn MessageIterator>,
    tx: mpsc::UnboundedSender<Result<IteratorItem>>,
    shared: Arc<Shared>,
    token: CancellationToken,
    window: u64,
) {
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => break,
            item = iter.next() => item,
        };
        let Some(item) = item else { break };

        // Backpressure: suspend while this item is further ahead of the
        // consumer than the read-ahead window allows
        if let Ok(inner) = &item {
            if let Some(t) = inner.time() {
                loop {
                    let consumed = shared.consumer_time.load(Ordering::Acquire);
                    if t.saturating_sub(consumed) <= window {
                        break;
                    }
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = shared.notify.notified() => {}
                    }
                }
            }
        }

        if tx.send(item).is_err() {
            // Consumer dropped the iterator
            break;
        }
    }
    debug!("Read-ahead producer finished");
}

/// Consumer half of a read-ahead queue.
pub struct BufferedIterator {
    rx: mpsc::UnboundedReceiver<Result<IteratorItem>>,
    shared: Arc<Shared>,
    token: CancellationToken,
    _producer: tokio::task::JoinHandle<()>,
    finished: bool,
}

impl BufferedIterator {
    /// Non-blocking pull of the next already-buffered item.
    ///
    /// Returns `None` when nothing is buffered right now; check
    /// [`Self::is_finished`] to distinguish "producer still working" from
    /// "range exhausted".
    pub fn try_next(&mut self) -> Option<Result<IteratorItem>> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.note_progress(&item);
                Some(item)
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.finished = true;
                None
            }
        }
    }

    /// Whether the producer is done and the queue fully drained.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn note_progress(&self, item: &Result<IteratorItem>) {
        if let Ok(item) = item {
            if let Some(t) = item.time() {
                self.shared.consumer_time.store(t, Ordering::Release);
                self.shared.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl MessageIterator for BufferedIterator {
    async fn next(&mut self) -> Option<Result<IteratorItem>> {
        match self.rx.recv().await {
            Some(item) => {
                self.note_progress(&item);
                Some(item)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

impl Drop for BufferedIterator {
    fn drop(&mut self) {
        // Halt the producer and discard everything in flight
        self.token.cancel();
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{msg, ScriptedSource};
    use rewind_core::TimeRange;

    const SEC: u64 = 1_000_000_000;

    fn source_with_seconds(n: u64) -> Arc<dyn IterableSource> {
        let events = (0..n).map(|i| msg("/t", i * SEC)).collect();
        Arc::new(ScriptedSource::new(events))
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let buffered = BufferedSource::new(source_with_seconds(50), Duration::from_secs(100));
        let mut iter = buffered
            .buffered_iterator(ReadArgs::all(TimeRange::new(0, u64::MAX)))
            .await
            .unwrap();

        let mut times = Vec::new();
        while let Some(item) = iter.next().await {
            if let IteratorItem::Message(m) = item.unwrap() {
                times.push(m.receive_time);
            }
        }
        assert_eq!(times, (0..50).map(|i| i * SEC).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_backpressure_respects_window() {
        // 100 seconds of messages, 5 second window, consumer never advances.
        // The producer may buffer messages up to t = start + window, plus
        // the single item it pulled before suspending on the window check.
        let source = Arc::new(ScriptedSource::new(
            (0..100).map(|i| msg("/t", i * SEC)).collect(),
        ));
        let buffered =
            BufferedSource::new(source.clone() as Arc<dyn IterableSource>, Duration::from_secs(5));
        let mut iter = buffered
            .buffered_iterator(ReadArgs::all(TimeRange::new(0, u64::MAX)))
            .await
            .unwrap();

        // Give the producer plenty of opportunity to overrun
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut buffered_count = 0;
        while let Some(item) = iter.try_next() {
            if matches!(item.unwrap(), IteratorItem::Message(_)) {
                buffered_count += 1;
            }
        }
        // Window covers t=0..=5s → 6 messages; one more may be in flight
        assert!(
            (1..=7).contains(&buffered_count),
            "expected a window-bounded buffer, got {buffered_count} messages"
        );
    }

    #[tokio::test]
    async fn test_consumption_releases_backpressure() {
        let buffered = BufferedSource::new(source_with_seconds(30), Duration::from_secs(5));
        let mut iter = buffered
            .buffered_iterator(ReadArgs::all(TimeRange::new(0, u64::MAX)))
            .await
            .unwrap();

        // Consuming everything must terminate despite the small window
        let mut count = 0;
        while let Some(item) = iter.next().await {
            if matches!(item.unwrap(), IteratorItem::Message(_)) {
                count += 1;
            }
        }
        assert_eq!(count, 30);
        assert!(iter.is_finished());
    }

    #[tokio::test]
    async fn test_drop_cancels_producer() {
        let source = Arc::new(ScriptedSource::new(
            (0..1000).map(|i| msg("/t", i * SEC)).collect(),
        ));
        let buffered =
            BufferedSource::new(source.clone() as Arc<dyn IterableSource>, Duration::from_secs(2));
        let iter = buffered
            .buffered_iterator(ReadArgs::all(TimeRange::new(0, u64::MAX)))
            .await
            .unwrap();
        let token = iter.token.clone();

        drop(iter);
        // Cancellation is prompt: the token observes it immediately
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_fresh_iterator_after_drop_starts_at_new_position() {
        // Seek semantics: drop the old iterator, ask for a new range, and
        // nothing from the old range leaks through.
        let buffered = BufferedSource::new(source_with_seconds(100), Duration::from_secs(3));

        let mut old = buffered
            .buffered_iterator(ReadArgs::all(TimeRange::new(0, u64::MAX)))
            .await
            .unwrap();
        // Partially consume
        for _ in 0..5 {
            old.next().await;
        }
        drop(old);

        let mut fresh = buffered
            .buffered_iterator(ReadArgs::all(TimeRange::new(40 * SEC, u64::MAX)))
            .await
            .unwrap();
        let first = loop {
            match fresh.next().await.unwrap().unwrap() {
                IteratorItem::Message(m) => break m,
                _ => continue,
            }
        };
        assert_eq!(first.receive_time, 40 * SEC);
    }

    #[tokio::test]
    async fn test_try_next_empty_vs_finished() {
        let buffered = BufferedSource::new(source_with_seconds(1), Duration::from_secs(5));
        let mut iter = buffered
            .buffered_iterator(ReadArgs::all(TimeRange::new(0, u64::MAX)))
            .await
            .unwrap();

        // Drain with the async API
        while iter.next().await.is_some() {}
        assert!(iter.is_finished());
        assert!(iter.try_next().is_none());
    }
}
