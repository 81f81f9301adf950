//! K-Way Time-Ordered Merge
//!
//! `MergedSource` combines N independently time-ordered sources into one
//! globally ordered stream.
//!
//! ## Algorithm
//!
//! A min-heap holds one peeked item per source, keyed by
//! `(timestamp, source index)`. Each step pops the minimum, emits it, pulls
//! the popped source one item forward, and reinserts. The source index in
//! the key makes ties deterministic: two messages at the same timestamp
//! always emit in source-input order, run after run.
//!
//! ## Refills
//!
//! At iterator creation (and after a seek creates a fresh iterator) every
//! source must be peeked once. Those initial pulls run in parallel, capped
//! at a small concurrency to avoid request storms against remote storage.
//! In steady state only the source that was just popped needs a pull, so
//! refills are single awaits.
//!
//! ## Initialization Policy
//!
//! All sources initialize in parallel, and all must settle before merging
//! starts. What happens when one fails is configurable
//! ([`InitFailurePolicy`]): abort the whole merge (default), or drop the
//! failed source, record a problem, and continue with the rest.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use rewind_core::{MessageEvent, Problem, ProblemLog, Time};

use crate::config::InitFailurePolicy;
use crate::error::{Error, Result};
use crate::source::{
    Initialization, IterableSource, IteratorItem, MessageIterator, ReadArgs,
};

/// How many sources are pulled concurrently during a heap refill.
const REFILL_CONCURRENCY: usize = 3;

/// N sources merged into one globally ordered stream.
pub struct MergedSource {
    sources: Vec<Arc<dyn IterableSource>>,
    policy: InitFailurePolicy,
    problems: ProblemLog,
    /// Indexes of sources that initialized successfully, plus the merged
    /// initialization result
    init: OnceCell<(Vec<usize>, Initialization)>,
}

impl MergedSource {
    pub fn new(
        sources: Vec<Arc<dyn IterableSource>>,
        policy: InitFailurePolicy,
        problems: ProblemLog,
    ) -> Self {
        Self {
            sources,
            policy,
            problems,
            init: OnceCell::new(),
        }
    }

    async fn init(&self) -> Result<&(Vec<usize>, Initialization)> {
        self.init
            .get_or_try_init(|| async {
                let results = futures::future::join_all(
                    self.sources.iter().map(|s| s.initialize()),
                )
                .await;

                let mut active = Vec::new();
                let mut merged: Option<Initialization> = None;
                for (index, result) in results.into_iter().enumerate() {
                    match result {
                        Ok(init) => {
                            merged = Some(match merged {
                                None => init,
                                Some(mut acc) => {
                                    acc.time_range = acc.time_range.union(&init.time_range);
                                    acc.channels.extend(init.channels);
                                    acc.schemas.extend(init.schemas);
                                    // statistics are per-file; a merged view
                                    // keeps none rather than inventing one
                                    acc.statistics = None;
                                    acc
                                }
                            });
                            active.push(index);
                        }
                        Err(err) => match self.policy {
                            InitFailurePolicy::Abort => {
                                return Err(match err {
                                    Error::Log(source) => Error::SourceInit { index, source },
                                    other => other,
                                });
                            }
                            InitFailurePolicy::DropAndContinue => {
                                warn!(source = index, error = %err, "Dropping source that failed to initialize");
                                self.problems.push(
                                    Problem::error(format!(
                                        "source {index} failed to initialize and was dropped"
                                    ))
                                    .with_error(&err),
                                );
                            }
                        },
                    }
                }

                let merged = merged.ok_or(Error::NoValidTimeRange)?;
                debug!(
                    active = active.len(),
                    total = self.sources.len(),
                    start = merged.time_range.start,
                    end = merged.time_range.end,
                    "Merged sources initialized"
                );
                Ok((active, merged))
            })
            .await
    }
}

#[async_trait]
impl IterableSource for MergedSource {
    async fn initialize(&self) -> Result<Initialization> {
        Ok(self.init().await?.1.clone())
    }

    async fn message_iterator(&self, args: ReadArgs) -> Result<Box<dyn MessageIterator>> {
        let (active, _) = self.init().await?;

        let mut slots = Vec::with_capacity(active.len());
        for &index in active {
            let iter = self.sources[index].message_iterator(args.clone()).await?;
            slots.push(SourceSlot {
                iter: Some(iter),
                peeked: None,
                exhausted: false,
            });
        }

        let mut iter = MergedIterator {
            slots,
            heap: BinaryHeap::new(),
            pending_problems: VecDeque::new(),
        };
        iter.refill_all().await;
        Ok(Box::new(iter))
    }

    async fn get_backfill(
        &self,
        time: Time,
        topics: &HashSet<String>,
    ) -> Result<Vec<MessageEvent>> {
        let (active, _) = self.init().await?;

        let results = futures::future::join_all(
            active
                .iter()
                .map(|&index| self.sources[index].get_backfill(time, topics)),
        )
        .await;

        // Latest message per topic across sources; on equal timestamps the
        // later source wins, matching its position in the merged order
        let mut latest: HashMap<String, MessageEvent> = HashMap::new();
        for result in results {
            for event in result? {
                match latest.get(&event.topic) {
                    Some(existing) if existing.receive_time > event.receive_time => {}
                    _ => {
                        latest.insert(event.topic.clone(), event);
                    }
                }
            }
        }

        let mut events: Vec<MessageEvent> = latest.into_values().collect();
        events.sort_by(|a, b| {
            (a.receive_time, a.topic.as_str()).cmp(&(b.receive_time, b.topic.as_str()))
        });
        Ok(events)
    }
}

struct SourceSlot {
    /// Taken while a refill future owns the iterator
    iter: Option<Box<dyn MessageIterator>>,
    peeked: Option<IteratorItem>,
    exhausted: bool,
}

struct MergedIterator {
    slots: Vec<SourceSlot>,
    /// Min-heap keyed by (time, source index)
    heap: BinaryHeap<Reverse<(Time, usize)>>,
    /// Problems pulled while peeking, emitted before the next keyed item
    pending_problems: VecDeque<Problem>,
}

impl MergedIterator {
    /// Peek every slot that needs one, at most [`REFILL_CONCURRENCY`]
    /// sources in flight at a time.
    async fn refill_all(&mut self) {
        let needs: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.exhausted && s.peeked.is_none())
            .map(|(i, _)| i)
            .collect();

        let mut pending = needs.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < REFILL_CONCURRENCY {
                match pending.next() {
                    Some(index) => {
                        let mut iter =
                            self.slots[index].iter.take().expect("iterator present");
                        in_flight.push(async move {
                            let mut problems = Vec::new();
                            // Skip problem items here; they carry no key
                            let item = loop {
                                match iter.next().await {
                                    Some(Ok(IteratorItem::Problem(p))) => problems.push(p),
                                    Some(Ok(item)) => break Some(item),
                                    Some(Err(err)) => {
                                        problems.push(
                                            Problem::error(
                                                "source iterator failed; source halted",
                                            )
                                            .with_error(&err),
                                        );
                                        break None;
                                    }
                                    None => break None,
                                }
                            };
                            (index, problems, item, iter)
                        });
                    }
                    None => break,
                }
            }

            match in_flight.next().await {
                Some((index, problems, item, iter)) => {
                    self.pending_problems.extend(problems);
                    let slot = &mut self.slots[index];
                    slot.iter = Some(iter);
                    match item {
                        Some(item) => {
                            let t = item.time().expect("problems filtered out");
                            slot.peeked = Some(item);
                            self.heap.push(Reverse((t, index)));
                        }
                        None => slot.exhausted = true,
                    }
                }
                None => break,
            }
        }
    }

    /// Pull one item forward on a single source.
    async fn refill_one(&mut self, index: usize) {
        let mut iter = self.slots[index].iter.take().expect("iterator present");
        loop {
            match iter.next().await {
                Some(Ok(IteratorItem::Problem(p))) => self.pending_problems.push_back(p),
                Some(Ok(item)) => {
                    let t = item.time().expect("problems filtered out");
                    self.slots[index].peeked = Some(item);
                    self.heap.push(Reverse((t, index)));
                    break;
                }
                Some(Err(err)) => {
                    self.pending_problems.push_back(
                        Problem::error("source iterator failed; source halted").with_error(&err),
                    );
                    self.slots[index].exhausted = true;
                    break;
                }
                None => {
                    self.slots[index].exhausted = true;
                    break;
                }
            }
        }
        self.slots[index].iter = Some(iter);
    }
}

#[async_trait]
impl MessageIterator for MergedIterator {
    async fn next(&mut self) -> Option<Result<IteratorItem>> {
        if let Some(problem) = self.pending_problems.pop_front() {
            return Some(Ok(IteratorItem::Problem(problem)));
        }

        let Reverse((_, index)) = self.heap.pop()?;
        let item = self.slots[index].peeked.take().expect("heap entry has a peek");
        self.refill_one(index).await;
        Some(Ok(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{msg, ScriptedSource};
    use rewind_core::TimeRange;

    fn merged(sources: Vec<Arc<ScriptedSource>>, policy: InitFailurePolicy) -> MergedSource {
        MergedSource::new(
            sources
                .into_iter()
                .map(|s| s as Arc<dyn IterableSource>)
                .collect(),
            policy,
            ProblemLog::new(),
        )
    }

    async fn collect_tagged(source: &MergedSource) -> Vec<(Time, String)> {
        let mut iter = source
            .message_iterator(ReadArgs::all(TimeRange::new(0, u64::MAX)))
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(item) = iter.next().await {
            if let IteratorItem::Message(m) = item.unwrap() {
                out.push((m.receive_time, m.topic));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_interleaved_merge() {
        // Source A emits at t=0,2,4 and source B at t=1,3,5; the merged
        // output is [0..5] tagged [A,B,A,B,A,B]
        let a = Arc::new(ScriptedSource::new(vec![
            msg("/a", 0),
            msg("/a", 2),
            msg("/a", 4),
        ]));
        let b = Arc::new(ScriptedSource::new(vec![
            msg("/b", 1),
            msg("/b", 3),
            msg("/b", 5),
        ]));
        let source = merged(vec![a, b], InitFailurePolicy::Abort);
        source.initialize().await.unwrap();

        let out = collect_tagged(&source).await;
        assert_eq!(
            out,
            vec![
                (0, "/a".to_string()),
                (1, "/b".to_string()),
                (2, "/a".to_string()),
                (3, "/b".to_string()),
                (4, "/a".to_string()),
                (5, "/b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_equal_timestamps_break_ties_by_source_index() {
        let a = Arc::new(ScriptedSource::new(vec![msg("/a", 10), msg("/a", 20)]));
        let b = Arc::new(ScriptedSource::new(vec![msg("/b", 10), msg("/b", 20)]));

        for _ in 0..5 {
            // Identical results run after run
            let source = merged(vec![a.clone(), b.clone()], InitFailurePolicy::Abort);
            source.initialize().await.unwrap();
            let out = collect_tagged(&source).await;
            assert_eq!(
                out,
                vec![
                    (10, "/a".to_string()),
                    (10, "/b".to_string()),
                    (20, "/a".to_string()),
                    (20, "/b".to_string()),
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_merged_output_non_decreasing() {
        let a = Arc::new(ScriptedSource::new(
            (0..50u64).map(|i| msg("/a", i * 7 % 331 * 1000)).collect(),
        ));
        let b = Arc::new(ScriptedSource::new(
            (0..80u64).map(|i| msg("/b", i * 13 % 331 * 1000)).collect(),
        ));
        let c = Arc::new(ScriptedSource::new(
            (0..30u64).map(|i| msg("/c", i * 29 % 331 * 1000)).collect(),
        ));

        let source = merged(vec![a, b, c], InitFailurePolicy::Abort);
        source.initialize().await.unwrap();
        let out = collect_tagged(&source).await;
        assert_eq!(out.len(), 160);
        assert!(out.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[tokio::test]
    async fn test_merged_time_range_is_union() {
        let a = Arc::new(ScriptedSource::new(vec![msg("/a", 100), msg("/a", 500)]));
        let b = Arc::new(ScriptedSource::new(vec![msg("/b", 50), msg("/b", 300)]));

        let source = merged(vec![a, b], InitFailurePolicy::Abort);
        let init = source.initialize().await.unwrap();
        assert_eq!(init.time_range, TimeRange::new(50, 500));
    }

    #[tokio::test]
    async fn test_init_failure_aborts_by_default() {
        let good = Arc::new(ScriptedSource::new(vec![msg("/a", 1)]));
        let bad = Arc::new(ScriptedSource::failing());

        let source = merged(vec![good, bad], InitFailurePolicy::Abort);
        assert!(source.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_init_failure_drop_and_continue() {
        let good = Arc::new(ScriptedSource::new(vec![msg("/a", 1), msg("/a", 2)]));
        let bad = Arc::new(ScriptedSource::failing());
        let problems = ProblemLog::new();

        let source = MergedSource::new(
            vec![
                good as Arc<dyn IterableSource>,
                bad as Arc<dyn IterableSource>,
            ],
            InitFailurePolicy::DropAndContinue,
            problems.clone(),
        );
        let init = source.initialize().await.unwrap();
        assert_eq!(init.time_range, TimeRange::new(1, 2));
        assert_eq!(problems.len(), 1);

        let out = collect_tagged(&source).await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_fatal() {
        let source = merged(
            vec![
                Arc::new(ScriptedSource::failing()),
                Arc::new(ScriptedSource::failing()),
            ],
            InitFailurePolicy::DropAndContinue,
        );
        assert!(matches!(
            source.initialize().await,
            Err(Error::NoValidTimeRange)
        ));
    }

    #[tokio::test]
    async fn test_backfill_merges_latest_per_topic() {
        let a = Arc::new(ScriptedSource::new(vec![msg("/x", 10), msg("/x", 40)]));
        let b = Arc::new(ScriptedSource::new(vec![msg("/y", 20), msg("/y", 90)]));

        let source = merged(vec![a, b], InitFailurePolicy::Abort);
        source.initialize().await.unwrap();

        let topics: HashSet<String> = ["/x".to_string(), "/y".to_string()].into();
        let backfill = source.get_backfill(50, &topics).await.unwrap();
        assert_eq!(backfill.len(), 2);
        // sorted by (receive_time, topic): /y at 20 before /x at 40
        assert_eq!(backfill[0].topic, "/y");
        assert_eq!(backfill[0].receive_time, 20);
        assert_eq!(backfill[1].topic, "/x");
        assert_eq!(backfill[1].receive_time, 40);
    }

    #[tokio::test]
    async fn test_single_source_passthrough() {
        let a = Arc::new(ScriptedSource::new(
            (0..10u64).map(|i| msg("/solo", i * 100)).collect(),
        ));
        let source = merged(vec![a], InitFailurePolicy::Abort);
        source.initialize().await.unwrap();

        let out = collect_tagged(&source).await;
        assert_eq!(out.len(), 10);
        assert_eq!(out[0].0, 0);
        assert_eq!(out[9].0, 900);
    }
}
