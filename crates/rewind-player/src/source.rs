//! The IterableSource Contract
//!
//! Every recording, whatever its transport, is consumed through one
//! uniform contract:
//!
//! 1. `initialize()`: open and validate, learn the time range, channels,
//!    and schemas
//! 2. `message_iterator(args)`: a finite, in-order, lazy sequence of
//!    [`IteratorItem`]s for a time range and topic filter; restartable by
//!    calling again with a new range
//! 3. `get_backfill(time, topics)`: the latest message at or before a
//!    point in time for each topic, used to seed panels after a seek
//!
//! The buffered, caching, and merged sources all wrap this same trait, so
//! the playback controller composes them freely.
//!
//! ## Iterator Items
//!
//! Iteration yields more than messages. The three shapes are a tagged enum
//! dispatched exhaustively everywhere:
//!
//! - `Message`: a decoded message event
//! - `Problem`: a non-fatal diagnostic scoped to the source (corrupt
//!   chunk, retries exhausted); playback continues
//! - `Stamp`: a progress marker: "this source has nothing before T".
//!   Stamps let downstream buffering and merging advance through stretches
//!   where a topic filter matches nothing, without waiting for a message.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

use rewind_core::{Channel, MessageEvent, Problem, ProblemLog, Schema, Time, TimeRange};
use rewind_log::{
    BlockCache, BlockCacheConfig, ByteRangeReader, ChunkedLogReader, FileRangeReader,
    HttpRangeReader, MemoryRangeReader, Statistics,
};

use crate::error::{Error, Result};

/// Where a recording lives.
#[derive(Debug, Clone)]
pub enum ResourceDescriptor {
    /// Local file path
    File(PathBuf),
    /// HTTP(S) URL served with byte-range support
    Http(String),
    /// Recording bytes already in memory
    Memory(Bytes),
}

/// What a source learned at initialization.
#[derive(Debug, Clone)]
pub struct Initialization {
    /// Time span the source covers
    pub time_range: TimeRange,

    /// Channels present in the source
    pub channels: Vec<Channel>,

    /// Schemas present in the source
    pub schemas: Vec<Schema>,

    /// Whole-file statistics, when available
    pub statistics: Option<Statistics>,
}

/// One step of playback iteration.
#[derive(Debug, Clone)]
pub enum IteratorItem {
    /// A message inside the requested range and topic filter
    Message(MessageEvent),
    /// A non-fatal diagnostic; playback continues
    Problem(Problem),
    /// Progress marker: the source has nothing more before this time
    Stamp(Time),
}

impl IteratorItem {
    /// Timeline position of this item, if it has one.
    pub fn time(&self) -> Option<Time> {
        match self {
            IteratorItem::Message(msg) => Some(msg.receive_time),
            IteratorItem::Stamp(t) => Some(*t),
            IteratorItem::Problem(_) => None,
        }
    }
}

/// Arguments for creating a message iterator.
#[derive(Debug, Clone)]
pub struct ReadArgs {
    /// Time range to iterate, inclusive on both ends
    pub range: TimeRange,

    /// Topics to include; `None` means all topics
    pub topics: Option<HashSet<String>>,
}

impl ReadArgs {
    /// All topics over the given range.
    pub fn all(range: TimeRange) -> Self {
        Self { range, topics: None }
    }

    /// A topic subset over the given range.
    pub fn filtered(range: TimeRange, topics: HashSet<String>) -> Self {
        Self {
            range,
            topics: Some(topics),
        }
    }
}

/// A finite, in-order, lazy sequence of iterator items.
#[async_trait]
pub trait MessageIterator: Send {
    /// The next item, or `None` once the range is exhausted.
    async fn next(&mut self) -> Option<Result<IteratorItem>>;
}

/// Uniform contract over one recording source.
#[async_trait]
pub trait IterableSource: Send + Sync {
    /// Open and validate the source. Idempotent; later calls return the
    /// same result.
    async fn initialize(&self) -> Result<Initialization>;

    /// Create an iterator over `args.range` for `args.topics`.
    async fn message_iterator(&self, args: ReadArgs) -> Result<Box<dyn MessageIterator>>;

    /// Latest message at or before `time` for each requested topic,
    /// sorted by `(receive_time, topic)`.
    async fn get_backfill(&self, time: Time, topics: &HashSet<String>)
        -> Result<Vec<MessageEvent>>;
}

/// An [`IterableSource`] over one chunked recording file.
pub struct LogSource {
    descriptor: ResourceDescriptor,
    cache_config: BlockCacheConfig,
    problems: ProblemLog,
    reader: OnceCell<Arc<ChunkedLogReader>>,
}

impl LogSource {
    pub fn new(descriptor: ResourceDescriptor, problems: ProblemLog) -> Self {
        Self {
            descriptor,
            cache_config: BlockCacheConfig::default(),
            problems,
            reader: OnceCell::new(),
        }
    }

    pub fn with_cache_config(mut self, config: BlockCacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    async fn reader(&self) -> Result<&Arc<ChunkedLogReader>> {
        self.reader
            .get_or_try_init(|| async {
                let raw: Box<dyn ByteRangeReader> = match &self.descriptor {
                    ResourceDescriptor::File(path) => Box::new(FileRangeReader::new(path)),
                    ResourceDescriptor::Http(url) => {
                        Box::new(HttpRangeReader::new(url.clone(), self.problems.clone()))
                    }
                    ResourceDescriptor::Memory(data) => {
                        Box::new(MemoryRangeReader::new(data.clone()))
                    }
                };
                let cache = BlockCache::open(raw, self.cache_config.clone()).await?;
                let reader = ChunkedLogReader::open(Arc::new(cache)).await?;
                Ok::<_, Error>(Arc::new(reader))
            })
            .await
    }
}

#[async_trait]
impl IterableSource for LogSource {
    async fn initialize(&self) -> Result<Initialization> {
        let reader = self.reader().await?;
        let summary = reader.summary();
        Ok(Initialization {
            time_range: summary.time_range,
            channels: summary.channels.clone(),
            schemas: summary.schemas.clone(),
            statistics: summary.statistics,
        })
    }

    async fn message_iterator(&self, args: ReadArgs) -> Result<Box<dyn MessageIterator>> {
        let reader = self.reader().await?.clone();
        let cursor = reader.first_chunk_overlapping(args.range.start);
        Ok(Box::new(LogMessageIterator {
            reader,
            args,
            cursor,
            pending: std::collections::VecDeque::new(),
            finished: false,
        }))
    }

    async fn get_backfill(
        &self,
        time: Time,
        topics: &HashSet<String>,
    ) -> Result<Vec<MessageEvent>> {
        let reader = self.reader().await?;
        let latest = reader.latest_before(time, topics).await?;
        let mut events: Vec<MessageEvent> = latest.into_values().collect();
        events.sort_by(|a, b| {
            (a.receive_time, a.topic.as_str()).cmp(&(b.receive_time, b.topic.as_str()))
        });
        Ok(events)
    }
}

/// Iterator over one recording's chunks.
struct LogMessageIterator {
    reader: Arc<ChunkedLogReader>,
    args: ReadArgs,
    cursor: usize,
    pending: std::collections::VecDeque<MessageEvent>,
    finished: bool,
}

#[async_trait]
impl MessageIterator for LogMessageIterator {
    async fn next(&mut self) -> Option<Result<IteratorItem>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(IteratorItem::Message(event)));
            }
            if self.finished {
                return None;
            }

            let chunks = self.reader.chunks();
            if self.cursor >= chunks.len() || chunks[self.cursor].start_time > self.args.range.end
            {
                self.finished = true;
                return None;
            }

            let index = self.cursor;
            self.cursor += 1;
            let stamp_at = chunks[index].end_time.min(self.args.range.end);

            match self
                .reader
                .read_chunk(index, self.args.range, self.args.topics.as_ref())
                .await
            {
                Ok(events) if events.is_empty() => {
                    // Nothing matched the filter in this chunk; let
                    // downstream consumers advance anyway
                    return Some(Ok(IteratorItem::Stamp(stamp_at)));
                }
                Ok(events) => {
                    self.pending.extend(events);
                }
                Err(err) => {
                    // Chunk-local failure: report and keep playing from the
                    // next chunk. Retries for transient I/O already happened
                    // below us in the block cache.
                    let problem = if err.is_corrupt() {
                        Problem::error(format!("chunk {index} is corrupt and was skipped"))
                            .with_error(&err)
                    } else {
                        Problem::warn(format!("chunk {index} could not be read"))
                            .with_error(&err)
                    };
                    return Some(Ok(IteratorItem::Problem(problem)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_log::{Compression, LogWriter};

    fn fixture() -> Bytes {
        let mut writer = LogWriter::new(Compression::Lz4, true).with_chunk_capacity(64);
        writer.add_schema(1, "Pose", "jsonschema", &b"{}"[..]);
        writer.add_channel(1, 1, "/pose", "json").unwrap();
        writer.add_channel(2, 1, "/gps", "json").unwrap();
        for i in 1..=20u64 {
            let channel = if i % 2 == 0 { 2 } else { 1 };
            writer
                .write_message(channel, i * 1_000, None, format!("p{i}").as_bytes())
                .unwrap();
        }
        Bytes::from(writer.finish().unwrap())
    }

    fn source() -> LogSource {
        LogSource::new(ResourceDescriptor::Memory(fixture()), ProblemLog::new())
    }

    async fn collect_messages(
        source: &LogSource,
        args: ReadArgs,
    ) -> Vec<MessageEvent> {
        let mut iter = source.message_iterator(args).await.unwrap();
        let mut out = Vec::new();
        while let Some(item) = iter.next().await {
            if let IteratorItem::Message(msg) = item.unwrap() {
                out.push(msg);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_initialize() {
        let source = source();
        let init = source.initialize().await.unwrap();
        assert_eq!(init.time_range, TimeRange::new(1_000, 20_000));
        assert_eq!(init.channels.len(), 2);
        assert_eq!(init.statistics.unwrap().message_count, 20);

        // idempotent
        let again = source.initialize().await.unwrap();
        assert_eq!(again.time_range, init.time_range);
    }

    #[tokio::test]
    async fn test_full_iteration_in_order() {
        let source = source();
        source.initialize().await.unwrap();
        let messages =
            collect_messages(&source, ReadArgs::all(TimeRange::new(0, u64::MAX))).await;

        assert_eq!(messages.len(), 20);
        let times: Vec<_> = messages.iter().map(|m| m.receive_time).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_range_and_topic_filter() {
        let source = source();
        source.initialize().await.unwrap();
        let messages = collect_messages(
            &source,
            ReadArgs::filtered(
                TimeRange::new(5_000, 15_000),
                ["/gps".to_string()].into(),
            ),
        )
        .await;

        assert!(!messages.is_empty());
        assert!(messages.iter().all(|m| m.topic == "/gps"));
        assert!(messages
            .iter()
            .all(|m| (5_000..=15_000).contains(&m.receive_time)));
    }

    #[tokio::test]
    async fn test_restartable() {
        let source = source();
        source.initialize().await.unwrap();

        let first = collect_messages(&source, ReadArgs::all(TimeRange::new(0, u64::MAX))).await;
        let second =
            collect_messages(&source, ReadArgs::all(TimeRange::new(10_000, u64::MAX))).await;

        assert_eq!(first.len(), 20);
        assert_eq!(second.first().unwrap().receive_time, 10_000);
    }

    #[tokio::test]
    async fn test_filtered_gap_yields_stamps_not_silence() {
        let source = source();
        source.initialize().await.unwrap();
        let mut iter = source
            .message_iterator(ReadArgs::filtered(
                TimeRange::new(0, u64::MAX),
                ["/no-such-topic".to_string()].into(),
            ))
            .await
            .unwrap();

        let mut stamps = 0;
        while let Some(item) = iter.next().await {
            match item.unwrap() {
                IteratorItem::Stamp(_) => stamps += 1,
                IteratorItem::Message(msg) => panic!("unexpected message {msg:?}"),
                IteratorItem::Problem(p) => panic!("unexpected problem {p:?}"),
            }
        }
        assert!(stamps > 0, "empty chunks must emit progress stamps");
    }

    #[tokio::test]
    async fn test_backfill_sorted() {
        let source = source();
        source.initialize().await.unwrap();
        let topics: HashSet<String> = ["/pose".to_string(), "/gps".to_string()].into();
        let backfill = source.get_backfill(10_500, &topics).await.unwrap();

        assert_eq!(backfill.len(), 2);
        assert_eq!(backfill[0].receive_time, 9_000); // /pose
        assert_eq!(backfill[1].receive_time, 10_000); // /gps
    }

    #[tokio::test]
    async fn test_missing_file_is_source_error() {
        let source = LogSource::new(
            ResourceDescriptor::File("/no/such/recording.rwnd".into()),
            ProblemLog::new(),
        );
        assert!(source.initialize().await.is_err());
    }
}
