//! Decoded-Message Caching
//!
//! `CachingSource` wraps an [`IterableSource`] with an in-memory cache of
//! fully decoded messages, grouped into blocks keyed by time range. Seeking
//! back into a range that was already played costs no decode and no I/O.
//!
//! ## Blocks
//!
//! A block covers a contiguous time span (default 10 seconds) and records
//! which topics it holds. Requests are served block by block:
//!
//! ```text
//! request [position ..]
//!     ↓
//! block covering position with the requested topics?
//!     ├── yes → serve from memory, pin the block, advance
//!     ├── topics missing → backfill-decode only the missing topics into
//!     │                    the block (no full refetch)
//!     └── no block → decode one span from the inner source into a new block
//! ```
//!
//! ## Memory Ceiling
//!
//! A hard byte budget (default 256 MiB) bounds the cache. Eviction is LRU
//! and runs synchronously *before* a new block is admitted, so the budget
//! is never exceeded. Blocks currently under a read cursor are pinned and
//! never evicted. A span that alone exceeds the whole budget is served
//! uncached with a warning; it cannot be admitted without breaking the
//! ceiling.
//!
//! ## Decode-Once
//!
//! A source-wide decode mutex guarantees at most one concurrent decode per
//! source. Concurrent iterators wanting the same span serialize on the
//! mutex; the losers re-check the cache after acquiring it and find the
//! winner's block.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use rewind_core::{duration_to_nanos, MessageEvent, Problem, Time, TimeRange};

use crate::error::Result;
use crate::source::{
    Initialization, IterableSource, IteratorItem, MessageIterator, ReadArgs,
};

/// Configuration for a [`CachingSource`].
#[derive(Debug, Clone)]
pub struct CachingSourceConfig {
    /// Hard ceiling on cached decoded-message bytes
    pub max_bytes: u64,

    /// Time span covered by one cache block
    pub block_span: Duration,
}

impl Default for CachingSourceConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            block_span: Duration::from_secs(10),
        }
    }
}

/// One cached span of decoded messages.
struct CacheBlock {
    id: u64,
    /// Time range this block covers, inclusive
    range: TimeRange,
    /// Topics present; `None` means every topic in the range
    topics: Option<HashSet<String>>,
    /// Events sorted by receive time
    events: Vec<MessageEvent>,
    bytes: u64,
    last_access: u64,
}

impl CacheBlock {
    fn covers_topics(&self, requested: &Option<HashSet<String>>) -> bool {
        match (&self.topics, requested) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(have), Some(want)) => want.is_subset(have),
        }
    }
}

#[derive(Default)]
struct CacheState {
    blocks: Vec<CacheBlock>,
    total_bytes: u64,
    next_id: u64,
    access_counter: u64,
    /// Pin counts per block id; pinned blocks are never evicted
    pins: HashMap<u64, u32>,
}

impl CacheState {
    fn touch(&mut self, id: u64) {
        self.access_counter += 1;
        let counter = self.access_counter;
        if let Some(block) = self.blocks.iter_mut().find(|b| b.id == id) {
            block.last_access = counter;
        }
    }

    fn pin(&mut self, id: u64) {
        *self.pins.entry(id).or_insert(0) += 1;
    }

    fn unpin(&mut self, id: u64) {
        if let Some(count) = self.pins.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&id);
            }
        }
    }

    /// Remove and return the block with the given id, if still resident.
    fn take(&mut self, id: u64) -> Option<CacheBlock> {
        let idx = self.blocks.iter().position(|b| b.id == id)?;
        let block = self.blocks.swap_remove(idx);
        self.total_bytes -= block.bytes;
        Some(block)
    }

    /// Evict unpinned LRU blocks until `incoming` more bytes fit. Returns
    /// false when the budget cannot be honored (the incoming block alone
    /// exceeds the ceiling, or everything left is pinned).
    fn make_room(&mut self, incoming: u64, max_bytes: u64) -> bool {
        if incoming > max_bytes {
            return false;
        }
        while self.total_bytes + incoming > max_bytes {
            let victim = self
                .blocks
                .iter()
                .filter(|b| !self.pins.contains_key(&b.id))
                .min_by_key(|b| b.last_access)
                .map(|b| b.id);
            match victim {
                Some(id) => {
                    let evicted = self.take(id).expect("victim exists");
                    debug!(
                        block = evicted.id,
                        bytes = evicted.bytes,
                        "Evicted decoded-message block"
                    );
                }
                None => return false,
            }
        }
        true
    }

    /// Admit a block, evicting first. Hands the block back when the budget
    /// cannot be honored so the caller can still serve its events.
    fn admit(&mut self, block: CacheBlock, max_bytes: u64) -> std::result::Result<(), CacheBlock> {
        if !self.make_room(block.bytes, max_bytes) {
            return Err(block);
        }
        self.total_bytes += block.bytes;
        self.blocks.push(block);
        Ok(())
    }
}

struct CachingShared {
    config: CachingSourceConfig,
    state: Mutex<CacheState>,
    /// At-most-one concurrent decode per source
    decode_lock: tokio::sync::Mutex<()>,
}

impl CachingShared {
    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache state poisoned")
    }
}

/// Caching wrapper around any [`IterableSource`].
pub struct CachingSource {
    inner: Arc<dyn IterableSource>,
    shared: Arc<CachingShared>,
}

impl CachingSource {
    pub fn new(inner: Arc<dyn IterableSource>, config: CachingSourceConfig) -> Self {
        Self {
            inner,
            shared: Arc::new(CachingShared {
                config,
                state: Mutex::new(CacheState::default()),
                decode_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Total decoded bytes currently cached.
    pub fn cached_bytes(&self) -> u64 {
        self.shared.state().total_bytes
    }

    /// Number of cache blocks currently resident.
    pub fn cached_blocks(&self) -> usize {
        self.shared.state().blocks.len()
    }
}

#[async_trait]
impl IterableSource for CachingSource {
    async fn initialize(&self) -> Result<Initialization> {
        self.inner.initialize().await
    }

    async fn message_iterator(&self, args: ReadArgs) -> Result<Box<dyn MessageIterator>> {
        Ok(Box::new(CachingIterator {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
            position: args.range.start,
            args,
            queue: VecDeque::new(),
            problems: VecDeque::new(),
            pinned: None,
            done: false,
        }))
    }

    async fn get_backfill(
        &self,
        time: Time,
        topics: &HashSet<String>,
    ) -> Result<Vec<MessageEvent>> {
        self.inner.get_backfill(time, topics).await
    }
}

/// What one span lookup produced.
struct SpanResult {
    events: Vec<MessageEvent>,
    problems: Vec<Problem>,
    /// First position after the covered span
    next_position: Time,
    /// Block to pin while the cursor sits on it (None when uncached)
    pin: Option<u64>,
}

struct CachingIterator {
    inner: Arc<dyn IterableSource>,
    shared: Arc<CachingShared>,
    args: ReadArgs,
    position: Time,
    queue: VecDeque<MessageEvent>,
    problems: VecDeque<Problem>,
    pinned: Option<u64>,
    done: bool,
}

impl CachingIterator {
    /// Serve the span at the current position from cache, or decode it.
    async fn load_span(&self) -> Result<SpanResult> {
        if let Some(result) = self.from_cache() {
            return Ok(result);
        }

        // One decode at a time per source. Whoever got here second finds
        // the winner's block on the re-check.
        let _decoding = self.shared.decode_lock.lock().await;
        if let Some(result) = self.from_cache() {
            return Ok(result);
        }

        // A resident block covering the position but missing topics gets a
        // backfill decode of only the missing topics, not a full refetch.
        let partial = self
            .shared
            .state()
            .blocks
            .iter()
            .find(|b| b.range.contains(self.position))
            .map(|b| (b.id, b.range, b.topics.clone()));

        match partial {
            Some((id, range, have_topics)) => {
                self.backfill_block(id, range, have_topics).await
            }
            None => self.decode_span().await,
        }
    }

    /// Decode a new span starting at the current position and admit it.
    async fn decode_span(&self) -> Result<SpanResult> {
        let span_nanos = duration_to_nanos(self.shared.config.block_span).max(1);
        let span_end = self
            .position
            .saturating_add(span_nanos - 1)
            .min(self.args.range.end);
        let range = TimeRange::new(self.position, span_end);

        let (events, problems) = self.decode(range, self.args.topics.clone()).await?;
        let bytes: u64 = events.iter().map(|e| e.size_in_bytes as u64).sum();

        let mut state = self.shared.state();
        state.next_id += 1;
        state.access_counter += 1;
        let block = CacheBlock {
            id: state.next_id,
            range,
            topics: self.args.topics.clone(),
            events,
            bytes,
            last_access: state.access_counter,
        };

        match state.admit(block, self.shared.config.max_bytes) {
            Ok(()) => {
                drop(state);
                let mut result = self
                    .from_cache()
                    .expect("block admitted for current position");
                result.problems = problems;
                Ok(result)
            }
            Err(block) => {
                // Clamp: serve without caching rather than break the ceiling
                drop(state);
                warn!(
                    bytes,
                    max_bytes = self.shared.config.max_bytes,
                    "Decoded span does not fit the cache budget, serving uncached"
                );
                Ok(SpanResult {
                    events: block.events,
                    problems,
                    next_position: span_end.saturating_add(1),
                    pin: None,
                })
            }
        }
    }

    /// Decode the topics missing from an existing block and merge them in.
    async fn backfill_block(
        &self,
        id: u64,
        range: TimeRange,
        have_topics: Option<HashSet<String>>,
    ) -> Result<SpanResult> {
        let load_topics = match (&self.args.topics, &have_topics) {
            (None, _) | (Some(_), None) => None,
            (Some(want), Some(have)) => {
                Some(want.difference(have).cloned().collect::<HashSet<_>>())
            }
        };
        let (new_events, problems) = self.decode(range, load_topics.clone()).await?;

        // Hold the cache lock only across the synchronous merge; the eviction
        // path must release it before awaiting the full re-decode below.
        {
            let mut state = self.shared.state();
            if let Some(mut block) = state.take(id) {
                match load_topics {
                    None => {
                        // Re-decoded every topic: replace outright
                        block.events = new_events;
                        block.topics = None;
                    }
                    Some(extra) => {
                        block.events.extend(new_events);
                        block.events.sort_by_key(|e| e.receive_time);
                        if let Some(topics) = &mut block.topics {
                            topics.extend(extra);
                        }
                    }
                }
                block.bytes = block.events.iter().map(|e| e.size_in_bytes as u64).sum();
                match state.admit(block, self.shared.config.max_bytes) {
                    Ok(()) => {
                        state.touch(id);
                        drop(state);
                        let mut result = self
                            .from_cache()
                            .expect("merged block covers current position");
                        result.problems = problems;
                        return Ok(result);
                    }
                    Err(block) => {
                        drop(state);
                        warn!(
                            max_bytes = self.shared.config.max_bytes,
                            "Merged block does not fit the cache budget, serving uncached"
                        );
                        let events = self.filter_events(block.events);
                        return Ok(SpanResult {
                            events,
                            problems,
                            next_position: range.end.saturating_add(1),
                            pin: None,
                        });
                    }
                }
            }
        }

        // Evicted while we decoded the backfill; the partial data we hold is
        // only the missing topics, so start over with a full span decode.
        self.decode_span().await
    }

    /// Try to serve the current position from a resident block.
    fn from_cache(&self) -> Option<SpanResult> {
        let mut state = self.shared.state();
        let block = state
            .blocks
            .iter()
            .find(|b| b.range.contains(self.position) && b.covers_topics(&self.args.topics))?;

        let id = block.id;
        let end = block.range.end;
        let events = self.filter_events(block.events.clone());
        state.touch(id);
        drop(state);

        Some(SpanResult {
            events,
            problems: Vec::new(),
            next_position: end.saturating_add(1),
            pin: Some(id),
        })
    }

    fn filter_events(&self, events: Vec<MessageEvent>) -> Vec<MessageEvent> {
        events
            .into_iter()
            .filter(|e| e.receive_time >= self.position && e.receive_time <= self.args.range.end)
            .filter(|e| match &self.args.topics {
                Some(topics) => topics.contains(&e.topic),
                None => true,
            })
            .collect()
    }

    /// Run the inner iterator over `range`, separating messages from
    /// problems. Stamps only mark progress and are dropped here; the
    /// caching iterator emits its own.
    async fn decode(
        &self,
        range: TimeRange,
        topics: Option<HashSet<String>>,
    ) -> Result<(Vec<MessageEvent>, Vec<Problem>)> {
        let mut iter = self
            .inner
            .message_iterator(ReadArgs { range, topics })
            .await?;
        let mut events = Vec::new();
        let mut problems = Vec::new();
        while let Some(item) = iter.next().await {
            match item? {
                IteratorItem::Message(msg) => events.push(msg),
                IteratorItem::Problem(p) => problems.push(p),
                IteratorItem::Stamp(_) => {}
            }
        }
        events.sort_by_key(|e| e.receive_time);
        Ok((events, problems))
    }

    fn swap_pin(&mut self, new_pin: Option<u64>) {
        if self.pinned == new_pin {
            return;
        }
        let mut state = self.shared.state();
        if let Some(old) = self.pinned.take() {
            state.unpin(old);
        }
        if let Some(new) = new_pin {
            state.pin(new);
        }
        self.pinned = new_pin;
    }
}

#[async_trait]
impl MessageIterator for CachingIterator {
    async fn next(&mut self) -> Option<Result<IteratorItem>> {
        loop {
            if let Some(problem) = self.problems.pop_front() {
                return Some(Ok(IteratorItem::Problem(problem)));
            }
            if let Some(event) = self.queue.pop_front() {
                return Some(Ok(IteratorItem::Message(event)));
            }
            if self.done || self.position > self.args.range.end {
                self.swap_pin(None);
                return None;
            }

            let span = match self.load_span().await {
                Ok(span) => span,
                Err(err) => return Some(Err(err)),
            };
            let covered_end = span
                .next_position
                .saturating_sub(1)
                .min(self.args.range.end);
            let was_empty = span.events.is_empty() && span.problems.is_empty();

            self.swap_pin(span.pin);
            self.queue = span.events.into();
            self.problems = span.problems.into();
            // A span ending at the top of the timeline cannot advance the
            // cursor past itself; stop after draining it
            if span.next_position <= self.position {
                self.done = true;
            }
            self.position = span.next_position;

            if was_empty {
                // Keep downstream consumers advancing through empty spans
                return Some(Ok(IteratorItem::Stamp(covered_end)));
            }
        }
    }
}

impl Drop for CachingIterator {
    fn drop(&mut self) {
        if let Some(id) = self.pinned.take() {
            if let Ok(mut state) = self.shared.state.lock() {
                state.unpin(id);
            }
        }
    }
}
