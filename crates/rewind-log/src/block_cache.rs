//! Block Cache with LRU Eviction
//!
//! This module implements a fixed-budget, block-aligned cache sitting in
//! front of a [`ByteRangeReader`].
//!
//! ## Why Caching?
//!
//! Remote range requests have high latency (tens to hundreds of ms per
//! round trip). Recording decoders read the same regions repeatedly: the
//! footer, the summary, the chunk an iterator is positioned in, the chunk a
//! backfill walks backward over. Without a cache every one of those reads
//! is a network round trip.
//!
//! ## How It Works
//!
//! ```text
//! read(offset=70_000, length=4_000)        block size 64 KiB
//!         ↓
//! decompose into block-aligned fetches: block 1 (65_536..131_072)
//!         ↓
//!     CACHE HIT? ──YES──→ slice the window out, zero-copy
//!         │
//!         NO
//!         ↓
//! at-most-one fetch per block key (concurrent readers coalesce)
//!         ↓
//! fetch block via reader, retried with exponential backoff
//!         ↓
//! evict LRU blocks until the new block fits, then admit it
//! ```
//!
//! ## Guarantees
//!
//! - Total cached bytes never exceed the configured budget: eviction runs
//!   synchronously *before* a new block is admitted.
//! - At most one in-flight fetch per block key; concurrent requests for the
//!   same block wait on the winner and then hit the cache.
//! - A block larger than the whole budget is returned to the caller but not
//!   cached (clamped), with a warning.

use bytes::{Bytes, BytesMut};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::range_reader::ByteRangeReader;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Configuration for a [`BlockCache`].
#[derive(Debug, Clone)]
pub struct BlockCacheConfig {
    /// Size of one cache block in bytes (default: 64 KiB)
    pub block_size: u64,

    /// Maximum total bytes held by the cache (default: 32 MiB)
    pub max_bytes: u64,

    /// Retry policy applied to block fetches
    pub retry: RetryPolicy,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            max_bytes: 32 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

struct CacheInner {
    lru: LruCache<u64, Bytes>,
    bytes: u64,
}

/// Block-aligned LRU cache in front of a byte-range reader.
pub struct BlockCache {
    reader: Box<dyn ByteRangeReader>,
    size: u64,
    config: BlockCacheConfig,
    inner: Mutex<CacheInner>,
    inflight: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl BlockCache {
    /// Open the underlying reader and wrap it in a cache.
    pub async fn open(
        mut reader: Box<dyn ByteRangeReader>,
        config: BlockCacheConfig,
    ) -> Result<Self> {
        let size = reader.open().await?;
        // Block count is bounded by the byte budget; the LRU capacity just
        // needs to never be the limiting factor.
        let capacity = NonZeroUsize::new(
            ((config.max_bytes / config.block_size) as usize + 1).max(1),
        )
        .expect("capacity is at least 1");

        Ok(Self {
            reader,
            size,
            config,
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(capacity),
                bytes: 0,
            }),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Total size of the underlying resource in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fetch an arbitrary byte window, served from cached blocks.
    pub async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        if offset + length > self.size {
            return Err(Error::RangeOutOfBounds {
                offset,
                length,
                size: self.size,
            });
        }
        if length == 0 {
            return Ok(Bytes::new());
        }

        let block_size = self.config.block_size;
        let first = offset / block_size;
        let last = (offset + length - 1) / block_size;

        if first == last {
            // Single-block window: slice without assembly
            let block = self.block(first).await?;
            let start = (offset - first * block_size) as usize;
            return Ok(block.slice(start..start + length as usize));
        }

        let mut out = BytesMut::with_capacity(length as usize);
        for index in first..=last {
            let block = self.block(index).await?;
            let block_start = index * block_size;
            let from = offset.max(block_start) - block_start;
            let to = (offset + length).min(block_start + block.len() as u64) - block_start;
            out.extend_from_slice(&block[from as usize..to as usize]);
        }
        Ok(out.freeze())
    }

    /// Fetch one block, coalescing concurrent requests for the same index.
    async fn block(&self, index: u64) -> Result<Bytes> {
        if let Some(block) = self.cached(index).await {
            return Ok(block);
        }

        let guard = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(index)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _fetching = guard.lock().await;

        // Someone may have completed the fetch while we waited on the guard
        if let Some(block) = self.cached(index).await {
            return Ok(block);
        }

        let start = index * self.config.block_size;
        let len = self.config.block_size.min(self.size - start);
        let result = retry_with_backoff(&self.config.retry, || self.reader.read(start, len)).await;
        self.inflight.lock().await.remove(&index);

        let block = result?;
        debug!(block = index, bytes = block.len(), "Fetched block");
        self.admit(index, block.clone()).await;
        Ok(block)
    }

    async fn cached(&self, index: u64) -> Option<Bytes> {
        let mut inner = self.inner.lock().await;
        inner.lru.get(&index).cloned()
    }

    /// Insert a block, evicting LRU blocks first so the budget holds.
    async fn admit(&self, index: u64, block: Bytes) {
        let len = block.len() as u64;
        let mut inner = self.inner.lock().await;

        if len > self.config.max_bytes {
            warn!(
                block = index,
                bytes = len,
                max_bytes = self.config.max_bytes,
                "Block larger than cache budget, not caching"
            );
            return;
        }

        while inner.bytes + len > self.config.max_bytes {
            match inner.lru.pop_lru() {
                Some((evicted, data)) => {
                    inner.bytes -= data.len() as u64;
                    debug!(block = evicted, bytes = data.len(), "Evicted block");
                }
                None => break,
            }
        }

        inner.bytes += len;
        inner.lru.put(index, block);
    }

    /// Currently cached byte total.
    pub async fn cached_bytes(&self) -> u64 {
        self.inner.lock().await.bytes
    }

    /// Number of blocks currently cached.
    pub async fn cached_blocks(&self) -> usize {
        self.inner.lock().await.lru.len()
    }

    /// Whether a given block index is resident (does not touch LRU order).
    pub async fn contains_block(&self, index: u64) -> bool {
        self.inner.lock().await.lru.peek(&index).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range_reader::MemoryRangeReader;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MIB: u64 = 1024 * 1024;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn cache_over(data: Vec<u8>, block_size: u64, max_bytes: u64) -> BlockCache {
        BlockCache::open(
            Box::new(MemoryRangeReader::new(data)),
            BlockCacheConfig {
                block_size,
                max_bytes,
                retry: RetryPolicy::default(),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_matches_source() {
        let data = patterned(300_000);
        let cache = cache_over(data.clone(), 64 * 1024, 32 * MIB).await;

        for (offset, length) in [(0u64, 100u64), (64 * 1024 - 10, 20), (150_000, 100_000)] {
            let window = cache.read(offset, length).await.unwrap();
            assert_eq!(
                &window[..],
                &data[offset as usize..(offset + length) as usize]
            );
        }
    }

    #[tokio::test]
    async fn test_read_past_end_rejected() {
        let cache = cache_over(patterned(1000), 256, 32 * MIB).await;
        assert!(matches!(
            cache.read(990, 20).await,
            Err(Error::RangeOutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_read() {
        let cache = cache_over(patterned(1000), 256, 32 * MIB).await;
        assert_eq!(cache.read(500, 0).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_short_final_block() {
        // 1000 bytes with 256-byte blocks: final block is 232 bytes
        let data = patterned(1000);
        let cache = cache_over(data.clone(), 256, 32 * MIB).await;

        let tail = cache.read(768, 232).await.unwrap();
        assert_eq!(&tail[..], &data[768..]);
        assert_eq!(cache.cached_blocks().await, 1);
        assert_eq!(cache.cached_bytes().await, 232);
    }

    #[tokio::test]
    async fn test_sequential_read_keeps_mru_blocks() {
        // Scenario: 10 MiB file, 1 MiB blocks, 3 MiB budget. A sequential
        // read of the whole file must leave exactly the 3 most recently
        // used blocks resident.
        let cache = cache_over(patterned((10 * MIB) as usize), MIB, 3 * MIB).await;

        for i in 0..10u64 {
            cache.read(i * MIB, MIB).await.unwrap();
        }

        assert_eq!(cache.cached_blocks().await, 3);
        assert_eq!(cache.cached_bytes().await, 3 * MIB);
        for i in 0..7u64 {
            assert!(!cache.contains_block(i).await, "block {i} should be evicted");
        }
        for i in 7..10u64 {
            assert!(cache.contains_block(i).await, "block {i} should be resident");
        }
    }

    #[tokio::test]
    async fn test_budget_never_exceeded_under_random_access() {
        let cache = cache_over(patterned((4 * MIB) as usize), 64 * 1024, 512 * 1024).await;

        // Pseudo-random but deterministic access pattern
        let mut offset = 1u64;
        for _ in 0..200 {
            offset = (offset * 48271) % (4 * MIB - 1000);
            cache.read(offset, 1000).await.unwrap();
            assert!(cache.cached_bytes().await <= 512 * 1024);
        }
    }

    #[tokio::test]
    async fn test_lru_promotion_on_hit() {
        let cache = cache_over(patterned(4096), 1024, 2048).await;

        cache.read(0, 100).await.unwrap(); // block 0
        cache.read(1024, 100).await.unwrap(); // block 1
        cache.read(0, 100).await.unwrap(); // touch block 0 again
        cache.read(2048, 100).await.unwrap(); // block 2 evicts block 1

        assert!(cache.contains_block(0).await);
        assert!(!cache.contains_block(1).await);
        assert!(cache.contains_block(2).await);
    }

    /// Counts how many times each block offset is fetched from the source.
    struct CountingReader {
        inner: MemoryRangeReader,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ByteRangeReader for CountingReader {
        async fn open(&mut self) -> Result<u64> {
            self.inner.open().await
        }
        async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.read(offset, length).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_reads_of_same_block_coalesce() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(
            BlockCache::open(
                Box::new(CountingReader {
                    inner: MemoryRangeReader::new(patterned(64 * 1024)),
                    fetches: fetches.clone(),
                }),
                BlockCacheConfig::default(),
            )
            .await
            .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.read(100, 200).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 200);
        }

        // All 16 readers wanted block 0; only one fetch may reach the source
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeat_read_hits_cache() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let cache = BlockCache::open(
            Box::new(CountingReader {
                inner: MemoryRangeReader::new(patterned(256 * 1024)),
                fetches: fetches.clone(),
            }),
            BlockCacheConfig::default(),
        )
        .await
        .unwrap();

        cache.read(0, 1000).await.unwrap();
        cache.read(0, 1000).await.unwrap();
        cache.read(500, 200).await.unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }
}
