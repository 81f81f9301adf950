//! Chunked Log Reader
//!
//! `ChunkedLogReader` opens a recording through a [`BlockCache`] and
//! exposes it as channels, schemas, and a time-indexed list of chunks.
//!
//! ## Two Decoding Strategies
//!
//! Chosen at open time from the footer:
//!
//! - **Indexed**: the footer points at a summary section. The reader
//!   verifies the summary CRC, decodes the repeated schema/channel records
//!   and the ChunkIndex records, and can binary-search chunks by time to
//!   seek directly.
//! - **Unindexed**: the summary offset is zero. The reader walks the data
//!   section forward, registering schemas and channels as they appear and
//!   building the same chunk index opportunistically from chunk prefixes
//!   (no decompression happens during the scan).
//!
//! Either way the result is identical downstream: `chunks()` plus
//! `read_chunk()` is the whole consumption contract.
//!
//! ## Validation
//!
//! Open fails with a corrupt-file error on missing or mismatched magic at
//! either end of the file, an unsupported version, a bad summary CRC, or a
//! channel referencing a schema that does not exist. Per-chunk problems
//! (bad chunk CRC, failed decompression) are *not* open failures; they
//! surface from `read_chunk()` so the caller can skip the chunk and keep
//! playing.

use bytes::{Buf, Bytes};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use rewind_core::{Channel, MessageEvent, Schema, Time, TimeRange};

use super::records::{decode_record, decompress_chunk, Record};
use super::{
    ChunkIndexEntry, Statistics, FOOTER_SIZE, FORMAT_VERSION, FRAME_HEADER_SIZE, HEADER_SIZE,
    MAGIC, OP_CHANNEL, OP_CHUNK, OP_END, OP_SCHEMA,
};
use crate::block_cache::BlockCache;
use crate::error::{Error, Result};

/// What a recording contains, learned at open time.
#[derive(Debug, Clone)]
pub struct LogSummary {
    /// Time span covered by the recording
    pub time_range: TimeRange,

    /// All channels, sorted by id
    pub channels: Vec<Channel>,

    /// All schemas, sorted by id
    pub schemas: Vec<Schema>,

    /// Whole-file statistics, when the file carried them
    pub statistics: Option<Statistics>,

    /// Whether the file had a summary section (direct time seeks)
    pub indexed: bool,
}

/// Format-aware reader over one recording file.
pub struct ChunkedLogReader {
    cache: Arc<BlockCache>,
    summary: LogSummary,
    channels: HashMap<u16, Channel>,
    schemas: HashMap<u16, Schema>,
    chunks: Vec<ChunkIndexEntry>,
}

impl ChunkedLogReader {
    /// Open and validate a recording.
    pub async fn open(cache: Arc<BlockCache>) -> Result<Self> {
        let size = cache.size();
        if size < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::InvalidRecord(format!(
                "file of {size} bytes is smaller than header + footer"
            )));
        }

        // Header
        let header = cache.read(0, HEADER_SIZE).await?;
        if header[0..4] != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        // Footer
        let mut footer = cache.read(size - FOOTER_SIZE, FOOTER_SIZE).await?;
        let summary_offset = footer.get_u64();
        let summary_crc = footer.get_u32();
        footer.advance(8); // reserved
        if footer[0..4] != MAGIC {
            return Err(Error::InvalidMagic);
        }

        let mut state = DecodeState::default();
        let indexed = summary_offset != 0;
        if indexed {
            if summary_offset < HEADER_SIZE || summary_offset > size - FOOTER_SIZE {
                return Err(Error::InvalidRecord(format!(
                    "summary offset {summary_offset} outside file"
                )));
            }
            let summary_bytes = cache
                .read(summary_offset, size - FOOTER_SIZE - summary_offset)
                .await?;
            if crc32fast::hash(&summary_bytes) != summary_crc {
                return Err(Error::CrcMismatch);
            }
            state.decode_summary(summary_bytes)?;
            debug!(
                chunks = state.chunks.len(),
                channels = state.channels.len(),
                "Opened indexed recording"
            );
        } else {
            state.scan_data_section(&cache, size).await?;
            debug!(
                chunks = state.chunks.len(),
                channels = state.channels.len(),
                "Opened unindexed recording by linear scan"
            );
        }

        state.validate_schema_references()?;
        state.chunks.sort_by_key(|c| (c.start_time, c.chunk_offset));

        let time_range = match state.statistics {
            Some(stats) => TimeRange::new(stats.start_time, stats.end_time),
            None => state
                .chunks
                .iter()
                .map(|c| TimeRange::new(c.start_time, c.end_time))
                .reduce(|a, b| a.union(&b))
                .unwrap_or(TimeRange::new(0, 0)),
        };

        let mut channels: Vec<Channel> = state.channels.values().cloned().collect();
        channels.sort_by_key(|c| c.id);
        let mut schemas: Vec<Schema> = state.schemas.values().cloned().collect();
        schemas.sort_by_key(|s| s.id);

        Ok(Self {
            summary: LogSummary {
                time_range,
                channels,
                schemas,
                statistics: state.statistics,
                indexed,
            },
            channels: state.channels,
            schemas: state.schemas,
            chunks: state.chunks,
            cache,
        })
    }

    pub fn summary(&self) -> &LogSummary {
        &self.summary
    }

    /// Chunk index entries, sorted by start time.
    pub fn chunks(&self) -> &[ChunkIndexEntry] {
        &self.chunks
    }

    /// Index of the first chunk that could contain messages at or after `t`.
    pub fn first_chunk_overlapping(&self, t: Time) -> usize {
        self.chunks.partition_point(|c| c.end_time < t)
    }

    /// Decode one chunk, returning its messages filtered by time range and
    /// topic set, sorted by receive time.
    ///
    /// Corruption inside the chunk (checksum, decompression, malformed
    /// message records) fails only this call; other chunks are unaffected.
    pub async fn read_chunk(
        &self,
        index: usize,
        range: TimeRange,
        topics: Option<&HashSet<String>>,
    ) -> Result<Vec<MessageEvent>> {
        let entry = self.chunks.get(index).ok_or_else(|| {
            Error::InvalidRecord(format!("chunk index {index} out of range"))
        })?;

        let frame = self.cache.read(entry.chunk_offset, entry.chunk_length).await?;
        let chunk = match read_one_frame(frame, entry.chunk_offset)? {
            Record::Chunk(chunk) => chunk,
            other => {
                return Err(Error::InvalidRecord(format!(
                    "expected chunk at offset {}, found {other:?}",
                    entry.chunk_offset
                )))
            }
        };

        let raw = decompress_chunk(&chunk)?;
        let mut events = Vec::new();
        let mut cursor = raw.clone();
        let mut consumed = 0u64;
        while cursor.has_remaining() {
            let record = read_one_frame(cursor.clone(), entry.chunk_offset + consumed)?;
            let frame_len = FRAME_HEADER_SIZE
                + match &record {
                    Record::Message(msg) => 18 + msg.data.len() as u64,
                    _ => {
                        return Err(Error::InvalidRecord(
                            "chunk contains a non-message record".to_string(),
                        ))
                    }
                };
            cursor.advance(frame_len as usize);
            consumed += frame_len;

            let Record::Message(msg) = record else { unreachable!() };
            if !range.contains(msg.log_time) {
                continue;
            }
            let channel = self.channels.get(&msg.channel_id).ok_or_else(|| {
                Error::InvalidRecord(format!(
                    "message references unknown channel {}",
                    msg.channel_id
                ))
            })?;
            if let Some(topics) = topics {
                if !topics.contains(&channel.topic) {
                    continue;
                }
            }
            let schema = &self.schemas[&channel.schema_id];
            events.push(MessageEvent {
                size_in_bytes: MessageEvent::estimated_size(
                    &channel.topic,
                    &schema.name,
                    msg.data.len(),
                ),
                topic: channel.topic.clone(),
                receive_time: msg.log_time,
                publish_time: msg.publish_time,
                data: msg.data,
                schema_name: schema.name.clone(),
            });
        }

        // Within-source ordering guarantee: files are not required to store
        // messages sorted inside a chunk
        events.sort_by_key(|e| e.receive_time);
        Ok(events)
    }

    /// Latest message at or before `time` for each requested topic.
    ///
    /// Corrupt chunks are skipped; backfill is best-effort by design.
    pub async fn latest_before(
        &self,
        time: Time,
        topics: &HashSet<String>,
    ) -> Result<HashMap<String, MessageEvent>> {
        let mut latest: HashMap<String, MessageEvent> = HashMap::new();

        for index in 0..self.chunks.len() {
            if self.chunks[index].start_time > time {
                break;
            }
            match self
                .read_chunk(index, TimeRange::new(0, time), Some(topics))
                .await
            {
                Ok(events) => {
                    for event in events {
                        // events are sorted, later entries overwrite earlier
                        latest.insert(event.topic.clone(), event);
                    }
                }
                Err(err) if err.is_corrupt() => {
                    warn!(chunk = index, error = %err, "Skipping corrupt chunk during backfill");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(latest)
    }
}

/// Decode the first record frame from `frame` (which must start at a frame
/// boundary). `offset` is the file position, for error messages.
fn read_one_frame(mut frame: Bytes, offset: u64) -> Result<Record> {
    if frame.remaining() < FRAME_HEADER_SIZE as usize {
        return Err(Error::TruncatedRecord(offset));
    }
    let opcode = frame.get_u8();
    let body_len = frame.get_u32() as usize;
    if frame.remaining() < body_len {
        return Err(Error::TruncatedRecord(offset));
    }
    decode_record(opcode, frame.split_to(body_len))
}

#[derive(Default)]
struct DecodeState {
    channels: HashMap<u16, Channel>,
    schemas: HashMap<u16, Schema>,
    chunks: Vec<ChunkIndexEntry>,
    statistics: Option<Statistics>,
}

impl DecodeState {
    /// Decode the summary section of an indexed file.
    fn decode_summary(&mut self, mut bytes: Bytes) -> Result<()> {
        while bytes.has_remaining() {
            if bytes.remaining() < FRAME_HEADER_SIZE as usize {
                return Err(Error::InvalidRecord("truncated summary frame".to_string()));
            }
            let opcode = bytes.get_u8();
            let body_len = bytes.get_u32() as usize;
            if bytes.remaining() < body_len {
                return Err(Error::InvalidRecord("truncated summary record".to_string()));
            }
            match decode_record(opcode, bytes.split_to(body_len))? {
                Record::Schema(schema) => {
                    self.schemas.insert(schema.id, schema);
                }
                Record::Channel(channel) => {
                    self.channels.insert(channel.id, channel);
                }
                Record::ChunkIndex(entry) => self.chunks.push(entry),
                Record::Statistics(stats) => self.statistics = Some(stats),
                other => {
                    return Err(Error::InvalidRecord(format!(
                        "unexpected record in summary: {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Forward linear scan of the data section of an unindexed file,
    /// building a chunk index from chunk prefixes without decompressing.
    async fn scan_data_section(&mut self, cache: &BlockCache, size: u64) -> Result<()> {
        let data_end = size - FOOTER_SIZE;
        let mut offset = HEADER_SIZE;

        loop {
            if offset + FRAME_HEADER_SIZE > data_end {
                return Err(Error::TruncatedRecord(offset));
            }
            let mut head = cache.read(offset, FRAME_HEADER_SIZE).await?;
            let opcode = head.get_u8();
            let body_len = head.get_u32() as u64;
            if offset + FRAME_HEADER_SIZE + body_len > data_end {
                return Err(Error::TruncatedRecord(offset));
            }

            match opcode {
                OP_SCHEMA | OP_CHANNEL => {
                    let body = cache.read(offset + FRAME_HEADER_SIZE, body_len).await?;
                    match decode_record(opcode, body)? {
                        Record::Schema(schema) => {
                            self.schemas.insert(schema.id, schema);
                        }
                        Record::Channel(channel) => {
                            self.channels.insert(channel.id, channel);
                        }
                        _ => unreachable!("opcode constrained above"),
                    }
                }
                OP_CHUNK => {
                    // Prefix only; the record run stays compressed on disk
                    let prefix_len = super::CHUNK_PREFIX_SIZE.min(body_len);
                    if prefix_len < super::CHUNK_PREFIX_SIZE {
                        return Err(Error::InvalidRecord(format!(
                            "chunk at offset {offset} too short for prefix"
                        )));
                    }
                    let mut prefix = cache.read(offset + FRAME_HEADER_SIZE, prefix_len).await?;
                    let start_time = prefix.get_u64();
                    let end_time = prefix.get_u64();
                    let message_count = prefix.get_u32();
                    let compression = super::Compression::try_from(prefix.get_u8())?;
                    self.chunks.push(ChunkIndexEntry {
                        start_time,
                        end_time,
                        chunk_offset: offset,
                        chunk_length: FRAME_HEADER_SIZE + body_len,
                        message_count,
                        compression,
                    });
                }
                OP_END => return Ok(()),
                other => {
                    return Err(Error::InvalidRecord(format!(
                        "unexpected opcode 0x{other:02x} in data section at offset {offset}"
                    )))
                }
            }

            offset += FRAME_HEADER_SIZE + body_len;
        }
    }

    /// Every channel must resolve to exactly one known schema.
    fn validate_schema_references(&self) -> Result<()> {
        for channel in self.channels.values() {
            if !self.schemas.contains_key(&channel.schema_id) {
                return Err(Error::DanglingSchema {
                    channel: channel.id,
                    schema: channel.schema_id,
                });
            }
        }
        Ok(())
    }
}
