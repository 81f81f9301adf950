//! Recording Fixture Writer
//!
//! `LogWriter` builds recording files in memory: schemas, channels, chunked
//! messages, and optionally a summary/index section. The playback engine
//! never writes; this builder exists for the test suites and for tooling
//! that needs to produce fixtures.
//!
//! Messages are framed into the pending chunk in call order; the writer
//! rolls a chunk once its uncompressed record run reaches the configured
//! capacity. `finish()` appends the End record, the summary (when indexed),
//! and the footer.

use bytes::{BufMut, Bytes, BytesMut};

use rewind_core::{Channel, Schema, Time};

use super::{
    ChunkIndexEntry, Compression, Statistics, FORMAT_VERSION, MAGIC, OP_CHANNEL, OP_CHUNK,
    OP_CHUNK_INDEX, OP_END, OP_MESSAGE, OP_SCHEMA, OP_STATISTICS,
};
use crate::error::{Error, Result};

/// In-memory builder of recording files.
pub struct LogWriter {
    buf: BytesMut,
    compression: Compression,
    indexed: bool,
    chunk_capacity: usize,

    schemas: Vec<Schema>,
    channels: Vec<Channel>,
    chunk_indexes: Vec<ChunkIndexEntry>,

    // pending chunk state
    chunk: BytesMut,
    chunk_start: Option<Time>,
    chunk_end: Time,
    chunk_messages: u32,

    message_count: u64,
    first_time: Option<Time>,
    last_time: Time,
}

impl LogWriter {
    pub fn new(compression: Compression, indexed: bool) -> Self {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u16(FORMAT_VERSION);
        buf.put_u16(0); // reserved

        Self {
            buf,
            compression,
            indexed,
            chunk_capacity: 1024 * 1024,
            schemas: Vec::new(),
            channels: Vec::new(),
            chunk_indexes: Vec::new(),
            chunk: BytesMut::new(),
            chunk_start: None,
            chunk_end: 0,
            chunk_messages: 0,
            message_count: 0,
            first_time: None,
            last_time: 0,
        }
    }

    /// Override the uncompressed bytes per chunk (default 1 MiB). Small
    /// capacities produce many chunks, which is what the tests want.
    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.chunk_capacity = capacity.max(1);
        self
    }

    pub fn add_schema(
        &mut self,
        id: u16,
        name: impl Into<String>,
        encoding: impl Into<String>,
        data: impl Into<Bytes>,
    ) {
        let schema = Schema {
            id,
            name: name.into(),
            encoding: encoding.into(),
            data: data.into(),
        };
        self.put_frame(OP_SCHEMA, &encode_schema(&schema));
        self.schemas.push(schema);
    }

    pub fn add_channel(
        &mut self,
        id: u16,
        schema_id: u16,
        topic: impl Into<String>,
        message_encoding: impl Into<String>,
    ) -> Result<()> {
        if !self.schemas.iter().any(|s| s.id == schema_id) {
            return Err(Error::DanglingSchema {
                channel: id,
                schema: schema_id,
            });
        }
        let channel = Channel {
            id,
            topic: topic.into(),
            schema_id,
            message_encoding: message_encoding.into(),
        };
        self.put_frame(OP_CHANNEL, &encode_channel(&channel));
        self.channels.push(channel);
        Ok(())
    }

    /// Append one message to the pending chunk.
    pub fn write_message(
        &mut self,
        channel_id: u16,
        log_time: Time,
        publish_time: Option<Time>,
        payload: &[u8],
    ) -> Result<()> {
        if !self.channels.iter().any(|c| c.id == channel_id) {
            return Err(Error::InvalidRecord(format!(
                "message references unknown channel {channel_id}"
            )));
        }

        let mut body = BytesMut::with_capacity(18 + payload.len());
        body.put_u16(channel_id);
        body.put_u64(log_time);
        body.put_u64(publish_time.unwrap_or(0));
        body.put_slice(payload);

        self.chunk.put_u8(OP_MESSAGE);
        self.chunk.put_u32(body.len() as u32);
        self.chunk.put_slice(&body);

        let start = self.chunk_start.get_or_insert(log_time);
        *start = (*start).min(log_time);
        self.chunk_end = self.chunk_end.max(log_time);
        self.chunk_messages += 1;

        let first = self.first_time.get_or_insert(log_time);
        *first = (*first).min(log_time);
        self.last_time = self.last_time.max(log_time);
        self.message_count += 1;

        if self.chunk.len() >= self.chunk_capacity {
            self.roll_chunk()?;
        }
        Ok(())
    }

    /// Flush the pending chunk into the file as a Chunk record.
    fn roll_chunk(&mut self) -> Result<()> {
        if self.chunk_messages == 0 {
            return Ok(());
        }

        let raw = std::mem::take(&mut self.chunk);
        let crc = crc32fast::hash(&raw);
        let compressed: Vec<u8> = match self.compression {
            Compression::None => raw.to_vec(),
            Compression::Lz4 => lz4_flex::compress(&raw),
            Compression::Zstd => zstd::bulk::compress(&raw, 0)?,
        };

        let start_time = self.chunk_start.take().unwrap_or(0);
        let mut body = BytesMut::with_capacity(29 + compressed.len());
        body.put_u64(start_time);
        body.put_u64(self.chunk_end);
        body.put_u32(self.chunk_messages);
        body.put_u8(self.compression as u8);
        body.put_u32(raw.len() as u32);
        body.put_u32(crc);
        body.put_slice(&compressed);

        let chunk_offset = self.buf.len() as u64;
        self.put_frame(OP_CHUNK, &body);

        self.chunk_indexes.push(ChunkIndexEntry {
            start_time,
            end_time: self.chunk_end,
            chunk_offset,
            chunk_length: self.buf.len() as u64 - chunk_offset,
            message_count: self.chunk_messages,
            compression: self.compression,
        });

        self.chunk_end = 0;
        self.chunk_messages = 0;
        Ok(())
    }

    /// Finish the file: pending chunk, End record, summary, footer.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.roll_chunk()?;
        self.put_frame(OP_END, &[]);

        let summary_offset = if self.indexed { self.buf.len() as u64 } else { 0 };

        if self.indexed {
            let schemas = std::mem::take(&mut self.schemas);
            for schema in &schemas {
                self.put_frame(OP_SCHEMA, &encode_schema(schema));
            }
            let channels = std::mem::take(&mut self.channels);
            for channel in &channels {
                self.put_frame(OP_CHANNEL, &encode_channel(channel));
            }
            let indexes = std::mem::take(&mut self.chunk_indexes);
            for entry in &indexes {
                let mut body = BytesMut::with_capacity(37);
                body.put_u64(entry.start_time);
                body.put_u64(entry.end_time);
                body.put_u64(entry.chunk_offset);
                body.put_u64(entry.chunk_length);
                body.put_u32(entry.message_count);
                body.put_u8(entry.compression as u8);
                self.put_frame(OP_CHUNK_INDEX, &body);
            }

            let mut stats = BytesMut::with_capacity(32);
            stats.put_u64(self.message_count);
            stats.put_u32(indexes.len() as u32);
            stats.put_u32(channels.len() as u32);
            stats.put_u64(self.first_time.unwrap_or(0));
            stats.put_u64(self.last_time);
            self.put_frame(OP_STATISTICS, &stats);
        }

        let summary_crc = if self.indexed {
            crc32fast::hash(&self.buf[summary_offset as usize..])
        } else {
            0
        };

        self.buf.put_u64(summary_offset);
        self.buf.put_u32(summary_crc);
        self.buf.put_u64(0); // reserved
        self.buf.put_slice(&MAGIC);

        Ok(self.buf.to_vec())
    }

    fn put_frame(&mut self, opcode: u8, body: &[u8]) {
        self.buf.put_u8(opcode);
        self.buf.put_u32(body.len() as u32);
        self.buf.put_slice(body);
    }

    /// Statistics for the messages written so far.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            message_count: self.message_count,
            chunk_count: self.chunk_indexes.len() as u32,
            channel_count: self.channels.len() as u32,
            start_time: self.first_time.unwrap_or(0),
            end_time: self.last_time,
        }
    }
}

fn encode_schema(schema: &Schema) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u16(schema.id);
    body.put_u16(schema.name.len() as u16);
    body.put_slice(schema.name.as_bytes());
    body.put_u16(schema.encoding.len() as u16);
    body.put_slice(schema.encoding.as_bytes());
    body.put_u32(schema.data.len() as u32);
    body.put_slice(&schema.data);
    body
}

fn encode_channel(channel: &Channel) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u16(channel.id);
    body.put_u16(channel.schema_id);
    body.put_u16(channel.topic.len() as u16);
    body.put_slice(channel.topic.as_bytes());
    body.put_u16(channel.message_encoding.len() as u16);
    body.put_slice(channel.message_encoding.as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_has_header_end_footer() {
        let data = LogWriter::new(Compression::None, false).finish().unwrap();
        // header + End frame + footer
        assert_eq!(data.len(), 8 + 5 + 24);
        assert_eq!(&data[0..4], &MAGIC);
        assert_eq!(&data[data.len() - 4..], &MAGIC);
    }

    #[test]
    fn test_dangling_schema_rejected() {
        let mut writer = LogWriter::new(Compression::None, true);
        let result = writer.add_channel(0, 42, "/topic", "json");
        assert!(matches!(
            result,
            Err(Error::DanglingSchema { channel: 0, schema: 42 })
        ));
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let mut writer = LogWriter::new(Compression::None, true);
        let result = writer.write_message(9, 100, None, b"x");
        assert!(matches!(result, Err(Error::InvalidRecord(_))));
    }

    #[test]
    fn test_statistics_track_writes() {
        let mut writer = LogWriter::new(Compression::None, true).with_chunk_capacity(64);
        writer.add_schema(1, "S", "jsonschema", Bytes::from_static(b"{}"));
        writer.add_channel(1, 1, "/a", "json").unwrap();
        for t in [50u64, 10, 90] {
            writer.write_message(1, t, None, b"0123456789").unwrap();
        }

        let stats = writer.statistics();
        assert_eq!(stats.message_count, 3);
        assert_eq!(stats.channel_count, 1);
        assert_eq!(stats.start_time, 10);
        assert_eq!(stats.end_time, 90);
    }
}
