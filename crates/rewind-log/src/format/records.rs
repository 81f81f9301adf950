//! Record Decoding
//!
//! Every heterogeneous record shape in the format maps to one variant of
//! the [`Record`] enum, and every consumer dispatches over it with an
//! exhaustive match. Decoding validates lengths before every read so that
//! truncated or hostile input surfaces as an error, never a panic.

use bytes::{Buf, Bytes};

use rewind_core::{Channel, Schema, Time};

use super::{
    ChunkIndexEntry, Compression, Statistics, CHUNK_PREFIX_SIZE, OP_CHANNEL, OP_CHUNK,
    OP_CHUNK_INDEX, OP_END, OP_MESSAGE, OP_SCHEMA, OP_STATISTICS,
};
use crate::error::{Error, Result};

/// One message as stored on the wire, before channel resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub channel_id: u16,
    pub log_time: Time,
    /// `None` when the recording carried no producer timestamp
    pub publish_time: Option<Time>,
    pub data: Bytes,
}

/// A chunk record: prefix plus the (still compressed) record run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub start_time: Time,
    pub end_time: Time,
    pub message_count: u32,
    pub compression: Compression,
    pub uncompressed_size: u32,
    pub uncompressed_crc: u32,
    pub records: Bytes,
}

/// A decoded record of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Schema(Schema),
    Channel(Channel),
    Message(MessageRecord),
    Chunk(ChunkRecord),
    ChunkIndex(ChunkIndexEntry),
    Statistics(Statistics),
    End,
}

fn need(buf: &impl Buf, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        Err(Error::InvalidRecord(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

fn get_string(buf: &mut Bytes, what: &str) -> Result<String> {
    need(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    need(buf, len, what)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::InvalidRecord(format!("{what} is not valid UTF-8")))
}

/// Decode one record body. `chunk_offset` is the file offset of the frame,
/// used to fill in [`ChunkIndexEntry`]-style errors.
pub fn decode_record(opcode: u8, mut body: Bytes) -> Result<Record> {
    match opcode {
        OP_SCHEMA => {
            need(&body, 2, "schema id")?;
            let id = body.get_u16();
            let name = get_string(&mut body, "schema name")?;
            let encoding = get_string(&mut body, "schema encoding")?;
            need(&body, 4, "schema data length")?;
            let data_len = body.get_u32() as usize;
            need(&body, data_len, "schema data")?;
            let data = body.split_to(data_len);
            Ok(Record::Schema(Schema {
                id,
                name,
                encoding,
                data,
            }))
        }
        OP_CHANNEL => {
            need(&body, 4, "channel header")?;
            let id = body.get_u16();
            let schema_id = body.get_u16();
            let topic = get_string(&mut body, "channel topic")?;
            let message_encoding = get_string(&mut body, "channel encoding")?;
            Ok(Record::Channel(Channel {
                id,
                topic,
                schema_id,
                message_encoding,
            }))
        }
        OP_MESSAGE => {
            need(&body, 18, "message header")?;
            let channel_id = body.get_u16();
            let log_time = body.get_u64();
            let publish_time = match body.get_u64() {
                0 => None,
                t => Some(t),
            };
            Ok(Record::Message(MessageRecord {
                channel_id,
                log_time,
                publish_time,
                data: body,
            }))
        }
        OP_CHUNK => {
            need(&body, CHUNK_PREFIX_SIZE as usize, "chunk prefix")?;
            let start_time = body.get_u64();
            let end_time = body.get_u64();
            let message_count = body.get_u32();
            let compression = Compression::try_from(body.get_u8())?;
            let uncompressed_size = body.get_u32();
            let uncompressed_crc = body.get_u32();
            Ok(Record::Chunk(ChunkRecord {
                start_time,
                end_time,
                message_count,
                compression,
                uncompressed_size,
                uncompressed_crc,
                records: body,
            }))
        }
        OP_CHUNK_INDEX => {
            need(&body, 37, "chunk index")?;
            let start_time = body.get_u64();
            let end_time = body.get_u64();
            let chunk_offset = body.get_u64();
            let chunk_length = body.get_u64();
            let message_count = body.get_u32();
            let compression = Compression::try_from(body.get_u8())?;
            Ok(Record::ChunkIndex(ChunkIndexEntry {
                start_time,
                end_time,
                chunk_offset,
                chunk_length,
                message_count,
                compression,
            }))
        }
        OP_STATISTICS => {
            need(&body, 32, "statistics")?;
            let message_count = body.get_u64();
            let chunk_count = body.get_u32();
            let channel_count = body.get_u32();
            let start_time = body.get_u64();
            let end_time = body.get_u64();
            Ok(Record::Statistics(Statistics {
                message_count,
                chunk_count,
                channel_count,
                start_time,
                end_time,
            }))
        }
        OP_END => Ok(Record::End),
        other => Err(Error::InvalidRecord(format!("unknown opcode 0x{other:02x}"))),
    }
}

/// Decompress a chunk's record run and verify its checksum.
pub fn decompress_chunk(chunk: &ChunkRecord) -> Result<Bytes> {
    let raw = match chunk.compression {
        Compression::None => chunk.records.clone(),
        Compression::Lz4 => {
            let out = lz4_flex::decompress(&chunk.records, chunk.uncompressed_size as usize)
                .map_err(|e| Error::Decompression(e.to_string()))?;
            Bytes::from(out)
        }
        Compression::Zstd => {
            let out = zstd::bulk::decompress(&chunk.records, chunk.uncompressed_size as usize)
                .map_err(|e| Error::Decompression(e.to_string()))?;
            Bytes::from(out)
        }
    };

    if raw.len() != chunk.uncompressed_size as usize {
        return Err(Error::Decompression(format!(
            "expected {} uncompressed bytes, got {}",
            chunk.uncompressed_size,
            raw.len()
        )));
    }
    if crc32fast::hash(&raw) != chunk.uncompressed_crc {
        return Err(Error::CrcMismatch);
    }
    Ok(raw)
}
