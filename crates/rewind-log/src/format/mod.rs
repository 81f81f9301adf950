//! Chunked Recording Format
//!
//! This module implements the binary file format consumed by the playback
//! engine: self-describing records (schemas, channels, messages) grouped
//! into compressed chunks, optionally followed by a summary section that
//! enables direct time-based seeking.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (8 bytes)                                            │
//! │ - Magic bytes: "RWND" (4 bytes)                             │
//! │ - Version: 1 (2 bytes)                                      │
//! │ - Reserved (2 bytes)                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Data section: framed records                                │
//! │ - Schema / Channel records (before first use)               │
//! │ - Chunk records (compressed runs of Message records)        │
//! │ - End record (data terminator)                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Summary section (indexed files only)                        │
//! │ - Schema / Channel records repeated                         │
//! │ - One ChunkIndex record per chunk                           │
//! │ - Statistics record                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Footer (24 bytes)                                           │
//! │ - Summary offset (8 bytes, 0 = unindexed)                   │
//! │ - CRC32 of the summary section (4 bytes)                    │
//! │ - Reserved (8 bytes)                                        │
//! │ - Magic bytes: "RWND" again (4 bytes)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every record is framed as `opcode (1 byte) | body length (4 bytes) |
//! body`. Integers are big-endian.
//!
//! ## Chunks
//!
//! Message records never appear bare in the data section; they live inside
//! chunks. A chunk's body starts with a fixed prefix (time range, message
//! count, compression, uncompressed size and CRC32) followed by the
//! compressed run of Message records. The prefix is enough to index a chunk
//! without decompressing it, which is what makes the unindexed linear scan
//! cheap: the scan walks frames and reads 29-byte prefixes only.
//!
//! ## Indexed vs Unindexed
//!
//! A non-zero summary offset in the footer marks an indexed file: the
//! reader jumps to the summary, verifies its CRC, and can binary-search
//! ChunkIndex records by time. A zero offset means the reader scans the
//! data section forward, building the same index opportunistically from
//! chunk prefixes.
//!
//! ## Corruption Isolation
//!
//! The footer CRC covers the summary section only; each chunk carries its
//! own CRC over the uncompressed records. A flipped byte inside one chunk
//! fails that chunk's checksum and is skipped by the iterator with a
//! problem; surrounding chunks decode normally.

mod reader;
mod records;
mod writer;

pub use reader::{ChunkedLogReader, LogSummary};
pub use records::{ChunkRecord, MessageRecord, Record};
pub use writer::LogWriter;

use serde::{Deserialize, Serialize};

use rewind_core::Time;

/// Magic bytes for recording files: "RWND"
pub const MAGIC: [u8; 4] = [0x52, 0x57, 0x4E, 0x44];

/// Version number for the recording format
pub const FORMAT_VERSION: u16 = 1;

/// File header size (8 bytes)
pub const HEADER_SIZE: u64 = 8;

/// File footer size (24 bytes)
pub const FOOTER_SIZE: u64 = 24;

/// Record frame header: opcode (1 byte) + body length (4 bytes)
pub const FRAME_HEADER_SIZE: u64 = 5;

/// Fixed chunk-body prefix preceding the compressed records
pub const CHUNK_PREFIX_SIZE: u64 = 29;

pub const OP_SCHEMA: u8 = 0x01;
pub const OP_CHANNEL: u8 = 0x02;
pub const OP_MESSAGE: u8 = 0x03;
pub const OP_CHUNK: u8 = 0x04;
pub const OP_CHUNK_INDEX: u8 = 0x05;
pub const OP_STATISTICS: u8 = 0x06;
pub const OP_END: u8 = 0x07;

/// Compression applied to a chunk's record run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl TryFrom<u8> for Compression {
    type Error = crate::Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            2 => Ok(Compression::Zstd),
            _ => Err(crate::Error::InvalidCompression(value)),
        }
    }
}

/// Location and time coverage of one chunk, from the summary or a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndexEntry {
    /// Timestamp of the earliest message in the chunk
    pub start_time: Time,

    /// Timestamp of the latest message in the chunk
    pub end_time: Time,

    /// File offset of the chunk's record frame
    pub chunk_offset: u64,

    /// Total length of the chunk's record frame in bytes
    pub chunk_length: u64,

    /// Number of messages in the chunk
    pub message_count: u32,

    /// Compression of the chunk's record run
    pub compression: Compression,
}

/// Whole-file statistics from the summary section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    /// Total messages across all chunks
    pub message_count: u64,

    /// Number of chunks in the file
    pub chunk_count: u32,

    /// Number of channels in the file
    pub channel_count: u32,

    /// Earliest message timestamp
    pub start_time: Time,

    /// Latest message timestamp
    pub end_time: Time,
}
