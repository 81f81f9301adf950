//! Error Types for the Storage and Format Layer
//!
//! Two families of failure matter to callers:
//!
//! - **I/O failures** (`Io`, `Http`, `HttpStatus`): the resource itself may
//!   be fine; these are retried with exponential backoff and, once retries
//!   are exhausted, surfaced as non-fatal problems on the affected source.
//!   `Error::is_retryable()` identifies them.
//! - **Corruption** (`InvalidMagic`, `CrcMismatch`, `TruncatedRecord`, ...):
//!   the bytes are wrong and retrying cannot help. During initialization
//!   these are fatal for the source; during chunk iteration they are
//!   isolated to the chunk that failed. `Error::is_corrupt()` identifies
//!   them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Requested range {offset}+{length} outside resource of {size} bytes")]
    RangeOutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u16),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(u8),

    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("Truncated record at offset {0}")]
    TruncatedRecord(u64),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Channel {channel} references unknown schema {schema}")]
    DanglingSchema { channel: u16, schema: u16 },

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: Box<Error> },
}

impl Error {
    /// Whether retrying the operation could plausibly succeed.
    ///
    /// Transport-level failures are retryable; 5xx and 429 responses are
    /// server-side transients; everything describing the bytes themselves
    /// is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) | Error::Http(_) => true,
            Error::HttpStatus(code) => *code >= 500 || *code == 429,
            _ => false,
        }
    }

    /// Whether this error describes corrupt or malformed file contents.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Error::InvalidMagic
                | Error::UnsupportedVersion(_)
                | Error::InvalidCompression(_)
                | Error::CrcMismatch
                | Error::TruncatedRecord(_)
                | Error::InvalidRecord(_)
                | Error::DanglingSchema { .. }
                | Error::Decompression(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_is_retryable() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"));
        assert!(err.is_retryable());
        assert!(!err.is_corrupt());
    }

    #[test]
    fn test_http_status_retryable_classes() {
        assert!(Error::HttpStatus(500).is_retryable());
        assert!(Error::HttpStatus(503).is_retryable());
        assert!(Error::HttpStatus(429).is_retryable());
        assert!(!Error::HttpStatus(404).is_retryable());
        assert!(!Error::HttpStatus(416).is_retryable());
    }

    #[test]
    fn test_corruption_is_not_retryable() {
        for err in [
            Error::InvalidMagic,
            Error::CrcMismatch,
            Error::TruncatedRecord(99),
            Error::InvalidCompression(7),
            Error::DanglingSchema { channel: 1, schema: 2 },
        ] {
            assert!(err.is_corrupt(), "{err} should be corrupt");
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }
    }
}
