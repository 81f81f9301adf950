//! Byte-Range Readers
//!
//! Everything above this layer consumes recordings through one contract:
//! open a resource, learn its size, then fetch arbitrary byte windows.
//! Two implementations exist:
//!
//! - [`FileRangeReader`] for local recordings (seek + read on `tokio::fs`)
//! - [`HttpRangeReader`] for remote recordings served over HTTP with
//!   `Range: bytes=start-end` requests
//!
//! ## Remote Semantics
//!
//! A server that supports ranges advertises `Accept-Ranges: bytes` and
//! answers range requests with `206 Partial Content`. A server that ignores
//! the range header answers `200 OK` with the full body; the reader slices
//! the window out of the body so playback still works, but every block
//! fetch re-downloads the file, so this degraded mode is reported as a
//! problem once per resource.
//!
//! Retry of transient failures happens above this layer (in the block
//! cache) so both implementations stay single-attempt and the retry policy
//! lives in exactly one place.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rewind_core::{Problem, ProblemLog};

use crate::error::{Error, Result};

/// Random access to a byte resource of known size.
#[async_trait]
pub trait ByteRangeReader: Send + Sync {
    /// Open the resource and return its total size in bytes.
    async fn open(&mut self) -> Result<u64>;

    /// Fetch `length` bytes starting at `offset`.
    ///
    /// Fails with [`Error::RangeOutOfBounds`] when the window extends past
    /// the size reported by `open()`.
    async fn read(&self, offset: u64, length: u64) -> Result<Bytes>;
}

/// Byte-range reader over a local file.
pub struct FileRangeReader {
    path: PathBuf,
    file: Option<Mutex<tokio::fs::File>>,
    size: u64,
}

impl FileRangeReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            size: 0,
        }
    }
}

#[async_trait]
impl ByteRangeReader for FileRangeReader {
    async fn open(&mut self) -> Result<u64> {
        let file = tokio::fs::File::open(&self.path).await?;
        self.size = file.metadata().await?.len();
        self.file = Some(Mutex::new(file));
        debug!(path = %self.path.display(), size = self.size, "Opened local recording");
        Ok(self.size)
    }

    async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let file = self.file.as_ref().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "reader not opened",
            ))
        })?;

        if offset + length > self.size {
            return Err(Error::RangeOutOfBounds {
                offset,
                length,
                size: self.size,
            });
        }

        let mut file = file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Byte-range reader over an HTTP resource.
pub struct HttpRangeReader {
    client: reqwest::Client,
    url: String,
    size: u64,
    accept_ranges: bool,
    degraded_warned: AtomicBool,
    problems: ProblemLog,
}

impl HttpRangeReader {
    pub fn new(url: impl Into<String>, problems: ProblemLog) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            size: 0,
            accept_ranges: false,
            degraded_warned: AtomicBool::new(false),
            problems,
        }
    }

    fn report_degraded(&self, why: &str) {
        // One problem per resource, however many reads hit the slow path
        if !self.degraded_warned.swap(true, Ordering::Relaxed) {
            warn!(url = %self.url, why, "Remote server does not serve byte ranges");
            self.problems.push(
                Problem::warn(format!("{}: {why}", self.url))
                    .with_tip("serve the recording from a host that supports HTTP range requests"),
            );
        }
    }
}

#[async_trait]
impl ByteRangeReader for HttpRangeReader {
    async fn open(&mut self) -> Result<u64> {
        let response = self.client.head(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus(status.as_u16()));
        }

        self.accept_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        self.size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidRecord("missing Content-Length".to_string()))?;

        if !self.accept_ranges {
            self.report_degraded("no Accept-Ranges: bytes header");
        }

        debug!(url = %self.url, size = self.size, accept_ranges = self.accept_ranges, "Opened remote recording");
        Ok(self.size)
    }

    async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
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

        let end = offset + length - 1;
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?;

        match response.status().as_u16() {
            206 => Ok(response.bytes().await?),
            200 => {
                // Full-body fallback: slice the window out locally
                self.report_degraded("range request answered with 200 OK");
                let body = response.bytes().await?;
                if body.len() < (offset + length) as usize {
                    return Err(Error::RangeOutOfBounds {
                        offset,
                        length,
                        size: body.len() as u64,
                    });
                }
                Ok(body.slice(offset as usize..(offset + length) as usize))
            }
            status => Err(Error::HttpStatus(status)),
        }
    }
}

/// Byte-range reader over an in-memory buffer.
///
/// Useful for tests and for playing back recordings that already live in
/// memory (drag-and-dropped files, fixtures built by `LogWriter`).
pub struct MemoryRangeReader {
    data: Bytes,
}

impl MemoryRangeReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ByteRangeReader for MemoryRangeReader {
    async fn open(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        if offset + length > self.data.len() as u64 {
            return Err(Error::RangeOutOfBounds {
                offset,
                length,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(offset as usize..(offset + length) as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn temp_reader(contents: &[u8]) -> (FileRangeReader, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        let mut reader = FileRangeReader::new(file.path());
        reader.open().await.unwrap();
        (reader, file)
    }

    #[tokio::test]
    async fn test_open_reports_size() {
        let (_reader, file) = temp_reader(&[0u8; 1234]).await;
        let mut reader = FileRangeReader::new(file.path());
        assert_eq!(reader.open().await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn test_read_window() {
        let data: Vec<u8> = (0..=255).collect();
        let (reader, _file) = temp_reader(&data).await;

        let window = reader.read(10, 5).await.unwrap();
        assert_eq!(&window[..], &[10, 11, 12, 13, 14]);
    }

    #[tokio::test]
    async fn test_read_full_then_tail() {
        let data: Vec<u8> = (0..100).collect();
        let (reader, _file) = temp_reader(&data).await;

        assert_eq!(reader.read(0, 100).await.unwrap().len(), 100);
        let tail = reader.read(95, 5).await.unwrap();
        assert_eq!(&tail[..], &[95, 96, 97, 98, 99]);
    }

    #[tokio::test]
    async fn test_read_past_end_rejected() {
        let (reader, _file) = temp_reader(&[0u8; 100]).await;

        let result = reader.read(90, 20).await;
        assert!(matches!(
            result,
            Err(Error::RangeOutOfBounds { offset: 90, length: 20, size: 100 })
        ));
    }

    #[tokio::test]
    async fn test_read_before_open_fails() {
        let reader = FileRangeReader::new("/nonexistent");
        assert!(reader.read(0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_open_missing_file_is_io_error() {
        let mut reader = FileRangeReader::new("/definitely/not/here.rwnd");
        assert!(matches!(reader.open().await, Err(Error::Io(_))));
    }
}
