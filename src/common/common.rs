// SPDX-License-Identifier: GPL-2.0-or-later

pub mod time;
pub mod track;

pub use track::*;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, ops::Deref, sync::Arc};
use thiserror::Error;
use time::{DurationMicros, Micros};

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

// Input container formats the demuxers understand.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
    Webm,
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerFormat::Mp4 => f.write_str("mp4"),
            ContainerFormat::Webm => f.write_str("webm"),
        }
    }
}

// Location of one sample within the source byte stream.
// Timestamps are in the owning track's timescale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplePosition {
    pub file_offset: u64,
    pub size: u32,
    pub dts: i64,
    pub cts: i64,
    pub duration: u32,
    pub is_keyframe: bool,
}

// One demuxer parse product handed to the pipeline.
#[derive(Debug, PartialEq, Eq)]
pub enum DemuxEvent {
    Track(Track),

    // Sample positions in decode order, timestamps in the
    // owning track's timescale.
    Samples {
        track_id: TrackId,
        positions: Vec<SamplePosition>,
    },
}

// One encoded frame with timestamps normalized to microseconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedChunk {
    pub track_id: TrackId,
    pub data: Bytes,
    pub timestamp: Micros,
    pub duration: DurationMicros,
    pub is_keyframe: bool,
}

impl EncodedChunk {
    // Position-derived chunk with timestamps rescaled from `timescale`.
    #[must_use]
    pub fn from_position(track_id: TrackId, pos: &SamplePosition, timescale: u32, data: Bytes) -> Self {
        Self {
            track_id,
            data,
            timestamp: Micros::new(time::timescale_to_micros(pos.cts, timescale.into())),
            duration: DurationMicros::new(time::timescale_to_micros(
                pos.duration.into(),
                timescale.into(),
            )),
            is_keyframe: pos.is_keyframe,
        }
    }
}

pub type ArcLogger = Arc<dyn ILogger + Send + Sync>;

pub trait ILogger {
    /// Send log.
    fn log(&self, _: LogEntry) {}
}

/// Log entry.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: LogSource,
    pub track_id: Option<TrackId>,
    pub message: String,
}

impl LogEntry {
    #[must_use]
    pub fn new(
        level: LogLevel,
        source: &'static str,
        track_id: Option<TrackId>,
        message: String,
    ) -> Self {
        let source: LogSource = source.try_into().expect("source should be valid");
        Self {
            level,
            source,
            track_id,
            message,
        }
    }
}

/// Severity of the log message.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Something requires attention.
    Error,

    /// Something may require attention.
    Warning,

    /// Standard information.
    Info,

    /// Verbose debugging information.
    Debug,
}

pub const LOG_SOURCE_MAX_LENGTH: usize = 8;

#[repr(transparent)]
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, PartialOrd, Ord)]
pub struct LogSource(Cow<'static, str>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseLogSourceError {
    #[error("empty string")]
    Empty,

    #[error("invalid characters: '{0}'")]
    InvalidChars(String),

    #[error("too long")]
    TooLong,
}

impl TryFrom<&'static str> for LogSource {
    type Error = ParseLogSourceError;

    fn try_from(s: &'static str) -> Result<Self, Self::Error> {
        use ParseLogSourceError::*;
        if s.is_empty() {
            return Err(Empty);
        }
        if !s.chars().all(char::is_alphanumeric) {
            return Err(InvalidChars(s.to_owned()));
        }
        if s.len() > LOG_SOURCE_MAX_LENGTH {
            return Err(TooLong);
        }
        Ok(Self(Cow::Borrowed(s)))
    }
}

impl Deref for LogSource {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// Logger that discards everything. Tests and embedders
// without a log sink use this.
pub struct DummyLogger;

impl DummyLogger {
    #[must_use]
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> ArcLogger {
        Arc::new(Self {})
    }
}

impl ILogger for DummyLogger {
    fn log(&self, _: LogEntry) {}
}

// Logger that prints to stdout.
pub struct StdoutLogger;

impl StdoutLogger {
    #[must_use]
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> ArcLogger {
        Arc::new(Self {})
    }
}

impl ILogger for StdoutLogger {
    fn log(&self, entry: LogEntry) {
        match entry.track_id {
            Some(id) => println!("[{}] {}: track {}: {}", entry.source, level(entry.level), id, entry.message),
            None => println!("[{}] {}: {}", entry.source, level(entry.level), entry.message),
        }
    }
}

fn level(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warning => "warning",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    }
}

// Random-access byte source. A read past the end returns a short
// or empty buffer, never an error.
#[async_trait]
pub trait SourceReader {
    async fn read(&mut self, offset: u64, len: u32) -> Result<Bytes, DynError>;

    // Total size if known up front.
    fn size(&self) -> Option<u64>;
}

pub type DynSourceReader = Box<dyn SourceReader + Send>;

// In-memory reader backed by a byte slice.
pub struct SliceReader(Bytes);

impl SliceReader {
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self(data)
    }
}

#[async_trait]
impl SourceReader for SliceReader {
    async fn read(&mut self, offset: u64, len: u32) -> Result<Bytes, DynError> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(Bytes::new());
        };
        if offset >= self.0.len() {
            return Ok(Bytes::new());
        }
        let end = std::cmp::min(offset + usize::try_from(len)?, self.0.len());
        Ok(self.0.slice(offset..end))
    }

    fn size(&self) -> Option<u64> {
        Some(u64::try_from(self.0.len()).expect("u64 fit usize"))
    }
}

// Output sink for the muxers. `update_data_at` rewrites already
// written bytes and exists for deferred length patching.
// `remove` discards a partial output after an abort or error.
#[async_trait]
pub trait OutputWriter {
    async fn write(&mut self, buf: Bytes) -> Result<(), DynError>;

    async fn update_data_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), DynError>;

    fn written_byte_count(&self) -> u64;

    async fn finish(&mut self) -> Result<(), DynError>;

    async fn remove(&mut self);
}

pub type DynOutputWriter = Box<dyn OutputWriter + Send>;

#[derive(Debug, Error)]
pub enum MemoryWriterError {
    #[error("update at {offset}..{end} outside written range {len}")]
    UpdateOutOfRange { offset: u64, end: u64, len: u64 },
}

// Writer that accumulates the output in memory and hands it
// out as one buffer on save.
#[derive(Default)]
pub struct MemoryWriter {
    buf: Vec<u8>,
}

impl MemoryWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

#[async_trait]
impl OutputWriter for MemoryWriter {
    async fn write(&mut self, buf: Bytes) -> Result<(), DynError> {
        self.buf.extend_from_slice(&buf);
        Ok(())
    }

    async fn update_data_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), DynError> {
        let start = usize::try_from(offset)?;
        let end = start + buf.len();
        if end > self.buf.len() {
            return Err(Box::new(MemoryWriterError::UpdateOutOfRange {
                offset,
                end: u64::try_from(end)?,
                len: u64::try_from(self.buf.len())?,
            }));
        }
        self.buf[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn written_byte_count(&self) -> u64 {
        u64::try_from(self.buf.len()).expect("u64 fit usize")
    }

    async fn finish(&mut self) -> Result<(), DynError> {
        Ok(())
    }

    async fn remove(&mut self) {
        self.buf.clear();
    }
}

// Cloneable handle over a `MemoryWriter`, for callers that hand
// the writer to a muxer but still need the bytes back afterwards.
#[derive(Clone, Default)]
pub struct SharedMemoryWriter(Arc<std::sync::Mutex<MemoryWriter>>);

impl SharedMemoryWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Copy of everything written so far.
    #[must_use]
    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.lock().expect("not poisoned").buf)
    }
}

// The lock is never held across an await point.
#[async_trait]
impl OutputWriter for SharedMemoryWriter {
    async fn write(&mut self, buf: Bytes) -> Result<(), DynError> {
        self.0
            .lock()
            .expect("not poisoned")
            .buf
            .extend_from_slice(&buf);
        Ok(())
    }

    async fn update_data_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), DynError> {
        let mut inner = self.0.lock().expect("not poisoned");
        let start = usize::try_from(offset)?;
        let end = start + buf.len();
        if end > inner.buf.len() {
            return Err(Box::new(MemoryWriterError::UpdateOutOfRange {
                offset,
                end: u64::try_from(end)?,
                len: u64::try_from(inner.buf.len())?,
            }));
        }
        inner.buf[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn written_byte_count(&self) -> u64 {
        self.0.lock().expect("not poisoned").written_byte_count()
    }

    async fn finish(&mut self) -> Result<(), DynError> {
        Ok(())
    }

    async fn remove(&mut self) {
        self.0.lock().expect("not poisoned").buf.clear();
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_slice_reader() {
        let mut r = SliceReader::new(Bytes::from_static(b"abcdef"));
        assert_eq!(Some(6), r.size());
        assert_eq!(Bytes::from_static(b"cd"), r.read(2, 2).await.unwrap());
        assert_eq!(Bytes::from_static(b"ef"), r.read(4, 100).await.unwrap());
        assert_eq!(Bytes::new(), r.read(6, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_writer() {
        let mut w = MemoryWriter::new();
        w.write(Bytes::from_static(b"0123")).await.unwrap();
        w.write(Bytes::from_static(b"4567")).await.unwrap();
        assert_eq!(8, w.written_byte_count());

        w.update_data_at(2, b"ab").await.unwrap();
        assert!(w.update_data_at(7, b"xx").await.is_err());
        w.finish().await.unwrap();

        assert_eq!(Bytes::from_static(b"01ab4567"), w.into_bytes());
    }

    #[test]
    fn test_chunk_from_position() {
        let pos = SamplePosition {
            file_offset: 100,
            size: 4,
            dts: 90000,
            cts: 93000,
            duration: 3000,
            is_keyframe: true,
        };
        let chunk =
            EncodedChunk::from_position(TrackId::new(1), &pos, 90000, Bytes::from_static(b"data"));
        assert_eq!(Micros::new(1_033_333), chunk.timestamp);
        assert_eq!(DurationMicros::new(33_333), chunk.duration);
        assert!(chunk.is_keyframe);
    }
}
