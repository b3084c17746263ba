//! Streaming compression for local store files.
//!
//! Files are written through a [`FileEncoder`] that either passes bytes
//! straight to disk or feeds them into a zstd stream. In both cases the bytes
//! that actually reach the file are counted by a [`CountingWriter`] sitting
//! underneath the encoder, so the store can read a monotonically growing
//! size without ever closing the stream. The zstd end-of-frame marker is only
//! written by [`FileEncoder::finish`], which happens at promotion.
//!
//! | Mode       | Container | zstd level |
//! |------------|-----------|------------|
//! | `None`     | raw       | —          |
//! | `Fast`     | zstd      | 1          |
//! | `Optimal`  | zstd      | 19         |

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// zstd level used for [`CompressionMode::Fast`].
const FAST_LEVEL: i32 = 1;

/// zstd level used for [`CompressionMode::Optimal`].
const OPTIMAL_LEVEL: i32 = 19;

/// Compression applied to local store files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// Raw newline-delimited JSON.
    #[default]
    None,
    /// zstd at its fastest level.
    Fast,
    /// zstd at its highest non-ultra level.
    Optimal,
}

impl CompressionMode {
    /// All modes, in increasing order of effort.
    pub const ALL: [Self; 3] = [Self::None, Self::Fast, Self::Optimal];

    /// The tag embedded in file names for this mode.
    pub fn tag(self) -> &'static str {
        match self {
            Self::None => "plain",
            Self::Fast => "fast",
            Self::Optimal => "optimal",
        }
    }

    /// Parses a file-name tag back into a mode.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.tag() == tag)
    }

    fn zstd_level(self) -> Option<i32> {
        match self {
            Self::None => None,
            Self::Fast => Some(FAST_LEVEL),
            Self::Optimal => Some(OPTIMAL_LEVEL),
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A writer that counts the bytes passed through to `inner`.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    /// Wraps `inner` with a zero count.
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    /// Bytes accepted by `inner` so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming encoder for the active local file.
pub enum FileEncoder {
    /// Raw passthrough.
    Plain(CountingWriter<File>),
    /// zstd stream; the frame stays open until [`FileEncoder::finish`].
    Zstd(zstd::stream::write::Encoder<'static, CountingWriter<File>>),
}

impl FileEncoder {
    /// Wraps `file` in the encoder for `mode`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the zstd context cannot be created.
    pub fn new(file: File, mode: CompressionMode) -> io::Result<Self> {
        let counting = CountingWriter::new(file);
        match mode.zstd_level() {
            None => Ok(Self::Plain(counting)),
            Some(level) => Ok(Self::Zstd(zstd::stream::write::Encoder::new(counting, level)?)),
        }
    }

    /// Bytes that have reached the file so far. Grows as the encoder emits
    /// blocks; never decreases.
    pub fn bytes_on_disk(&self) -> u64 {
        match self {
            Self::Plain(writer) => writer.count(),
            Self::Zstd(encoder) => encoder.get_ref().count(),
        }
    }

    /// Writes the end-of-stream marker, flushes, and returns the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the final block or flush fails.
    pub fn finish(self) -> io::Result<File> {
        match self {
            Self::Plain(mut writer) => {
                writer.flush()?;
                Ok(writer.into_inner())
            }
            Self::Zstd(encoder) => {
                let mut writer = encoder.finish()?;
                writer.flush()?;
                Ok(writer.into_inner())
            }
        }
    }
}

impl Write for FileEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(writer) => writer.write(buf),
            Self::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(writer) => writer.flush(),
            Self::Zstd(encoder) => encoder.flush(),
        }
    }
}

impl fmt::Debug for FileEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Plain(_) => "Plain",
            Self::Zstd(_) => "Zstd",
        };
        f.debug_struct("FileEncoder")
            .field("kind", &kind)
            .field("bytes_on_disk", &self.bytes_on_disk())
            .finish()
    }
}

/// Opens a reader yielding the logical (uncompressed) record stream.
/// Callers are expected to add their own buffering on top.
///
/// # Errors
///
/// Returns an I/O error if the zstd context cannot be created.
pub fn open_decoder<'a, R: Read + 'a>(mode: CompressionMode, reader: R) -> io::Result<Box<dyn Read + 'a>> {
    match mode {
        CompressionMode::None => Ok(Box::new(reader)),
        CompressionMode::Fast | CompressionMode::Optimal => {
            Ok(Box::new(zstd::stream::read::Decoder::new(reader)?))
        }
    }
}
