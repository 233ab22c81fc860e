//! Byte-chunk suppliers feeding the record parser
//!
//! A [`ChunkSource`] hands out successive chunks of raw bytes with no regard
//! for record boundaries; the line splitter stitches records back together.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use slotbatch_core::error::{Error, Result};
use tracing::debug;

/// Default read size for file and stream suppliers (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Supplier of opaque byte chunks
pub trait ChunkSource {
    /// Next chunk of bytes
    /// Returns None when exhausted
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

impl<C: ChunkSource + ?Sized> ChunkSource for Box<C> {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).next_chunk()
    }
}

/// Chunks already held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryChunks {
    chunks: VecDeque<Vec<u8>>,
}

impl MemoryChunks {
    /// Serve the given chunks in order
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }

    /// Split `data` into chunks of at most `chunk_size` bytes
    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("Chunk size must be positive".into()));
        }
        Ok(Self {
            chunks: data.chunks(chunk_size).map(<[u8]>::to_vec).collect(),
        })
    }

    /// Number of chunks not yet served
    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }
}

impl ChunkSource for MemoryChunks {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.chunks.pop_front())
    }
}

/// Chunks pulled from any [`Read`] implementation
#[derive(Debug)]
pub struct ReaderChunks<R> {
    /// Underlying reader
    reader: R,

    /// Maximum bytes per chunk
    chunk_size: usize,

    /// Total bytes read so far
    bytes_read: u64,

    /// Whether the reader hit end of input
    exhausted: bool,
}

impl<R: Read> ReaderChunks<R> {
    /// Wrap a reader
    pub fn new(reader: R, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("Chunk size must be positive".into()));
        }
        Ok(Self {
            reader,
            chunk_size,
            bytes_read: 0,
            exhausted: false,
        })
    }

    /// Get the number of bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Unwrap the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl ReaderChunks<File> {
    /// Open a file for chunked reading
    pub fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        debug!(path = %path.display(), chunk_size, "opened chunked file reader");
        Self::new(file, chunk_size)
    }
}

impl<R: Read> ChunkSource for ReaderChunks<R> {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buffer = vec![0; self.chunk_size];
        let read = loop {
            match self.reader.read(&mut buffer) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        };

        if read == 0 {
            self.exhausted = true;
            debug!(bytes_read = self.bytes_read, "chunk reader reached end of input");
            return Ok(None);
        }

        // Update stats
        self.bytes_read += read as u64;
        buffer.truncate(read);
        Ok(Some(buffer))
    }
}
