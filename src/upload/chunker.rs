//! Chunk source
//!
//! Slices an async byte stream into fixed-size frames. Every frame is exactly
//! `chunk_size` bytes except the last, which carries whatever remains (tail
//! flush). Frames are addressed by their byte offset into the stream.

use bytes::Bytes;
use futures::Stream;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// One slice of the source stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of the first byte of `data` in the full stream
    pub offset: u64,
    pub data: Bytes,
}

impl Chunk {
    /// Number of bytes in this chunk
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of this chunk
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Lazy fixed-size chunker over an [`AsyncRead`]
pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    /// Create a chunker producing frames of `chunk_size` bytes
    ///
    /// A `chunk_size` of zero is treated as one byte.
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            offset: 0,
            exhausted: false,
        }
    }

    /// Bytes produced so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next frame, or `None` once the stream is exhausted
    pub async fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        let chunk = Chunk {
            offset: self.offset,
            data: Bytes::from(buf),
        };
        self.offset += filled as u64;
        Ok(Some(chunk))
    }

    /// Convert into a stream of frames
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Chunk>> {
        futures::stream::try_unfold(self, |mut chunker| async move {
            let chunk = chunker.next_chunk().await?;
            Ok(chunk.map(|chunk| (chunk, chunker)))
        })
    }
}

/// Number of chunks needed to cover `total_size` bytes
pub fn chunk_count(total_size: u64, chunk_size: usize) -> u64 {
    let chunk_size = chunk_size.max(1) as u64;
    total_size.div_ceil(chunk_size)
}

/// Offsets every chunk of a `total_size`-byte object starts at
pub fn planned_offsets(total_size: u64, chunk_size: usize) -> Vec<u64> {
    let chunk_size = chunk_size.max(1) as u64;
    (0..chunk_count(total_size, chunk_size as usize))
        .map(|i| i * chunk_size)
        .collect()
}
