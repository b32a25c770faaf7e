//! Slicing a payload into fixed-size chunks and reassembling it.
//!
//! Every chunk is `chunk_size` bytes except possibly the last. The count is
//! carried explicitly in the WRQ so a payload that is an exact multiple of
//! the chunk size still has a well-defined last chunk.

use crate::core::errors::TransferError;
use bytes::{Bytes, BytesMut};

/// `ceil(size / chunk_size)`; zero for an empty payload.
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    if size == 0 || chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64)
}

/// Byte length chunk `index` must have.
pub fn expected_chunk_len(index: u64, size: u64, chunk_size: usize) -> u64 {
    let start = index.saturating_mul(chunk_size as u64);
    size.saturating_sub(start).min(chunk_size as u64)
}

/// Pre-sliced payload held by the sending side. Slices share the payload
/// buffer, so a broadcast to many peers holds one copy.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    chunks: Vec<Bytes>,
    total: u64,
}

impl ChunkSet {
    pub fn slice(data: &Bytes, chunk_size: usize) -> Self {
        let total = data.len() as u64;
        let chunks = if chunk_size == 0 {
            Vec::new()
        } else {
            (0..data.len())
                .step_by(chunk_size)
                .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
                .collect()
        };
        Self { chunks, total }
    }

    pub fn get(&self, index: u64) -> Option<&Bytes> {
        usize::try_from(index).ok().and_then(|i| self.chunks.get(i))
    }

    pub fn len(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The chunk was accepted; `next` is the index to pull.
    More { next: u64 },
    Complete,
}

/// Receiving-side accumulator that enforces per-index chunk sizes.
#[derive(Debug)]
pub struct ChunkAssembler {
    size: u64,
    chunk_size: usize,
    chunk_count: u64,
    received: u64,
    buf: BytesMut,
}

impl ChunkAssembler {
    pub fn new(size: u64, chunk_size: usize, chunk_count: u64) -> Self {
        // Cap the up-front reservation; the declared size comes from the peer.
        let reserve = size.min(64 * 1024 * 1024) as usize;
        Self {
            size,
            chunk_size,
            chunk_count,
            received: 0,
            buf: BytesMut::with_capacity(reserve),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Progress, TransferError> {
        if self.received >= self.chunk_count {
            return Err(TransferError::MalformedChunk(format!(
                "chunk {} beyond declared count {}",
                self.received, self.chunk_count
            )));
        }
        let expected = expected_chunk_len(self.received, self.size, self.chunk_size);
        let actual = chunk.len() as u64;
        if actual != expected {
            return Err(TransferError::SizeMismatch { expected, actual });
        }

        self.buf.extend_from_slice(chunk);
        self.received += 1;
        if self.received == self.chunk_count {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::More { next: self.received })
        }
    }

    pub fn chunks_received(&self) -> u64 {
        self.received
    }

    pub fn bytes_received(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.chunk_count
    }

    pub fn assemble(self) -> Bytes {
        self.buf.freeze()
    }
}
