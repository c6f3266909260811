//! Fixed-size chunk planning for one file.

use bytes::Bytes;
use std::{io, ops::Range};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, SeekFrom},
};

/// Ordered byte ranges covering a file of `file_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkPlan {
    /// Plan `ceil(file_size / chunk_size)` chunks. A zero `chunk_size` is
    /// treated as one byte.
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let total = file_size.div_ceil(chunk_size);
        Self {
            file_size,
            chunk_size,
            total_chunks: u32::try_from(total).unwrap_or(u32::MAX),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// An empty file has nothing to send.
    pub fn is_empty(&self) -> bool {
        self.total_chunks == 0
    }

    /// `[i*C, min(size, i*C + C))`, or `None` past the last chunk.
    pub fn range(&self, index: u32) -> Option<Range<u64>> {
        if index >= self.total_chunks {
            return None;
        }
        let start = u64::from(index) * self.chunk_size;
        let end = self.file_size.min(start + self.chunk_size);
        Some(start..end)
    }

    /// Length of chunk `index`, 0 past the end.
    pub fn chunk_len(&self, index: u32) -> u64 {
        self.range(index).map(|r| r.end - r.start).unwrap_or(0)
    }

    pub fn ranges(&self) -> impl Iterator<Item = (u32, Range<u64>)> + '_ {
        (0..self.total_chunks).filter_map(move |i| self.range(i).map(|r| (i, r)))
    }
}

/// Read one planned chunk from an open file.
pub async fn read_chunk(file: &mut File, plan: &ChunkPlan, index: u32) -> io::Result<Bytes> {
    let range = plan.range(index).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("chunk {} out of range ({} chunks)", index, plan.total_chunks()),
        )
    })?;
    let len = usize::try_from(range.end - range.start)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk too large"))?;

    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
