use std::io;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4 MB

/// How a file of `file_size` bytes splits into fixed-size chunks. Every chunk
/// is `chunk_size` bytes except possibly the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

impl ChunkPlan {
    /// `None` if `chunk_size` is zero or the file needs more than `u32::MAX`
    /// chunks.
    pub fn new(file_size: u64, chunk_size: usize) -> Option<Self> {
        let chunk_size = chunk_size as u64;
        if chunk_size == 0 {
            return None;
        }
        let total_chunks = u32::try_from(file_size.div_ceil(chunk_size)).ok()?;
        Some(Self {
            file_size,
            chunk_size,
            total_chunks,
        })
    }

    /// Byte offset and length of chunk `index`.
    pub fn range(&self, index: u32) -> (u64, usize) {
        let offset = index as u64 * self.chunk_size;
        let len = self.chunk_size.min(self.file_size.saturating_sub(offset));
        (offset, len as usize)
    }

    /// Read chunk `index` of the file at `path`. Fails with `UnexpectedEof` if
    /// the file has shrunk since the plan was made.
    pub async fn read_chunk(&self, path: &Path, index: u32) -> io::Result<Vec<u8>> {
        let (offset, len) = self.range(index);
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        let n = read_full(&mut file, &mut buf).await?;
        if n < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("chunk {} is {} bytes, file ended after {}", index, len, n),
            ));
        }
        Ok(buf)
    }
}

async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]).await? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_chunks_is_the_ceiling() {
        for (size, chunk, expected) in [
            (0, 4, 0),
            (1, 4, 1),
            (4, 4, 1),
            (5, 4, 2),
            (10_000_000, 2_500_000, 4),
            (10_000_001, 2_500_000, 5),
        ] {
            assert_eq!(ChunkPlan::new(size, chunk).unwrap().total_chunks, expected);
        }
        assert!(ChunkPlan::new(10, 0).is_none());
    }

    #[test]
    fn last_chunk_takes_the_remainder() {
        let plan = ChunkPlan::new(10, 4).unwrap();
        assert_eq!(plan.range(0), (0, 4));
        assert_eq!(plan.range(1), (4, 4));
        assert_eq!(plan.range(2), (8, 2));
    }

    #[tokio::test]
    async fn chunks_concatenate_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 253) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        for chunk_size in [1, 7, 128, 999, 1000, 4096] {
            let plan = ChunkPlan::new(data.len() as u64, chunk_size).unwrap();
            let mut joined = Vec::new();
            for index in 0..plan.total_chunks {
                joined.extend(plan.read_chunk(&path, index).await.unwrap());
            }
            assert_eq!(joined, data, "chunk size {}", chunk_size);
        }
    }

    #[tokio::test]
    async fn shrunk_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let plan = ChunkPlan::new(8, 4).unwrap();
        let err = plan.read_chunk(&path, 1).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
