// Splits a file into fixed-size blocks, each with its own MD5 digest, and moves blocks between
// packets and disk with the digest checked on every read and write.
//
// The block size is chosen so that a file spans at least MIN_NUM_BLOCKS blocks, within the
// bounds of MIN_BLOCK_SIZE and MAX_BLOCK_SIZE. A file whose size is an exact multiple of the
// block size gets one extra empty block at the end, so the receiver always sees a short block
// last.

use md5::{Digest, Md5};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

pub const MIN_NUM_BLOCKS: u64 = 12;
pub const MIN_BLOCK_SIZE: usize = 1;
pub const MAX_BLOCK_SIZE: usize = 65464;

const HASH_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("file I/O error: {0}")]
    IO(#[from] io::Error),

    #[error("block {id}: read {actual} bytes, expected {expected}")]
    ShortRead { id: u32, expected: usize, actual: usize },

    #[error("block {id}: wrote {actual} bytes, expected {expected}")]
    ShortWrite { id: u32, expected: usize, actual: usize },

    #[error("block {id}: {actual} bytes of data for a {expected} byte block")]
    BufferTooSmall { id: u32, expected: usize, actual: usize },

    #[error("block {id}: MD5 mismatch, expected {expected}, computed {actual}")]
    DigestMismatch { id: u32, expected: String, actual: String },
}

/// Picks the block size for a file of `size` bytes.
pub fn calculate_block_size(size: u64) -> usize {
    (size / MIN_NUM_BLOCKS).clamp(MIN_BLOCK_SIZE as u64, MAX_BLOCK_SIZE as u64) as usize
}

/// Lowercase hex MD5 of a byte slice.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// Lowercase hex MD5 of a whole file, streamed in fixed-size chunks.
pub async fn hash_file(path: &Path) -> Result<String, BlockError> {
    let mut f = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0_u8; HASH_BUFFER_SIZE];
    loop {
        let read = f.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// One block of a file: where it lives and what it should hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    path: PathBuf,
    id: u32,
    offset: u64,
    size: usize,
    md5: Option<String>,
}

impl BlockInfo {
    pub fn new(path: &Path, id: u32, offset: u64, size: usize, md5: Option<String>) -> BlockInfo {
        BlockInfo {
            path: path.to_path_buf(),
            id,
            offset,
            size,
            md5,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 1-based position of the block in its file.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn md5(&self) -> Option<&str> {
        self.md5.as_deref()
    }

    /// Reads the block from disk and checks it against its digest.
    pub async fn read(&self) -> Result<Vec<u8>, BlockError> {
        let mut f = File::open(&self.path).await?;
        f.seek(SeekFrom::Start(self.offset)).await?;

        let mut buf = Vec::with_capacity(self.size);
        f.take(self.size as u64).read_to_end(&mut buf).await?;
        if buf.len() != self.size {
            return Err(BlockError::ShortRead { id: self.id, expected: self.size, actual: buf.len() });
        }

        self.verify(&buf)?;
        Ok(buf)
    }

    /// Writes the first `size` bytes of `data` at the block's offset.
    ///
    /// The file must already exist. The data is checked against the block's digest before
    /// anything is written.
    pub async fn write(&self, data: &[u8]) -> Result<(), BlockError> {
        if data.len() < self.size {
            return Err(BlockError::BufferTooSmall { id: self.id, expected: self.size, actual: data.len() });
        }
        let data = &data[..self.size];
        self.verify(data)?;

        let mut f = OpenOptions::new().write(true).open(&self.path).await?;
        f.seek(SeekFrom::Start(self.offset)).await?;
        let written = f.write(data).await?;
        f.flush().await?;
        if written != self.size {
            return Err(BlockError::ShortWrite { id: self.id, expected: self.size, actual: written });
        }
        Ok(())
    }

    fn verify(&self, data: &[u8]) -> Result<(), BlockError> {
        match &self.md5 {
            Some(expected) => {
                let actual = hash_bytes(data);
                if actual != *expected {
                    return Err(BlockError::DigestMismatch { id: self.id, expected: expected.clone(), actual });
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// A snapshot of a file split into blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    path: PathBuf,
    size: u64,
    md5: String,
    block_size: usize,
    blocks: Vec<BlockInfo>,
}

impl FileInfo {
    /// Splits the file at `path` using the block size picked by [`calculate_block_size`].
    pub async fn compute(path: &Path) -> Result<FileInfo, BlockError> {
        let size = tokio::fs::metadata(path).await?.len();
        Self::compute_with_block_size(path, calculate_block_size(size)).await
    }

    pub async fn compute_with_block_size(path: &Path, block_size: usize) -> Result<FileInfo, BlockError> {
        let block_size = block_size.max(MIN_BLOCK_SIZE);
        let md5 = hash_file(path).await?;

        let mut f = File::open(path).await?;
        let size = f.metadata().await?.len();

        let mut blocks = Vec::new();
        let mut buf = vec![0_u8; block_size];
        let mut offset = 0_u64;
        while offset < size {
            let len = (size - offset).min(block_size as u64) as usize;
            f.read_exact(&mut buf[..len]).await?;
            let id = blocks.len() as u32 + 1;
            blocks.push(BlockInfo::new(path, id, offset, len, Some(hash_bytes(&buf[..len]))));
            offset += len as u64;
        }

        if size > 0 && size % block_size as u64 == 0 {
            let id = blocks.len() as u32 + 1;
            blocks.push(BlockInfo::new(path, id, size, 0, Some(hash_bytes(&[]))));
        }

        Ok(FileInfo {
            path: path.to_path_buf(),
            size,
            md5,
            block_size,
            blocks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn md5(&self) -> &str {
        &self.md5
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
