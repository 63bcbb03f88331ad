use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use ulid::Ulid;

use crate::error::{Result, StrataError};
use crate::types::{Block, BlockInfo, BlockRef, ByteRange};

/// Content-addressed store of immutable block files.
///
/// Blocks are written to `tmp/` first and renamed into `block/{hash}` once
/// complete; the rename is the commit point, and renaming over an existing
/// block of the same hash is harmless because content is deterministic
/// from the hash.
pub struct BlockStore {
    data_dir: PathBuf,
    block_size: usize,
}

impl BlockStore {
    pub fn new(data_dir: impl Into<PathBuf>, block_size: usize) -> Result<Self> {
        let store = Self {
            data_dir: data_dir.into(),
            block_size,
        };
        std::fs::create_dir_all(store.tmp_dir())?;
        std::fs::create_dir_all(store.block_dir())?;
        Ok(store)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Chunk a byte stream into blocks and store each one, returning one
    /// `BlockRef` per chunk.
    ///
    /// Chunking is line-preserving: a block accumulates whole lines until
    /// adding the next line would push it past the block size. The final
    /// block is always strictly smaller than the block size so readers can
    /// recognize the end of the sequence; if the data happens to fill the
    /// last block exactly, an empty terminal block is appended.
    pub async fn put_blocks<S>(&self, mut stream: S) -> Result<Vec<BlockRef>>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let mut refs = Vec::new();
        let mut current: Vec<u8> = Vec::with_capacity(self.block_size);
        let mut line: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for &byte in chunk.iter() {
                line.push(byte);
                if byte == b'\n' {
                    self.push_line(&mut current, &mut line, &mut refs).await?;
                }
            }
        }
        if !line.is_empty() {
            // trailing bytes without a newline still form a line
            self.push_line(&mut current, &mut line, &mut refs).await?;
        }
        if current.len() >= self.block_size {
            refs.push(self.write_block(&current).await?);
            current.clear();
        }
        refs.push(self.write_block(&current).await?);
        Ok(refs)
    }

    async fn push_line(
        &self,
        current: &mut Vec<u8>,
        line: &mut Vec<u8>,
        refs: &mut Vec<BlockRef>,
    ) -> Result<()> {
        if !current.is_empty() && current.len() + line.len() > self.block_size {
            refs.push(self.write_block(current).await?);
            current.clear();
        }
        current.append(line);
        Ok(())
    }

    /// Store one already-chunked block verbatim. Used when a peer places
    /// a block on its home shard; the content must not be re-chunked.
    pub async fn put_block(&self, data: &[u8]) -> Result<BlockRef> {
        self.write_block(data).await
    }

    /// Write one block; dedup against an existing block of the same hash.
    async fn write_block(&self, data: &[u8]) -> Result<BlockRef> {
        let hash = compute_block_hash(data);
        let block = Block::new(hash);
        let block_path = self.block_path(&block);
        let tmp_path = self.tmp_dir().join(Ulid::new().to_string());

        if let Err(err) = self.write_tmp(&tmp_path, data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if fs::try_exists(&block_path).await? {
            fs::remove_file(&tmp_path).await?;
        } else {
            fs::rename(&tmp_path, &block_path).await?;
            tracing::debug!("stored block {}", block.hash);
        }

        Ok(BlockRef {
            block,
            range: ByteRange {
                lower: 0,
                upper: data.len() as u64,
            },
        })
    }

    async fn write_tmp(&self, tmp_path: &Path, data: &[u8]) -> Result<()> {
        let mut file = fs::File::create(tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read `[offset, offset + size)` of a block, capped at its end.
    pub async fn get_block(&self, block: &Block, offset: u64, size: u64) -> Result<Bytes> {
        let path = self.block_path(block);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::NotFound(format!("block {}", block.hash)));
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata().await?.len();
        if offset >= len {
            return Ok(Bytes::new());
        }
        let take = size.min(len - offset);
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; take as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    pub async fn inspect_block(&self, block: &Block) -> Result<BlockInfo> {
        let meta = match fs::metadata(self.block_path(block)).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::NotFound(format!("block {}", block.hash)));
            }
            Err(err) => return Err(err.into()),
        };
        let created: DateTime<Utc> = meta.modified()?.into();
        Ok(BlockInfo {
            block: block.clone(),
            created,
            size_bytes: meta.len(),
        })
    }

    pub async fn has_block(&self, block: &Block) -> Result<bool> {
        Ok(fs::try_exists(self.block_path(block)).await?)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    fn block_dir(&self) -> PathBuf {
        self.data_dir.join("block")
    }

    fn block_path(&self, block: &Block) -> PathBuf {
        self.block_dir().join(&block.hash)
    }
}

/// Hex SHA-256 of the block contents; the block's identity.
pub fn compute_block_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
