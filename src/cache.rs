//! Write-through block cache for ChronoFS
//!
//! All block I/O in the volume goes through one shared cache so that a
//! preserved snapshot block written by the COW engine is immediately
//! visible to concurrent readers, without waiting for journal checkpoint.

use arrayref::array_ref;
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

struct CachedBlock {
    data: Box<[u8; BLOCK_SIZE]>,
}

/// A fixed-capacity LRU cache over a block device
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    cache: RwLock<LruCache<u64, CachedBlock>>,
}

impl BlockCache {
    /// Create a cache holding up to `capacity` blocks
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        Self {
            device,
            cache: RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    /// The underlying block device
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Read a block, from cache if resident
    pub async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(buf.len()));
        }

        {
            let cache = self.cache.read();
            if let Some(block) = cache.peek(&block_num) {
                buf.copy_from_slice(&block.data[..]);
                return Ok(());
            }
        }

        let mut block = [0u8; BLOCK_SIZE];
        self.device.read_block(block_num, &mut block).await?;

        // Another task may have inserted the block while we were reading;
        // its copy is at least as fresh (writes are write-through).
        let existing = {
            let mut cache = self.cache.write();
            if let Some(hit) = cache.peek(&block_num) {
                Some(hit.data.clone())
            } else {
                cache.push(
                    block_num,
                    CachedBlock {
                        data: Box::new(block),
                    },
                );
                None
            }
        };

        match existing {
            Some(data) => buf.copy_from_slice(&data[..]),
            None => buf.copy_from_slice(&block),
        }
        Ok(())
    }

    /// Read a block into a fresh buffer
    pub async fn read_block_vec(&self, block_num: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read_block(block_num, &mut buf).await?;
        Ok(buf)
    }

    /// Write a block through to the device and update the cache
    pub async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }

        let block_data = *array_ref!(data, 0, BLOCK_SIZE);
        self.device.write_block(block_num, &block_data).await?;

        self.cache.write().push(
            block_num,
            CachedBlock {
                data: Box::new(block_data),
            },
        );
        Ok(())
    }

    /// Drop a block from the cache (e.g. after its backing block is freed)
    pub fn invalidate(&self, block_num: u64) {
        self.cache.write().pop(&block_num);
    }

    /// Flush device-side buffers
    pub async fn sync(&self) -> Result<()> {
        self.device.sync().await
    }
}
