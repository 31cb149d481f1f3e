//! Block allocation over block groups
//!
//! Each group owns one mutex guarding both its live block bitmap and its
//! exclude bitmap. The COW bitmap freeze takes the same mutex, which is
//! what makes the frozen copy a consistent point-in-time view: any task
//! that allocates or frees blocks in the group must hold this lock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::cache::BlockCache;
use crate::layout::{block_group, group_offset, Layout, BLOCKS_PER_GROUP};

/// Error type for allocator operations
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("I/O error: {0}")]
    Io(#[from] BlockDeviceError),
    #[error("No free blocks available")]
    OutOfSpace,
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u64),
    #[error("Block {0} is already free")]
    BlockAlreadyFree(u64),
}

/// Get bit `idx` from a bitmap byte slice
fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    (bitmap[(idx / 8) as usize] >> (idx % 8)) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice
fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    bitmap[(idx / 8) as usize] |= 1 << (idx % 8);
}

/// Clear bit `idx` in a bitmap byte slice
fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    bitmap[(idx / 8) as usize] &= !(1 << (idx % 8));
}

/// The two bitmaps a group keeps in memory, guarded by one lock
struct GroupBits {
    /// Live block bitmap: bit set = block allocated
    bitmap: Vec<u8>,
    /// Exclude bitmap: bit set = block belongs to snapshot storage or an
    /// excluded file, and must not appear in a frozen generation bitmap
    exclude: Vec<u8>,
}

/// Per-group allocation state
pub struct GroupInfo {
    bits: Mutex<GroupBits>,
    /// Resolved physical block of this group's frozen generation bitmap
    /// for the current active snapshot (0 = not yet materialized)
    cow_bitmap_blk: AtomicU64,
    free_blocks: AtomicU64,
    nblocks: u32,
}

/// Block groups of a volume: live bitmaps, exclude bitmaps and the
/// per-group generation-bitmap cache slots
pub struct BlockGroups {
    layout: Layout,
    groups: Vec<GroupInfo>,
    free_blocks: AtomicU64,
}

impl BlockGroups {
    /// Build freshly formatted groups: reserved metadata blocks allocated,
    /// everything else free. Bits past the end of a partial group are kept
    /// permanently set so they are never handed out.
    pub fn new_formatted(layout: Layout) -> Self {
        let bitmap_bytes = (BLOCKS_PER_GROUP / 8) as usize;
        let mut groups = Vec::with_capacity(layout.group_count as usize);
        let mut total_free = 0u64;

        for g in 0..layout.group_count {
            let nblocks = layout.blocks_in_group(g);
            let mut bitmap = vec![0u8; bitmap_bytes];
            for bit in nblocks..BLOCKS_PER_GROUP as u32 {
                bitmap_set(&mut bitmap, bit);
            }

            let group_start = layout.group_start(g);
            let mut reserved = 0u32;
            for off in 0..nblocks {
                if layout.is_reserved_block(group_start + off as u64) {
                    bitmap_set(&mut bitmap, off);
                    reserved += 1;
                }
            }

            let free = (nblocks - reserved) as u64;
            total_free += free;
            groups.push(GroupInfo {
                bits: Mutex::new(GroupBits {
                    bitmap,
                    exclude: vec![0u8; bitmap_bytes],
                }),
                cow_bitmap_blk: AtomicU64::new(0),
                free_blocks: AtomicU64::new(free),
                nblocks,
            });
        }

        log::info!(
            "alloc: formatted {} groups, {} free blocks",
            layout.group_count,
            total_free
        );

        Self {
            layout,
            groups,
            free_blocks: AtomicU64::new(total_free),
        }
    }

    /// The layout these groups were built from
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Total free blocks across all groups
    pub fn free_count(&self) -> u64 {
        self.free_blocks.load(Ordering::Relaxed)
    }

    fn group(&self, group: u32) -> Option<&GroupInfo> {
        self.groups.get(group as usize)
    }

    fn check_range(&self, start: u64, count: u32) -> Result<(), AllocError> {
        let end = start + count as u64;
        if count == 0 || end > self.layout.block_count {
            return Err(AllocError::InvalidBlockNumber(start));
        }
        Ok(())
    }

    /// Allocate up to `count` contiguous blocks, preferring the free run
    /// closest after `goal` in the goal's own group, falling back to a
    /// scan of the remaining groups. Returns the start and length of the
    /// run actually claimed (at least 1 block).
    pub fn allocate_near(&self, goal: u64, count: u32) -> Result<(u64, u32), AllocError> {
        let goal = goal.min(self.layout.block_count - 1);
        let goal_group = block_group(goal);
        let ngroups = self.groups.len() as u32;

        for pass in 0..ngroups {
            let g = (goal_group + pass) % ngroups;
            let from = if pass == 0 { group_offset(goal) } else { 0 };
            if let Some(run) = self.allocate_in_group(g, from, count) {
                return Ok(run);
            }
            // wrap around to the front of the goal group
            if pass == 0 && from != 0 {
                if let Some(run) = self.allocate_in_group(g, 0, count) {
                    return Ok(run);
                }
            }
        }

        Err(AllocError::OutOfSpace)
    }

    fn allocate_in_group(&self, group: u32, from: u32, count: u32) -> Option<(u64, u32)> {
        let info = self.group(group)?;
        if info.free_blocks.load(Ordering::Relaxed) == 0 {
            return None;
        }

        let mut bits = info.bits.lock();
        let mut start = None;
        for off in from..info.nblocks {
            if !bitmap_get(&bits.bitmap, off) {
                start = Some(off);
                break;
            }
        }
        let start = start?;

        let mut got = 0u32;
        while got < count
            && start + got < info.nblocks
            && !bitmap_get(&bits.bitmap, start + got)
        {
            bitmap_set(&mut bits.bitmap, start + got);
            got += 1;
        }
        drop(bits);

        info.free_blocks.fetch_sub(got as u64, Ordering::Relaxed);
        self.free_blocks.fetch_sub(got as u64, Ordering::Relaxed);

        let first = self.layout.group_start(group) + start as u64;
        log::debug!("alloc: claimed [{first}, +{got}) in group {group}");
        Some((first, got))
    }

    /// Free a contiguous range of blocks
    pub fn free_range(&self, start: u64, count: u32) -> Result<(), AllocError> {
        self.check_range(start, count)?;

        for blk in start..start + count as u64 {
            let info = self
                .group(block_group(blk))
                .ok_or(AllocError::InvalidBlockNumber(blk))?;
            let off = group_offset(blk);
            let mut bits = info.bits.lock();
            if !bitmap_get(&bits.bitmap, off) {
                return Err(AllocError::BlockAlreadyFree(blk));
            }
            bitmap_clear(&mut bits.bitmap, off);
            bitmap_clear(&mut bits.exclude, off);
            drop(bits);
            info.free_blocks.fetch_add(1, Ordering::Relaxed);
            self.free_blocks.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Mark a range allocated (format-time reservations and tests)
    pub fn mark_allocated_range(&self, start: u64, count: u32) -> Result<(), AllocError> {
        self.check_range(start, count)?;

        for blk in start..start + count as u64 {
            let info = self
                .group(block_group(blk))
                .ok_or(AllocError::InvalidBlockNumber(blk))?;
            let off = group_offset(blk);
            let mut bits = info.bits.lock();
            if !bitmap_get(&bits.bitmap, off) {
                bitmap_set(&mut bits.bitmap, off);
                drop(bits);
                info.free_blocks.fetch_sub(1, Ordering::Relaxed);
                self.free_blocks.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Tests if `block` is allocated in the live bitmap
    pub fn is_allocated(&self, block: u64) -> bool {
        match self.group(block_group(block)) {
            Some(info) => bitmap_get(&info.bits.lock().bitmap, group_offset(block)),
            None => false,
        }
    }

    /// Mark a range in the exclude bitmap (snapshot storage or excluded
    /// file blocks; they never enter a frozen generation bitmap)
    pub fn set_excluded_range(&self, start: u64, count: u32) -> Result<(), AllocError> {
        self.check_range(start, count)?;

        for blk in start..start + count as u64 {
            let info = self
                .group(block_group(blk))
                .ok_or(AllocError::InvalidBlockNumber(blk))?;
            bitmap_set(&mut info.bits.lock().exclude, group_offset(blk));
        }
        Ok(())
    }

    /// Tests if `block` is marked in the exclude bitmap
    pub fn is_excluded(&self, block: u64) -> bool {
        match self.group(block_group(block)) {
            Some(info) => bitmap_get(&info.bits.lock().exclude, group_offset(block)),
            None => false,
        }
    }

    /// Point-in-time copy of the group's live bitmap with excluded blocks
    /// cleared, taken under the group lock. This is the generation-bitmap
    /// freeze: the lock keeps concurrent allocators out while we copy.
    pub fn frozen_bitmap_copy(&self, group: u32) -> Result<Vec<u8>, AllocError> {
        let info = self
            .group(group)
            .ok_or(AllocError::InvalidBlockNumber(group as u64))?;
        let bits = info.bits.lock();
        let mut copy = bits.bitmap.clone();
        for (dst, mask) in copy.iter_mut().zip(bits.exclude.iter()) {
            *dst &= !mask;
        }
        Ok(copy)
    }

    /// Cached physical block of the group's frozen generation bitmap
    pub fn cow_slot(&self, group: u32) -> Option<u64> {
        let blk = self.group(group)?.cow_bitmap_blk.load(Ordering::Acquire);
        (blk != 0).then_some(blk)
    }

    /// Publish the group's frozen generation bitmap block
    pub fn set_cow_slot(&self, group: u32, block: u64) {
        if let Some(info) = self.group(group) {
            info.cow_bitmap_blk.store(block, Ordering::Release);
        }
    }

    /// Forget all frozen-bitmap slots (called when the active snapshot
    /// changes; the next access re-materializes per group)
    pub fn reset_cow_slots(&self) {
        for info in &self.groups {
            info.cow_bitmap_blk.store(0, Ordering::Release);
        }
    }

    /// Rebuild groups from the bitmap blocks persisted on the device
    pub async fn load_from(layout: Layout, cache: &BlockCache) -> Result<Self, AllocError> {
        let bitmap_bytes = (BLOCKS_PER_GROUP / 8) as usize;
        let mut groups = Vec::with_capacity(layout.group_count as usize);
        let mut total_free = 0u64;

        for g in 0..layout.group_count {
            let nblocks = layout.blocks_in_group(g);
            let mut bitmap = cache.read_block_vec(layout.bitmap_block(g)).await?;
            bitmap.resize(bitmap_bytes, 0);
            for bit in nblocks..BLOCKS_PER_GROUP as u32 {
                bitmap_set(&mut bitmap, bit);
            }

            let free = (0..nblocks).filter(|&b| !bitmap_get(&bitmap, b)).count() as u64;
            total_free += free;
            groups.push(GroupInfo {
                bits: Mutex::new(GroupBits {
                    bitmap,
                    exclude: vec![0u8; bitmap_bytes],
                }),
                cow_bitmap_blk: AtomicU64::new(0),
                free_blocks: AtomicU64::new(free),
                nblocks,
            });
        }

        log::info!(
            "alloc: loaded {} groups, {} free blocks",
            layout.group_count,
            total_free
        );

        Ok(Self {
            layout,
            groups,
            free_blocks: AtomicU64::new(total_free),
        })
    }

    /// Persist every group's live bitmap into its bitmap block
    pub async fn write_bitmaps(&self, cache: &BlockCache) -> Result<(), AllocError> {
        for g in 0..self.layout.group_count {
            let data = {
                let info = &self.groups[g as usize];
                info.bits.lock().bitmap.clone()
            };
            cache.write_block(self.layout.bitmap_block(g), &data).await?;
        }
        Ok(())
    }
}
