//! Volume layout: block groups and reserved metadata regions
//!
//! The volume is divided into fixed-size block groups, one block bitmap
//! block per group. A group spans exactly the number of blocks one bitmap
//! block can describe (8 * BLOCK_SIZE bits), so a block's group and
//! in-group offset are simple shifts. Group 0 additionally holds the
//! superblock, the journal area and the snapshot metadata area.

use crate::blockdev::BLOCK_SIZE;
use crate::format::Superblock;
use thiserror::Error;

/// log2 of blocks per group (8 bits per bitmap byte)
pub const BLOCKS_PER_GROUP_BITS: u32 = 15;
/// Blocks described by one bitmap block
pub const BLOCKS_PER_GROUP: u64 = 1 << BLOCKS_PER_GROUP_BITS;

/// Default length of the journal area in blocks
pub const DEFAULT_JOURNAL_BLOCKS: u32 = 64;
/// Default length of the snapshot metadata area in blocks
pub const DEFAULT_SNAP_META_BLOCKS: u32 = 4;

/// Block group number of `block`
pub fn block_group(block: u64) -> u32 {
    (block >> BLOCKS_PER_GROUP_BITS) as u32
}

/// Offset of `block` within its group
pub fn group_offset(block: u64) -> u32 {
    (block & (BLOCKS_PER_GROUP - 1)) as u32
}

/// Error type for layout computation
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Volume too small: {0} blocks (minimum {1})")]
    VolumeTooSmall(u64, u64),
}

/// Computed positions of the volume's fixed structures
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Total blocks in the volume
    pub block_count: u64,
    /// Number of block groups (last group may be partial)
    pub group_count: u32,
    /// First block of the journal area
    pub journal_start: u64,
    /// Length of the journal area in blocks
    pub journal_blocks: u32,
    /// First block of the snapshot metadata area
    pub snap_meta_start: u64,
    /// Length of the snapshot metadata area in blocks
    pub snap_meta_blocks: u32,
}

impl Layout {
    /// Compute the layout for a volume of `block_count` blocks
    pub fn new(block_count: u64) -> Result<Self, LayoutError> {
        // superblock + group 0 bitmap + journal + snapshot metadata,
        // plus room for at least a handful of data blocks
        let min_blocks =
            2 + DEFAULT_JOURNAL_BLOCKS as u64 + DEFAULT_SNAP_META_BLOCKS as u64 + 16;
        if block_count < min_blocks {
            return Err(LayoutError::VolumeTooSmall(block_count, min_blocks));
        }

        let group_count = ((block_count + BLOCKS_PER_GROUP - 1) / BLOCKS_PER_GROUP) as u32;
        let journal_start = 2;
        let snap_meta_start = journal_start + DEFAULT_JOURNAL_BLOCKS as u64;

        Ok(Self {
            block_count,
            group_count,
            journal_start,
            journal_blocks: DEFAULT_JOURNAL_BLOCKS,
            snap_meta_start,
            snap_meta_blocks: DEFAULT_SNAP_META_BLOCKS,
        })
    }

    /// Reconstruct the layout recorded in a superblock
    pub fn from_superblock(sb: &Superblock) -> Self {
        Self {
            block_count: sb.block_count,
            group_count: ((sb.block_count + BLOCKS_PER_GROUP - 1) / BLOCKS_PER_GROUP) as u32,
            journal_start: sb.journal_start,
            journal_blocks: sb.journal_blocks,
            snap_meta_start: sb.snap_meta_start,
            snap_meta_blocks: sb.snap_meta_blocks,
        }
    }

    /// First block of group `group`
    pub fn group_start(&self, group: u32) -> u64 {
        (group as u64) << BLOCKS_PER_GROUP_BITS
    }

    /// Number of blocks in group `group` (last group may be partial)
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let start = self.group_start(group);
        (self.block_count - start).min(BLOCKS_PER_GROUP) as u32
    }

    /// Block number of the live block bitmap for `group`.
    /// Group 0's bitmap follows the superblock; every other group's
    /// bitmap is its first block.
    pub fn bitmap_block(&self, group: u32) -> u64 {
        if group == 0 {
            1
        } else {
            self.group_start(group)
        }
    }

    /// Tests if `block` is one of the volume's fixed metadata blocks
    pub fn is_reserved_block(&self, block: u64) -> bool {
        if block == 0 {
            return true;
        }
        if block >= self.journal_start
            && block < self.journal_start + self.journal_blocks as u64
        {
            return true;
        }
        if block >= self.snap_meta_start
            && block < self.snap_meta_start + self.snap_meta_blocks as u64
        {
            return true;
        }
        (0..self.group_count).any(|g| self.bitmap_block(g) == block)
    }

    /// Build the superblock describing this layout
    pub fn superblock(&self, last_generation: u64) -> Superblock {
        Superblock {
            version: crate::format::FS_VERSION,
            block_count: self.block_count,
            blocks_per_group: BLOCKS_PER_GROUP as u32,
            journal_start: self.journal_start,
            journal_blocks: self.journal_blocks,
            snap_meta_start: self.snap_meta_start,
            snap_meta_blocks: self.snap_meta_blocks,
            last_generation,
        }
    }
}

// BLOCK_SIZE is what ties bitmap bits to group size
const _: () = assert!(BLOCKS_PER_GROUP == (BLOCK_SIZE * 8) as u64);
