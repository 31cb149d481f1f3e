//! ChronoFS on-disk format and inode model

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::blockdev::BLOCK_SIZE;

/// Magic number identifying a ChronoFS volume
pub const CHRONOFS_MAGIC: &[u8; 8] = b"CHRONOFS";
/// Current on-disk format version
pub const FS_VERSION: u32 = 1;

/// Inode flag: this file is a snapshot file (part of the snapshot storage
/// mechanism). Its blocks are never preserved into a snapshot.
pub const FL_SNAPFILE: u32 = 0x0000_0100;
/// Inode flag: file data is excluded from snapshots by policy.
pub const FL_EXCLUDED: u32 = 0x0000_0200;
/// Inode flag: keep blocks recoverable even where a move would normally
/// be suppressed (large-snapshot testing aid).
pub const FL_UNRM: u32 = 0x0000_0400;

/// Error type for format operations
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bad magic number")]
    BadMagic,
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),
    #[error("Superblock field out of range: {0}")]
    FieldOutOfRange(&'static str),
}

/// File kind, as far as the snapshot engine cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Global filesystem metadata (bitmaps, descriptors, tables)
    Metadata,
}

/// In-memory inode: identity, kind, snapshot-relevant flags and the
/// block-usage charge counter the move engine credits back on relocation.
#[derive(Debug)]
pub struct FileInode {
    /// Inode number
    pub ino: u64,
    /// File kind
    pub kind: FileKind,
    /// Flag bits (`FL_*`)
    pub flags: u32,
    /// Inode generation
    pub generation: u32,
    /// Number of blocks charged to this inode
    blocks: AtomicU64,
}

impl FileInode {
    /// Create a regular file inode with the given flags
    pub fn new(ino: u64, kind: FileKind, flags: u32) -> Self {
        Self {
            ino,
            kind,
            flags,
            generation: 0,
            blocks: AtomicU64::new(0),
        }
    }

    /// Tests if this inode is a snapshot file
    pub fn is_snapshot_file(&self) -> bool {
        self.kind == FileKind::Regular && self.flags & FL_SNAPFILE != 0
    }

    /// Tests if this inode's data is excluded from snapshots by policy
    pub fn is_excluded_file(&self) -> bool {
        self.kind == FileKind::Regular && self.flags & FL_EXCLUDED != 0
    }

    /// Blocks currently charged to this inode
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Charge `count` blocks to this inode
    pub fn charge_blocks(&self, count: u64) {
        self.blocks.fetch_add(count, Ordering::Relaxed);
    }

    /// Credit `count` blocks back (ownership transferred elsewhere)
    pub fn uncharge_blocks(&self, count: u64) {
        self.blocks.fetch_sub(count, Ordering::Relaxed);
    }
}

/// Volume superblock, stored in block 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version
    pub version: u32,
    /// Total blocks in the volume
    pub block_count: u64,
    /// Blocks per block group
    pub blocks_per_group: u32,
    /// First block of the journal area
    pub journal_start: u64,
    /// Length of the journal area in blocks
    pub journal_blocks: u32,
    /// First block of the snapshot metadata area
    pub snap_meta_start: u64,
    /// Length of the snapshot metadata area in blocks
    pub snap_meta_blocks: u32,
    /// Most recently assigned snapshot generation
    pub last_generation: u64,
}

impl Superblock {
    /// Serialized size in bytes (magic + fields)
    pub const SIZE: usize = 8 + 4 + 8 + 4 + 8 + 4 + 8 + 4 + 8;

    /// Serialize into a full block-sized buffer
    pub fn to_block(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        buf.extend_from_slice(CHRONOFS_MAGIC);
        buf.write_u32::<LittleEndian>(self.version).unwrap();
        buf.write_u64::<LittleEndian>(self.block_count).unwrap();
        buf.write_u32::<LittleEndian>(self.blocks_per_group).unwrap();
        buf.write_u64::<LittleEndian>(self.journal_start).unwrap();
        buf.write_u32::<LittleEndian>(self.journal_blocks).unwrap();
        buf.write_u64::<LittleEndian>(self.snap_meta_start).unwrap();
        buf.write_u32::<LittleEndian>(self.snap_meta_blocks).unwrap();
        buf.write_u64::<LittleEndian>(self.last_generation).unwrap();
        buf.resize(BLOCK_SIZE, 0);
        buf
    }

    /// Deserialize from a block-sized buffer
    pub fn from_block(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < Self::SIZE || &data[..8] != CHRONOFS_MAGIC {
            return Err(FormatError::BadMagic);
        }

        let mut cursor = Cursor::new(&data[8..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FS_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            block_count: cursor.read_u64::<LittleEndian>()?,
            blocks_per_group: cursor.read_u32::<LittleEndian>()?,
            journal_start: cursor.read_u64::<LittleEndian>()?,
            journal_blocks: cursor.read_u32::<LittleEndian>()?,
            snap_meta_start: cursor.read_u64::<LittleEndian>()?,
            snap_meta_blocks: cursor.read_u32::<LittleEndian>()?,
            last_generation: cursor.read_u64::<LittleEndian>()?,
        })
    }
}
