//! ChronoFS Core - journaled block snapshots with copy-on-write
//! preservation
//!
//! This crate implements the snapshot engine of a journaling
//! filesystem: before any in-use block is overwritten, its prior
//! contents are preserved into the active snapshot's storage, giving
//! point-in-time read-only views of the volume.
//!
//! The moving parts:
//! - [`snapshot::cow::CowEngine`] decides, inline with every write,
//!   whether a block's pre-image must be preserved, and performs the
//!   preservation (copy for metadata, relocation for data blocks);
//! - [`snapshot::bitmap::CowBitmapCache`] freezes each block group's
//!   live bitmap on first touch after a snapshot is taken, recording
//!   which blocks the snapshot considers in use;
//! - [`snapshot::store::SnapshotStore`] maps snapshot-relative block
//!   numbers to storage, with positional identity: preserved block N is
//!   always at logical offset N;
//! - [`journal::Journal`] provides transactions with credit budgets, the
//!   per-transaction COW dedup table and crash recovery;
//! - [`volume::Volume`] ties device, cache, allocator, journal and
//!   engine together and exposes the guarded write paths.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod blockdev;
pub mod cache;
pub mod error;
pub mod format;
pub mod journal;
pub mod layout;
pub mod snapshot;
pub mod volume;

pub use blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, MemBlockDevice, BLOCK_SIZE};
pub use error::{Error, Result};
pub use snapshot::cow::{CowEngine, CowStatus, MoveStatus};
pub use snapshot::store::{BlockResolver, MapMode, Mapping};
pub use snapshot::{Exclusion, Snapshot, SnapshotError, SnapshotMeta, SnapshotSet, SnapshotState};
pub use volume::Volume;

/// Re-export of commonly used types
pub mod prelude {
    pub use crate::error::Result;
    pub use crate::snapshot::cow::{CowStatus, MoveStatus};
    pub use crate::volume::Volume;
}
