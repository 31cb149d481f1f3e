//! Snapshot model for ChronoFS
//!
//! A snapshot is a file-like object holding the preserved pre-images of
//! filesystem blocks, addressed positionally: preserved block N lives at
//! logical offset N of the snapshot's own block map. Exactly one snapshot
//! is *active* (receiving COW writes) at a time; older snapshots are
//! read-only history.

pub mod bitmap;
pub mod cow;
pub mod ctl;
pub mod pending;
pub mod store;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::alloc::AllocError;
use crate::blockdev::BlockDeviceError;
use crate::format::{FileInode, FileKind, FL_SNAPFILE};
use crate::journal::JournalError;

/// First inode number handed to snapshot files
pub const SNAPSHOT_INO_BASE: u64 = 64;

/// Error type for snapshot operations.
///
/// I/O and allocation failures are fatal to the transaction that
/// triggered them: a modification applied without its pre-image preserved
/// would corrupt the snapshot, so callers must abort on any of these.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] BlockDeviceError),
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("Allocation error: {0}")]
    Alloc(AllocError),
    #[error("Snapshot storage exhausted while preserving block {0}")]
    OutOfSpace(u64),
    #[error("Active snapshot may only be modified by the COW engine (inode {0})")]
    ActiveSnapshotAccess(u64),
    #[error("Snapshot generation {0} not found")]
    NotFound(u64),
    #[error("Snapshot generation {0} is active and cannot be deleted")]
    DeleteActive(u64),
}

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Snapshot lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    /// Receiving COW writes
    Active,
    /// Read-only history
    Inactive,
    /// Tombstoned; storage released
    Deleted,
}

/// Persisted snapshot metadata record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Generation identifier (monotonic)
    pub generation: u64,
    /// Inode number of the snapshot file
    pub ino: u64,
    /// Filesystem size in blocks at take time
    pub nblocks: u64,
    /// Journal transaction id recorded at take time
    pub take_tid: u64,
    /// Creation time, UNIX seconds
    pub created_at: u64,
    /// Lifecycle state
    pub state: SnapshotState,
    /// Blocks charged to the snapshot's storage
    pub blocks_used: u64,
}

impl SnapshotMeta {
    /// Human-readable creation time
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created_at as i64, 0)
    }
}

/// One snapshot generation
#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    nblocks: u64,
    take_tid: u64,
    created_at: u64,
    state: RwLock<SnapshotState>,
    inode: Arc<FileInode>,
}

impl Snapshot {
    pub(crate) fn new(generation: u64, nblocks: u64, take_tid: u64, created_at: u64) -> Self {
        let inode = Arc::new(FileInode::new(
            SNAPSHOT_INO_BASE + generation,
            FileKind::Regular,
            FL_SNAPFILE,
        ));
        Self {
            generation,
            nblocks,
            take_tid,
            created_at,
            state: RwLock::new(SnapshotState::Active),
            inode,
        }
    }

    pub(crate) fn from_meta(meta: &SnapshotMeta) -> Self {
        let inode = Arc::new(FileInode::new(meta.ino, FileKind::Regular, FL_SNAPFILE));
        inode.charge_blocks(meta.blocks_used);
        Self {
            generation: meta.generation,
            nblocks: meta.nblocks,
            take_tid: meta.take_tid,
            created_at: meta.created_at,
            state: RwLock::new(meta.state),
            inode,
        }
    }

    /// Generation identifier
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Filesystem size in blocks frozen at take time. Blocks at or past
    /// this limit never need preservation (the volume grew afterwards).
    pub fn nblocks(&self) -> u64 {
        self.nblocks
    }

    /// Journal tid recorded when this snapshot was taken
    pub fn take_tid(&self) -> u64 {
        self.take_tid
    }

    /// Current lifecycle state
    pub fn state(&self) -> SnapshotState {
        *self.state.read()
    }

    /// Tests if this is the snapshot currently receiving COW writes
    pub fn is_active(&self) -> bool {
        self.state() == SnapshotState::Active
    }

    pub(crate) fn set_state(&self, state: SnapshotState) {
        *self.state.write() = state;
    }

    /// The snapshot file's inode
    pub fn inode(&self) -> &Arc<FileInode> {
        &self.inode
    }

    /// Blocks charged to this snapshot's storage
    pub fn blocks_used(&self) -> u64 {
        self.inode.blocks()
    }

    /// Metadata record for persistence
    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            generation: self.generation,
            ino: self.inode.ino,
            nblocks: self.nblocks,
            take_tid: self.take_tid,
            created_at: self.created_at,
            state: self.state(),
            blocks_used: self.blocks_used(),
        }
    }
}

struct SetInner {
    /// Ordered oldest to newest
    list: Vec<Arc<Snapshot>>,
    active: Option<Arc<Snapshot>>,
}

/// The volume's ordered set of snapshots, with at most one active member.
/// Take/delete are serialized by the control lock; the active handle is
/// read (and cloned into transaction handles) under the inner lock, so
/// swaps are atomic with respect to readers.
pub struct SnapshotSet {
    inner: RwLock<SetInner>,
    ctl: tokio::sync::Mutex<()>,
}

impl Default for SnapshotSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SetInner {
                list: Vec::new(),
                active: None,
            }),
            ctl: tokio::sync::Mutex::new(()),
        }
    }

    /// Serialize a snapshot-control operation (take/delete). The guard
    /// is held across the control operation's I/O.
    pub async fn control_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ctl.lock().await
    }

    /// The snapshot currently receiving COW writes
    pub fn active(&self) -> Option<Arc<Snapshot>> {
        self.inner.read().active.clone()
    }

    /// All snapshots, oldest to newest
    pub fn list(&self) -> Vec<Arc<Snapshot>> {
        self.inner.read().list.clone()
    }

    /// Find a snapshot by generation
    pub fn find(&self, generation: u64) -> Option<Arc<Snapshot>> {
        self.inner
            .read()
            .list
            .iter()
            .find(|s| s.generation() == generation)
            .cloned()
    }

    /// Snapshots with generation >= `generation`, oldest first (the scan
    /// order for read-through lookups)
    pub fn from_generation(&self, generation: u64) -> Vec<Arc<Snapshot>> {
        self.inner
            .read()
            .list
            .iter()
            .filter(|s| s.generation() >= generation && s.state() != SnapshotState::Deleted)
            .cloned()
            .collect()
    }

    /// Append `snapshot` as the newest member and make it active,
    /// demoting the previous active snapshot. Caller holds the control
    /// lock.
    pub(crate) fn install_active(&self, snapshot: Arc<Snapshot>) {
        let mut inner = self.inner.write();
        if let Some(prev) = inner.active.take() {
            prev.set_state(SnapshotState::Inactive);
        }
        inner.list.push(snapshot.clone());
        inner.active = Some(snapshot);
    }

    /// Undo a just-failed `install_active`: drop the newest member if it
    /// matches `generation` and restore the previous newest as active.
    /// Caller holds the control lock.
    pub(crate) fn rollback_install(&self, generation: u64) {
        let mut inner = self.inner.write();
        if inner
            .list
            .last()
            .map_or(false, |s| s.generation() == generation)
        {
            inner.list.pop();
            inner.active = inner.list.last().cloned();
            if let Some(prev) = &inner.active {
                prev.set_state(SnapshotState::Active);
            }
        }
    }

    /// Tombstone a snapshot. Caller holds the control lock; the active
    /// snapshot cannot be deleted.
    pub(crate) fn tombstone(&self, generation: u64) -> Option<Arc<Snapshot>> {
        let inner = self.inner.write();
        let snap = inner
            .list
            .iter()
            .find(|s| s.generation() == generation)
            .cloned()?;
        if snap.is_active() {
            return None;
        }
        snap.set_state(SnapshotState::Deleted);
        Some(snap)
    }

    /// Rebuild the set from persisted metadata records
    pub(crate) fn load(&self, metas: &[SnapshotMeta]) {
        let mut inner = self.inner.write();
        inner.list.clear();
        inner.active = None;
        for meta in metas {
            if meta.state == SnapshotState::Deleted {
                continue;
            }
            let snap = Arc::new(Snapshot::from_meta(meta));
            if meta.state == SnapshotState::Active {
                inner.active = Some(snap.clone());
            }
            inner.list.push(snap);
        }
        inner.list.sort_by_key(|s| s.generation());
    }

    /// Metadata records for all snapshots, oldest to newest
    pub fn metas(&self) -> Vec<SnapshotMeta> {
        self.inner.read().list.iter().map(|s| s.meta()).collect()
    }
}

/// How an inode's blocks relate to snapshot preservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    /// Default: blocks are preserved before overwrite
    Normal,
    /// Policy escape hatch: data blocks are not copied or moved into
    /// snapshots, but still participate in exclude-bitmap accounting
    Excluded,
    /// The inode is part of the snapshot storage mechanism itself;
    /// preserving its blocks would be circular
    Ignored,
}

/// Classify `inode` for the COW engine. Global metadata (no owner) and
/// non-regular files are always `Normal`; only regular files can be
/// excluded or ignored.
pub fn classify(inode: Option<&FileInode>) -> Exclusion {
    let Some(inode) = inode else {
        return Exclusion::Normal;
    };
    if inode.is_snapshot_file() {
        return Exclusion::Ignored;
    }
    if inode.is_excluded_file() {
        return Exclusion::Excluded;
    }
    Exclusion::Normal
}
