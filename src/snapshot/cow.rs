//! COW decision engine and move engine
//!
//! Every write path that is about to modify a metadata block or
//! overwrite a data block in place calls in here first. The engine
//! decides whether the block's pre-image must be preserved for the
//! active snapshot and, if so, performs the preservation: metadata
//! blocks are copied into snapshot storage, data blocks are relocated
//! (ownership of the physical block transfers to the snapshot and the
//! caller is left with a hole to fill with the new data).
//!
//! Preservation of a block happens-before the block's modification
//! becomes visible: callers invoke the engine before taking write
//! access to the live buffer. Within one transaction a block is
//! preserved at most once (journal dedup table); across transactions
//! the snapshot's own block map answers "already preserved".

use std::sync::Arc;

use crate::alloc::BlockGroups;
use crate::blockdev::{BlockDeviceError, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::format::FileInode;
use crate::journal::{Journal, TxHandle};
use crate::snapshot::bitmap::CowBitmapCache;
use crate::snapshot::store::{BlockResolver, MapMode, Mapping, SnapshotStore};
use crate::snapshot::{classify, Exclusion, Result, Snapshot, SnapshotError};

/// Outcome of a COW decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowStatus {
    /// The block was preserved, or needs no preservation
    Handled,
    /// Check-only call: the block needs preservation; call again with
    /// `do_cow = true`
    Needed,
}

/// Outcome of a move decision. Each variant carries the number of blocks
/// the answer covers, so callers can advance through a larger range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveStatus {
    /// The leading `checked` blocks need no relocation
    NotNeeded {
        /// Blocks covered by this answer
        checked: u32,
    },
    /// Check-only call: the leading `count` blocks need relocation
    Needed {
        /// Blocks that would be moved
        count: u32,
    },
    /// `count` blocks were relocated into the snapshot
    Moved {
        /// Blocks moved
        count: u32,
    },
}

/// Scope guard for a COW operation: sets the recursion flag on the
/// transaction handle so the engine's own writes are not re-entered, and
/// clears it on every exit path.
struct CowGuard<'a> {
    handle: &'a TxHandle,
}

impl<'a> CowGuard<'a> {
    fn enter(handle: &'a TxHandle, block: u64) -> Self {
        if !handle.has_enough_credits(1) {
            // heuristic only; the reservation estimate may simply have
            // been conservative
            log::warn!(
                "insufficient transaction credits ({}) for COW of block {block}",
                handle.credits_left()
            );
        }
        let was_cowing = handle.enter_cow();
        debug_assert!(!was_cowing, "COW guard entered twice");
        Self { handle }
    }
}

impl Drop for CowGuard<'_> {
    fn drop(&mut self) {
        self.handle.leave_cow();
    }
}

/// The COW engine of a volume
pub struct CowEngine {
    journal: Arc<Journal>,
    groups: Arc<BlockGroups>,
    store: Arc<SnapshotStore>,
    bitmap: CowBitmapCache,
    cache: Arc<BlockCache>,
}

impl CowEngine {
    /// Wire the engine over the volume's journal, groups, store and cache
    pub fn new(
        journal: Arc<Journal>,
        groups: Arc<BlockGroups>,
        store: Arc<SnapshotStore>,
        cache: Arc<BlockCache>,
    ) -> Self {
        let bitmap = CowBitmapCache::new(groups.clone(), store.clone(), cache.clone());
        Self {
            journal,
            groups,
            store,
            bitmap,
            cache,
        }
    }

    /// The generation bitmap cache
    pub fn bitmap_cache(&self) -> &CowBitmapCache {
        &self.bitmap
    }

    /// Test if metadata `block` must be preserved for the active
    /// snapshot and, when `do_cow` is set, copy its pre-image into
    /// snapshot storage.
    ///
    /// `owner` is the inode the block belongs to, or `None` for global
    /// filesystem metadata. `buf` is the block's current content if the
    /// caller already holds it; otherwise the engine reads it.
    pub async fn test_and_cow(
        &self,
        handle: &TxHandle,
        owner: Option<&FileInode>,
        block: u64,
        buf: Option<&[u8]>,
        do_cow: bool,
    ) -> Result<CowStatus> {
        let Some(active) = handle.active_snapshot().cloned() else {
            // no active snapshot: nothing to preserve, no I/O
            return Ok(CowStatus::Handled);
        };

        if handle.is_cowing() {
            // the engine's own writes on behalf of the active snapshot
            // are never re-COWed; doing so would recurse forever
            debug_assert!(
                owner.map_or(true, |i| i.ino == active.inode().ino),
                "recursive COW for a foreign inode"
            );
            return Ok(CowStatus::Handled);
        }
        if let Some(owner) = owner {
            if owner.ino == active.inode().ino {
                // the active snapshot is only written by the engine itself
                return Err(SnapshotError::ActiveSnapshotAccess(owner.ino));
            }
        }

        if self.journal.was_cowed(handle, block) {
            // already preserved during this transaction
            return Ok(CowStatus::Handled);
        }

        let _guard = CowGuard::enter(handle, block);
        let result = self
            .cow_slow_path(handle, &active, owner, block, buf, do_cow)
            .await;
        if let Err(ref err) = result {
            log::error!(
                "cow of block {block} for snapshot ({}) failed: {err}",
                active.generation()
            );
        }
        result
    }

    async fn cow_slow_path(
        &self,
        handle: &TxHandle,
        active: &Arc<Snapshot>,
        owner: Option<&FileInode>,
        block: u64,
        buf: Option<&[u8]>,
        do_cow: bool,
    ) -> Result<CowStatus> {
        let exclusion = classify(owner);
        if exclusion == Exclusion::Excluded {
            // policy escape hatch: bookkeep instead of copying
            self.groups
                .set_excluded_range(block, 1)
                .map_err(SnapshotError::Alloc)?;
        }

        let (in_use, _) = self.bitmap.test_and_count(handle, active, block, 1).await?;
        if !in_use {
            self.journal.mark_cowed(handle, block);
            return Ok(CowStatus::Handled);
        }

        // in use by the snapshot; another writer may have preserved it
        if let Mapping::Mapped { pblk, .. } = self
            .store
            .map_or_allocate(handle, active, block, 1, MapMode::Read)
            .await?
        {
            self.store.pending().wait(pblk).await;
            self.journal.mark_cowed(handle, block);
            return Ok(CowStatus::Handled);
        }

        if exclusion != Exclusion::Normal {
            // ignored/excluded owners: the bitmap says the block is in
            // use, but preservation is suppressed for them
            self.journal.mark_cowed(handle, block);
            return Ok(CowStatus::Handled);
        }

        if !do_cow {
            // caller was only checking; do not mark the dedup table
            return Ok(CowStatus::Needed);
        }

        // a faithful pre-image is mandatory from here on
        let data = match buf {
            Some(data) => {
                if data.len() != BLOCK_SIZE {
                    return Err(SnapshotError::Io(BlockDeviceError::InvalidBlockSize(
                        data.len(),
                    )));
                }
                data.to_vec()
            }
            None => self.cache.read_block_vec(block).await?,
        };

        match self
            .store
            .map_or_allocate(handle, active, block, 1, MapMode::Cow)
            .await?
        {
            Mapping::Mapped { pblk, .. } => {
                // another COWing task allocated it first; wait until its
                // copy is published
                self.store.pending().wait(pblk).await;
            }
            Mapping::Allocated { pblk } => {
                let published = self.publish_copy(handle, pblk, &data).await;
                self.store.pending().end(pblk);
                published?;
                // snapshot storage itself never enters a future
                // generation bitmap
                self.groups
                    .set_excluded_range(pblk, 1)
                    .map_err(SnapshotError::Alloc)?;
                log::debug!(
                    "cow: copied block {block} of snapshot ({}) to block {pblk}",
                    active.generation()
                );
            }
            Mapping::Hole => unreachable!("allocating mode never returns a hole"),
        }

        self.journal.mark_cowed(handle, block);
        Ok(CowStatus::Handled)
    }

    async fn publish_copy(&self, handle: &TxHandle, pblk: u64, data: &[u8]) -> Result<()> {
        // write through the cache so readers see the copy immediately,
        // and journal it so the preservation survives a crash with the
        // transaction it belongs to
        self.cache.write_block(pblk, data).await?;
        handle.mark_dirty(pblk, data)?;
        Ok(())
    }

    /// Test if the `max_count` data blocks starting at `block` must be
    /// relocated into the active snapshot and, when `do_move` is set,
    /// relocate them. The caller must hold exclusive write access to the
    /// affected block range of the owning file for the whole operation.
    pub async fn test_and_move(
        &self,
        handle: &TxHandle,
        owner: Option<&FileInode>,
        block: u64,
        max_count: u32,
        do_move: bool,
    ) -> Result<MoveStatus> {
        let Some(active) = handle.active_snapshot().cloned() else {
            return Ok(MoveStatus::NotNeeded {
                checked: max_count,
            });
        };

        debug_assert!(!handle.is_cowing(), "move engine entered during a COW");
        if handle.is_cowing() {
            return Ok(MoveStatus::NotNeeded {
                checked: max_count,
            });
        }
        if let Some(owner) = owner {
            if owner.ino == active.inode().ino {
                return Err(SnapshotError::ActiveSnapshotAccess(owner.ino));
            }
        }

        let _guard = CowGuard::enter(handle, block);
        let result = self
            .move_slow_path(handle, &active, owner, block, max_count, do_move)
            .await;
        if let Err(ref err) = result {
            log::error!(
                "move of [{block}, +{max_count}) for snapshot ({}) failed: {err}",
                active.generation()
            );
        }
        result
    }

    async fn move_slow_path(
        &self,
        handle: &TxHandle,
        active: &Arc<Snapshot>,
        owner: Option<&FileInode>,
        block: u64,
        max_count: u32,
        do_move: bool,
    ) -> Result<MoveStatus> {
        let exclusion = classify(owner);

        let (in_use, checked) = self
            .bitmap
            .test_and_count(handle, active, block, max_count)
            .await?;
        if !in_use {
            return Ok(MoveStatus::NotNeeded { checked });
        }

        if exclusion != Exclusion::Normal {
            // excluded and snapshot-file blocks are never relocated
            return Ok(MoveStatus::NotNeeded { checked });
        }

        // the in-bitmap run may already be preserved by earlier writes
        if let Mapping::Mapped { count, .. } = self
            .store
            .map_or_allocate(handle, active, block, checked, MapMode::Read)
            .await?
        {
            return Ok(MoveStatus::NotNeeded { checked: count });
        }

        let count = checked;
        if !do_move {
            return Ok(MoveStatus::Needed { count });
        }

        // relocate in chunks; a chunk ends at a group boundary or where
        // a racing preservation already mapped the next position
        let mut moved = 0u32;
        while moved < count {
            match self
                .store
                .map_or_allocate(
                    handle,
                    active,
                    block + moved as u64,
                    count - moved,
                    MapMode::Move,
                )
                .await?
            {
                Mapping::Mapped { count: n, .. } if n > 0 => moved += n,
                _ => break,
            }
        }

        if moved > 0 {
            // moved blocks are snapshot storage now
            self.groups
                .set_excluded_range(block, moved)
                .map_err(SnapshotError::Alloc)?;
            // the owner is no longer charged for them; the snapshot was
            // charged when they were mapped
            if let Some(owner) = owner {
                owner.uncharge_blocks(moved as u64);
            }
            log::debug!(
                "cow: moved [{block}, +{moved}) into snapshot ({})",
                active.generation()
            );
        }
        Ok(MoveStatus::Moved { count: moved })
    }

    /// Hook: called before modifying an existing metadata block.
    /// `owner` is the inode the block belongs to, or `None` for global
    /// metadata.
    pub async fn get_write_access(
        &self,
        handle: &TxHandle,
        owner: Option<&FileInode>,
        block: u64,
        buf: Option<&[u8]>,
    ) -> Result<()> {
        let status = self.test_and_cow(handle, owner, block, buf, true).await?;
        debug_assert_eq!(status, CowStatus::Handled);
        Ok(())
    }

    /// Hook: called after allocating a brand-new metadata block. A new
    /// block can only be flagged in the generation bitmap if freed
    /// blocks were leaked past the snapshot (e.g. by an external fsck),
    /// which is a consistency failure.
    pub async fn get_create_access(&self, handle: &TxHandle, block: u64) -> Result<()> {
        match self.test_and_cow(handle, None, block, None, false).await? {
            CowStatus::Handled => Ok(()),
            CowStatus::Needed => Err(SnapshotError::Io(BlockDeviceError::Io(
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("newly allocated block {block} is still in use by the snapshot"),
                ),
            ))),
        }
    }

    /// Hook: called before modifying a block-bitmap block. Initializes
    /// the group's generation bitmap, then preserves the bitmap block
    /// itself.
    pub async fn get_bitmap_access(
        &self,
        handle: &TxHandle,
        group: u32,
        buf: Option<&[u8]>,
    ) -> Result<()> {
        // 1. materialize the group's generation bitmap by testing its
        //    first block
        let first = self.groups.layout().group_start(group);
        self.test_and_cow(handle, None, first, None, false).await?;
        // 2. preserve the bitmap block itself
        let bitmap_blk = self.groups.layout().bitmap_block(group);
        self.get_write_access(handle, None, bitmap_blk, buf).await
    }

    /// Hook: called before overwriting data blocks in place
    pub async fn get_move_access(
        &self,
        handle: &TxHandle,
        owner: Option<&FileInode>,
        block: u64,
        count: u32,
        do_move: bool,
    ) -> Result<MoveStatus> {
        self.test_and_move(handle, owner, block, count, do_move).await
    }

    /// Hook: called before freeing blocks. A `Moved` answer means the
    /// blocks now belong to the snapshot and must not be freed.
    pub async fn get_delete_access(
        &self,
        handle: &TxHandle,
        owner: Option<&FileInode>,
        block: u64,
        count: u32,
    ) -> Result<MoveStatus> {
        self.test_and_move(handle, owner, block, count, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{BlockDevice, MemBlockDevice};
    use crate::format::{FileKind, FL_EXCLUDED, FL_SNAPFILE};
    use crate::layout::Layout;
    use crate::snapshot::pending::PendingTracker;
    use crate::snapshot::{Snapshot, SnapshotSet};

    struct Fixture {
        groups: Arc<BlockGroups>,
        cache: Arc<BlockCache>,
        store: Arc<SnapshotStore>,
        journal: Arc<Journal>,
        snapshots: Arc<SnapshotSet>,
        engine: CowEngine,
    }

    fn fixture() -> Fixture {
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(2048));
        let cache = Arc::new(BlockCache::new(device.clone(), 128));
        let layout = Layout::new(2048).unwrap();
        let groups = Arc::new(BlockGroups::new_formatted(layout));
        let pending = Arc::new(PendingTracker::new());
        let snapshots = Arc::new(SnapshotSet::new());
        let journal = Arc::new(Journal::new(
            device,
            cache.clone(),
            snapshots.clone(),
            layout.journal_start,
            layout.journal_blocks,
        ));
        let store = Arc::new(SnapshotStore::new(groups.clone(), cache.clone(), pending));
        let engine = CowEngine::new(
            journal.clone(),
            groups.clone(),
            store.clone(),
            cache.clone(),
        );
        Fixture {
            groups,
            cache,
            store,
            journal,
            snapshots,
            engine,
        }
    }

    fn take_snapshot(fx: &Fixture, generation: u64) -> Arc<Snapshot> {
        let snap = Arc::new(Snapshot::new(generation, 2048, 1, 0));
        fx.snapshots.install_active(snap.clone());
        fx.groups.reset_cow_slots();
        snap
    }

    #[tokio::test]
    async fn test_no_active_snapshot_is_a_noop() {
        let fx = fixture();
        let tx = fx.journal.begin(8).unwrap();

        let status = fx
            .engine
            .test_and_cow(&tx, None, 100, None, true)
            .await
            .unwrap();
        assert_eq!(status, CowStatus::Handled);
        let status = fx
            .engine
            .test_and_move(&tx, None, 100, 4, true)
            .await
            .unwrap();
        assert_eq!(status, MoveStatus::NotNeeded { checked: 4 });
        // and no bookkeeping happened at all
        assert_eq!(fx.journal.cow_mark_count(), 0);

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_cow_copies_once_then_dedups() {
        let fx = fixture();
        let (blk, _) = fx.groups.allocate_near(500, 1).unwrap();
        fx.cache.write_block(blk, &[0x5Au8; BLOCK_SIZE]).await.unwrap();

        let snap = take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        let status = fx
            .engine
            .test_and_cow(&tx, None, blk, None, true)
            .await
            .unwrap();
        assert_eq!(status, CowStatus::Handled);

        let pblk = fx.store.mapped_block(1, blk).expect("preserved");
        let copy = fx.cache.read_block_vec(pblk).await.unwrap();
        assert!(copy.iter().all(|&b| b == 0x5A));
        assert_eq!(snap.blocks_used(), 2); // bitmap block + data copy

        // same transaction: dedup, no extra copy
        let used_before = snap.blocks_used();
        let status = fx
            .engine
            .test_and_cow(&tx, None, blk, None, true)
            .await
            .unwrap();
        assert_eq!(status, CowStatus::Handled);
        assert_eq!(snap.blocks_used(), used_before);

        fx.journal.commit(tx).await.unwrap();

        // new transaction: the mapped-probe answers without copying
        let tx2 = fx.journal.begin(8).unwrap();
        let status = fx
            .engine
            .test_and_cow(&tx2, None, blk, None, true)
            .await
            .unwrap();
        assert_eq!(status, CowStatus::Handled);
        assert_eq!(snap.blocks_used(), used_before);
        fx.journal.abort_tx(tx2, "test done");
    }

    #[tokio::test]
    async fn test_check_only_does_not_dedup() {
        let fx = fixture();
        let (blk, _) = fx.groups.allocate_near(500, 1).unwrap();
        take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        let status = fx
            .engine
            .test_and_cow(&tx, None, blk, None, false)
            .await
            .unwrap();
        assert_eq!(status, CowStatus::Needed);
        // a check-only answer must not pre-empt the real preservation
        assert!(!fx.journal.was_cowed(&tx, blk));

        let status = fx
            .engine
            .test_and_cow(&tx, None, blk, None, true)
            .await
            .unwrap();
        assert_eq!(status, CowStatus::Handled);
        assert!(fx.store.mapped_block(1, blk).is_some());

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_unallocated_block_needs_nothing() {
        let fx = fixture();
        take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        // 900 was never allocated, so its generation bit is clear
        let status = fx
            .engine
            .test_and_cow(&tx, None, 900, None, true)
            .await
            .unwrap();
        assert_eq!(status, CowStatus::Handled);
        assert_eq!(fx.store.mapped_block(1, 900), None);

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_active_snapshot_access_denied() {
        let fx = fixture();
        let snap = take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        let err = fx
            .engine
            .test_and_cow(&tx, Some(snap.inode().as_ref()), 100, None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::ActiveSnapshotAccess(_)));

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_ignored_owner_suppresses_copy() {
        let fx = fixture();
        let (blk, _) = fx.groups.allocate_near(500, 1).unwrap();
        take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        // an inactive snapshot file's block: in the bitmap, never copied
        let snapfile = FileInode::new(99, FileKind::Regular, FL_SNAPFILE);
        let status = fx
            .engine
            .test_and_cow(&tx, Some(&snapfile), blk, None, true)
            .await
            .unwrap();
        assert_eq!(status, CowStatus::Handled);
        assert_eq!(fx.store.mapped_block(1, blk), None);

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_excluded_owner_marks_exclude_bitmap() {
        let fx = fixture();
        let (blk, _) = fx.groups.allocate_near(500, 1).unwrap();
        take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        let excluded = FileInode::new(21, FileKind::Regular, FL_EXCLUDED);
        let status = fx
            .engine
            .test_and_cow(&tx, Some(&excluded), blk, None, true)
            .await
            .unwrap();
        assert_eq!(status, CowStatus::Handled);
        assert_eq!(fx.store.mapped_block(1, blk), None);
        assert!(fx.groups.is_excluded(blk));

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_create_access_rejects_leaked_block() {
        let fx = fixture();
        let (blk, _) = fx.groups.allocate_near(500, 1).unwrap();
        take_snapshot(&fx, 1);
        // simulate a leak: the block is freed behind the snapshot's back
        fx.groups.free_range(blk, 1).unwrap();
        let tx = fx.journal.begin(8).unwrap();

        // allocator hands the block out again; its generation bit is
        // still set, which create-access must reject
        fx.groups.mark_allocated_range(blk, 1).unwrap();
        let err = fx.engine.get_create_access(&tx, blk).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Io(_)));

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_move_relocates_and_accounts() {
        let fx = fixture();
        let file = FileInode::new(30, FileKind::Regular, 0);
        let (start, got) = fx.groups.allocate_near(600, 4).unwrap();
        assert_eq!(got, 4);
        file.charge_blocks(4);

        let snap = take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        // check-only first (this also materializes the generation bitmap)
        let status = fx
            .engine
            .test_and_move(&tx, Some(&file), start, 4, false)
            .await
            .unwrap();
        assert_eq!(status, MoveStatus::Needed { count: 4 });

        let free_before = fx.groups.free_count();
        let status = fx
            .engine
            .test_and_move(&tx, Some(&file), start, 4, true)
            .await
            .unwrap();
        assert_eq!(status, MoveStatus::Moved { count: 4 });

        // ownership accounting: owner credited, snapshot charged, and
        // the move itself consumed no new storage
        assert_eq!(file.blocks(), 0);
        assert!(snap.blocks_used() >= 4);
        assert_eq!(fx.groups.free_count(), free_before);
        // positional identity
        for i in 0..4u64 {
            assert_eq!(fx.store.mapped_block(1, start + i), Some(start + i));
        }

        // the moved run answers "not needed" afterwards
        let status = fx
            .engine
            .test_and_move(&tx, Some(&file), start, 4, true)
            .await
            .unwrap();
        assert_eq!(status, MoveStatus::NotNeeded { checked: 4 });

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_move_narrows_to_bitmap_run() {
        let fx = fixture();
        let file = FileInode::new(31, FileKind::Regular, 0);
        // 3 allocated blocks, then a hole
        let (start, got) = fx.groups.allocate_near(700, 3).unwrap();
        assert_eq!(got, 3);
        file.charge_blocks(3);
        take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        let status = fx
            .engine
            .test_and_move(&tx, Some(&file), start, 8, false)
            .await
            .unwrap();
        assert_eq!(status, MoveStatus::Needed { count: 3 });

        // starting in the hole: nothing to move, narrowed to the free run
        let status = fx
            .engine
            .test_and_move(&tx, Some(&file), start + 3, 2, true)
            .await
            .unwrap();
        assert_eq!(status, MoveStatus::NotNeeded { checked: 2 });

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_delete_access_moves_instead_of_freeing() {
        let fx = fixture();
        let file = FileInode::new(32, FileKind::Regular, 0);
        let (start, _) = fx.groups.allocate_near(800, 2).unwrap();
        file.charge_blocks(2);
        take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        let status = fx
            .engine
            .get_delete_access(&tx, Some(&file), start, 2)
            .await
            .unwrap();
        // the blocks were claimed by the snapshot; caller must not free
        assert_eq!(status, MoveStatus::Moved { count: 2 });
        assert!(fx.groups.is_allocated(start));

        fx.journal.abort_tx(tx, "test done");
    }

    #[tokio::test]
    async fn test_bitmap_access_preserves_bitmap_block() {
        let fx = fixture();
        take_snapshot(&fx, 1);
        let tx = fx.journal.begin(8).unwrap();

        fx.engine.get_bitmap_access(&tx, 0, None).await.unwrap();
        // the live bitmap block's pre-image is in the snapshot
        let bitmap_blk = fx.groups.layout().bitmap_block(0);
        assert!(fx.store.mapped_block(1, bitmap_blk).is_some());

        fx.journal.abort_tx(tx, "test done");
    }
}
