//! Mounted-volume state
//!
//! A [`Volume`] owns the device, block cache, block groups, journal,
//! snapshot set, snapshot store and the COW engine, and exposes the
//! write-path entry points that thread every modification through the
//! engine before it touches the live block.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::alloc::BlockGroups;
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::format::{FileInode, Superblock};
use crate::journal::{Journal, JournalError, TxHandle};
use crate::layout::Layout;
use crate::snapshot::cow::{CowEngine, MoveStatus};
use crate::snapshot::pending::PendingTracker;
use crate::snapshot::store::SnapshotStore;
use crate::snapshot::{SnapshotMeta, SnapshotSet};

/// Default credit budget for small metadata transactions
pub const DEFAULT_TX_CREDITS: u32 = 16;

/// Persisted snapshot metadata document (snapshot list plus the block
/// maps of the snapshot store)
#[derive(Debug, Serialize, Deserialize, Default)]
struct SnapMetaDoc {
    snapshots: Vec<SnapshotMeta>,
    maps: HashMap<u64, BTreeMap<u64, u64>>,
}

/// A mounted ChronoFS volume
pub struct Volume {
    cache: Arc<BlockCache>,
    layout: Layout,
    superblock: RwLock<Superblock>,
    groups: Arc<BlockGroups>,
    journal: Arc<Journal>,
    snapshots: Arc<SnapshotSet>,
    store: Arc<SnapshotStore>,
    engine: CowEngine,
    read_only: AtomicBool,
}

impl Volume {
    fn assemble(
        device: Arc<dyn BlockDevice>,
        layout: Layout,
        superblock: Superblock,
        groups: Arc<BlockGroups>,
    ) -> Self {
        let cache = Arc::new(BlockCache::new(device, 1024));
        let pending = Arc::new(PendingTracker::new());
        let snapshots = Arc::new(SnapshotSet::new());
        let journal = Arc::new(Journal::new(
            cache.device().clone(),
            cache.clone(),
            snapshots.clone(),
            layout.journal_start,
            layout.journal_blocks,
        ));
        let store = Arc::new(SnapshotStore::new(
            groups.clone(),
            cache.clone(),
            pending,
        ));
        let engine = CowEngine::new(
            journal.clone(),
            groups.clone(),
            store.clone(),
            cache.clone(),
        );

        Self {
            cache,
            layout,
            superblock: RwLock::new(superblock),
            groups,
            journal,
            snapshots,
            store,
            engine,
            read_only: AtomicBool::new(false),
        }
    }

    /// Format `device` as an empty ChronoFS volume
    pub async fn format(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let layout = Layout::new(device.block_count())?;
        let groups = Arc::new(BlockGroups::new_formatted(layout));
        let superblock = layout.superblock(0);

        let volume = Self::assemble(device, layout, superblock.clone(), groups);
        volume.cache.write_block(0, &superblock.to_block()).await?;
        volume.groups.write_bitmaps(&volume.cache).await?;
        volume.persist_snapshot_meta().await?;
        volume.cache.sync().await?;

        log::info!(
            "formatted volume: {} blocks, {} groups",
            layout.block_count,
            layout.group_count
        );
        Ok(volume)
    }

    /// Open a previously formatted volume, replaying the journal and
    /// loading the persisted snapshot set
    pub async fn open(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let probe = Arc::new(BlockCache::new(device.clone(), 8));
        let sb_block = probe.read_block_vec(0).await?;
        let superblock = Superblock::from_block(&sb_block)?;
        let layout = Layout::from_superblock(&superblock);

        // replay committed transactions before reading any metadata the
        // replay may rewrite (bitmap blocks, the superblock itself)
        let recovery = Journal::new(
            device.clone(),
            probe.clone(),
            Arc::new(SnapshotSet::new()),
            layout.journal_start,
            layout.journal_blocks,
        );
        recovery.recover().await?;
        let superblock = Superblock::from_block(&probe.read_block_vec(0).await?)?;

        let cache = BlockCache::new(device.clone(), 64);
        let groups = Arc::new(BlockGroups::load_from(layout, &cache).await?);
        let volume = Self::assemble(device, layout, superblock, groups);

        volume.load_snapshot_meta().await?;

        log::info!(
            "opened volume: {} blocks, {} snapshots, active generation {:?}",
            layout.block_count,
            volume.snapshots.list().len(),
            volume.snapshots.active().map(|s| s.generation())
        );
        Ok(volume)
    }

    /// The COW engine
    pub fn engine(&self) -> &CowEngine {
        &self.engine
    }

    /// The journal
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// The snapshot set
    pub fn snapshots(&self) -> &Arc<SnapshotSet> {
        &self.snapshots
    }

    /// The snapshot block store
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// The block groups
    pub fn groups(&self) -> &Arc<BlockGroups> {
        &self.groups
    }

    /// The block cache
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// The volume layout
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Current superblock copy
    pub fn superblock(&self) -> Superblock {
        self.superblock.read().clone()
    }

    pub(crate) fn superblock_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Superblock> {
        self.superblock.write()
    }

    /// Tests if the volume has gone read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed) || self.journal.is_aborted()
    }

    /// Begin a transaction with `credits` blocks of journal budget
    pub fn begin_transaction(&self, credits: u32) -> Result<TxHandle> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        Ok(self.journal.begin(credits)?)
    }

    /// Commit a transaction. A commit failure is a journal failure: the
    /// volume goes read-only.
    pub async fn commit_transaction(&self, tx: TxHandle) -> Result<()> {
        match self.journal.commit(tx).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if !matches!(err, JournalError::NotActive(_)) {
                    self.journal.abort_journal("commit failed");
                    self.read_only.store(true, Ordering::Relaxed);
                }
                Err(err.into())
            }
        }
    }

    /// Abort a transaction, discarding its block images
    pub fn abort_transaction(&self, tx: TxHandle, reason: &str) {
        self.journal.abort_tx(tx, reason);
    }

    /// Read a live block
    pub async fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        Ok(self.cache.read_block_vec(block).await?)
    }

    /// Read `block` as seen by snapshot `generation`
    pub async fn read_block_through_snapshot(
        &self,
        generation: u64,
        block: u64,
    ) -> Result<Vec<u8>> {
        Ok(self
            .store
            .read_through(&self.snapshots, generation, block)
            .await?)
    }

    /// Modify a metadata block: preserve its pre-image for the active
    /// snapshot, then write the new content through cache and journal.
    pub async fn write_metadata_block(
        &self,
        tx: &TxHandle,
        owner: Option<&FileInode>,
        block: u64,
        data: &[u8],
    ) -> Result<()> {
        self.engine.get_write_access(tx, owner, block, None).await?;
        self.cache.write_block(block, data).await?;
        tx.mark_dirty(block, data)?;
        Ok(())
    }

    /// Overwrite a file data block: if the old block must be preserved,
    /// its ownership (and its bytes) move into the active snapshot, the
    /// file is left with a hole, and the new content goes to a freshly
    /// allocated block. Returns the physical block now holding the
    /// file's data so the caller can rewire its block pointer.
    pub async fn write_data_block(
        &self,
        tx: &TxHandle,
        owner: &FileInode,
        block: u64,
        data: &[u8],
    ) -> Result<u64> {
        let target = match self
            .engine
            .get_move_access(tx, Some(owner), block, 1, true)
            .await?
        {
            MoveStatus::Moved { count } => {
                debug_assert_eq!(count, 1);
                // the old physical block now holds the snapshot's
                // pre-image; fill the hole with a new allocation
                let (new_blk, _) = self.groups.allocate_near(block, 1)?;
                owner.charge_blocks(1);
                new_blk
            }
            MoveStatus::NotNeeded { .. } => block,
            MoveStatus::Needed { .. } => unreachable!("do_move was set"),
        };
        self.cache.write_block(target, data).await?;
        tx.mark_dirty(target, data)?;
        Ok(target)
    }

    fn meta_capacity(&self) -> usize {
        self.layout.snap_meta_blocks as usize * BLOCK_SIZE - 8
    }

    /// Persist the snapshot list and block maps into the reserved
    /// metadata area. Called by snapshot take/delete; long-running
    /// writers should call it before unmount so preservations made since
    /// the last control operation survive a remount.
    pub async fn persist_snapshot_meta(&self) -> Result<()> {
        let doc = SnapMetaDoc {
            snapshots: self.snapshots.metas(),
            maps: self.store.export_maps(),
        };
        let json = serde_json::to_vec(&doc)?;
        if json.len() > self.meta_capacity() {
            return Err(Error::MetadataOverflow(json.len()));
        }

        let mut area = vec![0u8; self.layout.snap_meta_blocks as usize * BLOCK_SIZE];
        LittleEndian::write_u64(&mut area[..8], json.len() as u64);
        area[8..8 + json.len()].copy_from_slice(&json);

        for (i, chunk) in area.chunks(BLOCK_SIZE).enumerate() {
            self.cache
                .write_block(self.layout.snap_meta_start + i as u64, chunk)
                .await?;
        }
        self.cache.sync().await?;
        Ok(())
    }

    async fn load_snapshot_meta(&self) -> Result<()> {
        let mut area = Vec::with_capacity(self.layout.snap_meta_blocks as usize * BLOCK_SIZE);
        for i in 0..self.layout.snap_meta_blocks as u64 {
            area.extend(
                self.cache
                    .read_block_vec(self.layout.snap_meta_start + i)
                    .await?,
            );
        }

        let len = LittleEndian::read_u64(&area[..8]) as usize;
        if len == 0 {
            return Ok(());
        }
        if len > area.len() - 8 {
            return Err(Error::Serialization(
                "snapshot metadata length out of range".into(),
            ));
        }

        let doc: SnapMetaDoc = serde_json::from_slice(&area[8..8 + len])?;
        self.snapshots.load(&doc.snapshots);
        self.store.import_maps(doc.maps)?;
        Ok(())
    }

    pub(crate) fn now_unix() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;

    #[tokio::test]
    async fn test_format_and_open_round_trip() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(1024));
        let volume = Volume::format(device.clone()).await.unwrap();
        let free = volume.groups().free_count();
        drop(volume);

        let volume = Volume::open(device).await.unwrap();
        assert_eq!(volume.superblock().block_count, 1024);
        assert_eq!(volume.groups().free_count(), free);
        assert!(volume.snapshots().active().is_none());
    }

    #[tokio::test]
    async fn test_write_paths_without_snapshot() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(1024));
        let volume = Volume::format(device).await.unwrap();

        let (blk, _) = volume.groups().allocate_near(200, 1).unwrap();
        let tx = volume.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
        volume
            .write_metadata_block(&tx, None, blk, &[0xEEu8; BLOCK_SIZE])
            .await
            .unwrap();
        volume.commit_transaction(tx).await.unwrap();

        let data = volume.read_block(blk).await.unwrap();
        assert!(data.iter().all(|&b| b == 0xEE));
    }

    #[tokio::test]
    async fn test_read_only_after_journal_abort() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(1024));
        let volume = Volume::format(device).await.unwrap();

        volume.journal().abort_journal("induced failure");
        assert!(volume.is_read_only());
        assert!(matches!(
            volume.begin_transaction(4),
            Err(Error::ReadOnly)
        ));
    }
}
