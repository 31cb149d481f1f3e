//! Snapshot block store: the block resolver for snapshot files
//!
//! Maps snapshot-relative logical block numbers to physical storage. The
//! mapping is positional: preserved filesystem block N is always at
//! logical offset N of its snapshot's map, so "is this block already
//! preserved" is a plain map lookup. Copy modes allocate fresh storage
//! near the original block; move mode transfers ownership of the
//! original physical block into the snapshot without copying bytes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::alloc::{AllocError, BlockGroups};
use crate::cache::BlockCache;
use crate::journal::TxHandle;
use crate::layout::{block_group, BLOCKS_PER_GROUP};
use crate::snapshot::pending::PendingTracker;
use crate::snapshot::{Result, Snapshot, SnapshotError, SnapshotSet};

/// Resolver command for [`BlockResolver::map_or_allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Only probe for an existing mapping
    Read,
    /// Allocate missing blocks (snapshot pre-allocation)
    Write,
    /// Allocate storage for a COWed block copy
    Cow,
    /// Transfer ownership of the original physical blocks
    Move,
    /// Allocate storage for a frozen generation bitmap; the caller
    /// writes it synchronously, bypassing journal credits
    BitmapSync,
}

impl MapMode {
    /// Tests if this mode may allocate storage
    pub fn allocates(&self) -> bool {
        !matches!(self, MapMode::Read)
    }

    /// Tests if the caller will write synchronously outside the journal
    pub fn is_sync(&self) -> bool {
        matches!(self, MapMode::BitmapSync)
    }
}

/// Outcome of a resolver call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// No mapping exists (and the mode did not allocate)
    Hole,
    /// `count` consecutive logical blocks are mapped, the first at `pblk`
    Mapped { pblk: u64, count: u32 },
    /// A new block was allocated at `pblk`; it is marked pending until
    /// the caller publishes its contents
    Allocated { pblk: u64 },
}

/// The resolver contract consumed by the COW engine
#[async_trait]
pub trait BlockResolver: Send + Sync {
    /// Map `count` blocks of `snapshot` starting at logical `block`,
    /// allocating according to `mode`
    async fn map_or_allocate(
        &self,
        handle: &TxHandle,
        snapshot: &Snapshot,
        block: u64,
        count: u32,
        mode: MapMode,
    ) -> Result<Mapping>;
}

/// Block store shared by all snapshots of a volume
pub struct SnapshotStore {
    groups: Arc<BlockGroups>,
    cache: Arc<BlockCache>,
    pending: Arc<PendingTracker>,
    /// generation → (logical block → physical block)
    maps: Mutex<HashMap<u64, BTreeMap<u64, u64>>>,
}

impl SnapshotStore {
    /// Create a store over the volume's groups and cache
    pub fn new(
        groups: Arc<BlockGroups>,
        cache: Arc<BlockCache>,
        pending: Arc<PendingTracker>,
    ) -> Self {
        Self {
            groups,
            cache,
            pending,
            maps: Mutex::new(HashMap::new()),
        }
    }

    /// The pending tracker guarding in-flight preservations
    pub fn pending(&self) -> &Arc<PendingTracker> {
        &self.pending
    }

    /// Physical block holding `snapshot`-relative logical `block`, if mapped
    pub fn mapped_block(&self, generation: u64, block: u64) -> Option<u64> {
        self.maps.lock().get(&generation)?.get(&block).copied()
    }

    /// Number of blocks mapped for `generation`
    pub fn mapped_count(&self, generation: u64) -> usize {
        self.maps.lock().get(&generation).map_or(0, |m| m.len())
    }

    fn alloc_one(&self, snapshot: &Snapshot, block: u64) -> Result<u64> {
        let (pblk, _) = self.groups.allocate_near(block, 1).map_err(|e| match e {
            AllocError::OutOfSpace => SnapshotError::OutOfSpace(block),
            other => SnapshotError::Alloc(other),
        })?;
        snapshot.inode().charge_blocks(1);
        Ok(pblk)
    }

    /// Release every block mapped for `generation` back to the allocator
    /// and forget the map. Caller has already tombstoned the snapshot.
    pub fn release(&self, snapshot: &Snapshot) -> Result<()> {
        let map = self.maps.lock().remove(&snapshot.generation());
        let Some(map) = map else {
            return Ok(());
        };

        let count = map.len() as u64;
        for (_, pblk) in map {
            self.groups
                .free_range(pblk, 1)
                .map_err(SnapshotError::Alloc)?;
            self.cache.invalidate(pblk);
        }
        snapshot.inode().uncharge_blocks(count);
        log::info!(
            "store: released {count} blocks of snapshot ({})",
            snapshot.generation()
        );
        Ok(())
    }

    /// Clone of all snapshot block maps, keyed by generation, for
    /// persistence with the snapshot metadata
    pub fn export_maps(&self) -> HashMap<u64, BTreeMap<u64, u64>> {
        self.maps.lock().clone()
    }

    /// Restore persisted block maps. Every mapped physical block is
    /// snapshot storage and re-enters the exclude bitmap.
    pub fn import_maps(&self, maps: HashMap<u64, BTreeMap<u64, u64>>) -> Result<()> {
        for map in maps.values() {
            for &pblk in map.values() {
                self.groups
                    .set_excluded_range(pblk, 1)
                    .map_err(SnapshotError::Alloc)?;
            }
        }
        *self.maps.lock() = maps;
        Ok(())
    }

    /// Read `block` as seen by snapshot `generation`: the nearest
    /// preserved copy in this-or-newer generations, else the live block.
    pub async fn read_through(
        &self,
        snapshots: &SnapshotSet,
        generation: u64,
        block: u64,
    ) -> Result<Vec<u8>> {
        for snap in snapshots.from_generation(generation) {
            if let Some(pblk) = self.mapped_block(snap.generation(), block) {
                // a racing COW may still be publishing this block
                self.pending.wait(pblk).await;
                return Ok(self.cache.read_block_vec(pblk).await?);
            }
        }
        Ok(self.cache.read_block_vec(block).await?)
    }
}

#[async_trait]
impl BlockResolver for SnapshotStore {
    async fn map_or_allocate(
        &self,
        handle: &TxHandle,
        snapshot: &Snapshot,
        block: u64,
        count: u32,
        mode: MapMode,
    ) -> Result<Mapping> {
        debug_assert!(count > 0);
        let generation = snapshot.generation();

        let mapping = match mode {
            MapMode::Read => {
                let maps = self.maps.lock();
                match maps.get(&generation) {
                    None => Mapping::Hole,
                    Some(map) => match map.get(&block) {
                        None => Mapping::Hole,
                        Some(&pblk) => {
                            let mut n = 1u32;
                            while n < count && map.contains_key(&(block + n as u64)) {
                                n += 1;
                            }
                            Mapping::Mapped { pblk, count: n }
                        }
                    },
                }
            }

            MapMode::Write | MapMode::Cow | MapMode::BitmapSync => {
                let mut maps = self.maps.lock();
                let map = maps.entry(generation).or_default();
                if let Some(&pblk) = map.get(&block) {
                    // a concurrent preservation won the race
                    Mapping::Mapped { pblk, count: 1 }
                } else {
                    drop(maps);
                    let pblk = self.alloc_one(snapshot, block)?;
                    // pending from allocation until the caller publishes
                    // the block's contents
                    self.pending.begin(pblk);
                    let mut maps = self.maps.lock();
                    let map = maps.entry(generation).or_default();
                    if let Some(&existing) = map.get(&block) {
                        // lost a race while allocating; give ours back
                        self.pending.end(pblk);
                        self.groups
                            .free_range(pblk, 1)
                            .map_err(SnapshotError::Alloc)?;
                        snapshot.inode().uncharge_blocks(1);
                        Mapping::Mapped {
                            pblk: existing,
                            count: 1,
                        }
                    } else {
                        map.insert(block, pblk);
                        Mapping::Allocated { pblk }
                    }
                }
            }

            MapMode::Move => {
                let mut maps = self.maps.lock();
                let map = maps.entry(generation).or_default();

                // a chunk ends at the group boundary or the first
                // already-mapped logical position
                let group_end = (block_group(block) as u64 + 1) * BLOCKS_PER_GROUP;
                let mut moved = 0u32;
                while moved < count
                    && block + (moved as u64) < group_end
                    && !map.contains_key(&(block + moved as u64))
                {
                    let b = block + moved as u64;
                    debug_assert!(self.groups.is_allocated(b));
                    map.insert(b, b);
                    moved += 1;
                }
                drop(maps);
                snapshot.inode().charge_blocks(moved as u64);
                Mapping::Mapped {
                    pblk: block,
                    count: moved,
                }
            }
        };

        log::debug!(
            "store: map_blocks gen={generation} tid={} [{block}, +{count}) mode={mode:?} -> {mapping:?}",
            handle.tid()
        );
        Ok(mapping)
    }
}
