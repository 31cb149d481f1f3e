//! Snapshot control: take and delete
//!
//! Take and delete are serialized by the snapshot set's control lock.
//! Taking a snapshot demotes the current active generation, installs the
//! new one, forgets every group's generation-bitmap slot (the frozen
//! bitmaps of the old generation stay in its storage) and preserves the
//! superblock's pre-image as the new snapshot's first entry.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::snapshot::{Snapshot, SnapshotError};
use crate::volume::Volume;

impl Volume {
    /// Take a new snapshot: freeze the current filesystem state as a
    /// point-in-time view. Returns the new generation identifier.
    pub async fn take_snapshot(&self) -> Result<u64> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }

        let snapshots = self.snapshots().clone();
        let _ctl = snapshots.control_lock().await;

        let generation = self.superblock().last_generation + 1;
        let snap = Arc::new(Snapshot::new(
            generation,
            self.layout().block_count,
            self.journal().current_tid(),
            Self::now_unix(),
        ));

        snapshots.install_active(snap.clone());
        self.groups().reset_cow_slots();

        let result = self.finish_take(generation).await;
        if let Err(err) = result {
            // undo the install so the volume keeps its previous view
            snapshots.rollback_install(generation);
            self.groups().reset_cow_slots();
            log::error!("snapshot take failed: {err}");
            return Err(err);
        }

        log::info!(
            "took snapshot ({generation}), {} blocks frozen",
            snap.nblocks()
        );
        Ok(generation)
    }

    async fn finish_take(&self, generation: u64) -> Result<()> {
        // preserve the superblock's pre-image eagerly; this also
        // materializes group 0's generation bitmap, so the hottest group
        // is ready before the first write lands
        let tx = self.begin_transaction(8)?;
        let preserved = self.engine().get_write_access(&tx, None, 0, None).await;
        match preserved {
            Ok(()) => {}
            Err(err) => {
                self.abort_transaction(tx, "snapshot take");
                return Err(err.into());
            }
        }

        let sb_block = {
            let mut sb = self.superblock_mut();
            sb.last_generation = generation;
            sb.to_block()
        };
        if let Err(err) = tx.mark_dirty(0, &sb_block) {
            self.abort_transaction(tx, "snapshot take");
            return Err(err.into());
        }
        self.commit_transaction(tx).await?;

        self.persist_snapshot_meta().await
    }

    /// Delete an inactive snapshot: release its storage and tombstone
    /// its metadata. The active snapshot cannot be deleted.
    pub async fn delete_snapshot(&self, generation: u64) -> Result<()> {
        let snapshots = self.snapshots().clone();
        let _ctl = snapshots.control_lock().await;

        let snap = snapshots
            .find(generation)
            .ok_or(SnapshotError::NotFound(generation))?;
        if snap.is_active() {
            return Err(SnapshotError::DeleteActive(generation).into());
        }

        snapshots
            .tombstone(generation)
            .ok_or(SnapshotError::DeleteActive(generation))?;
        self.store().release(&snap)?;
        self.persist_snapshot_meta().await?;

        log::info!("deleted snapshot ({generation})");
        Ok(())
    }
}
