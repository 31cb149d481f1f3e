//! Write-ahead journal for ChronoFS
//!
//! Transactions collect block images and commit them with a
//! start/images/end record sequence in the reserved journal area; after
//! the records are durable the images are checkpointed to their home
//! locations. Commits are serialized, so the journal area is reused from
//! its start on every commit.
//!
//! The journal also owns two pieces of snapshot bookkeeping:
//! - the transaction handle carries the active-snapshot reference
//!   captured at `begin`, so the COW engine's view is stable for the
//!   whole transaction;
//! - the COW dedup table (block number → tid of the transaction that
//!   last preserved it), consulted by the COW engine and pruned at
//!   commit.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::snapshot::{Snapshot, SnapshotSet};

/// Journal record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordKind {
    /// Start of a transaction
    TxStart = 1,
    /// A block image to be applied at `home_block`
    BlockImage = 2,
    /// End of a transaction (commit record)
    TxEnd = 3,
}

impl RecordKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::TxStart),
            2 => Some(Self::BlockImage),
            3 => Some(Self::TxEnd),
            _ => None,
        }
    }
}

/// On-disk record header
#[derive(Debug, Clone)]
struct RecordHeader {
    kind: RecordKind,
    tid: u64,
    home_block: u64,
    data_len: u32,
    checksum: u32,
}

impl RecordHeader {
    const SIZE: usize = 32;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.kind as u32).unwrap();
        buf.write_u64::<LittleEndian>(self.tid).unwrap();
        buf.write_u64::<LittleEndian>(self.home_block).unwrap();
        buf.write_u32::<LittleEndian>(self.data_len).unwrap();
        buf.write_u32::<LittleEndian>(self.checksum).unwrap();
        buf.resize(Self::SIZE, 0);
        buf
    }

    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let mut cursor = Cursor::new(data);
        let kind = RecordKind::from_raw(cursor.read_u32::<LittleEndian>().ok()?)?;
        Some(Self {
            kind,
            tid: cursor.read_u64::<LittleEndian>().ok()?,
            home_block: cursor.read_u64::<LittleEndian>().ok()?,
            data_len: cursor.read_u32::<LittleEndian>().ok()?,
            checksum: cursor.read_u32::<LittleEndian>().ok()?,
        })
    }
}

/// Error type for journal operations
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] BlockDeviceError),
    #[error("Journal has been aborted; volume is read-only")]
    Aborted,
    #[error("Journal area full: transaction needs {0} blocks, {1} available")]
    Full(u64, u64),
    #[error("Transaction {0} is no longer active")]
    NotActive(u64),
}

/// A running transaction. Obtained from [`Journal::begin`]; finished by
/// [`Journal::commit`] or [`Journal::abort_tx`].
pub struct TxHandle {
    tid: u64,
    credits: AtomicI64,
    cowing: AtomicBool,
    active: Option<Arc<Snapshot>>,
    records: Mutex<Vec<(u64, Vec<u8>)>>,
    finished: AtomicBool,
}

impl TxHandle {
    /// Transaction id
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// The active snapshot captured when this transaction began
    pub fn active_snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.active.as_ref()
    }

    /// Remaining credit budget (may go negative; see `mark_dirty`)
    pub fn credits_left(&self) -> i64 {
        self.credits.load(Ordering::Relaxed)
    }

    /// Tests if at least `n` credits remain
    pub fn has_enough_credits(&self, n: i64) -> bool {
        self.credits_left() >= n
    }

    /// Extend the credit budget by `n` blocks
    pub fn extend(&self, n: u32) {
        self.credits.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// Tests if this transaction is inside a COW operation (the engine's
    /// recursion guard)
    pub fn is_cowing(&self) -> bool {
        self.cowing.load(Ordering::Relaxed)
    }

    pub(crate) fn enter_cow(&self) -> bool {
        self.cowing.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn leave_cow(&self) {
        self.cowing.store(false, Ordering::Relaxed);
    }

    /// Record a block image to be journaled and applied at commit.
    /// Debits one credit; running past the reserved budget is reported by
    /// the COW engine as a consistency warning, not an error.
    pub fn mark_dirty(&self, home_block: u64, data: &[u8]) -> Result<(), JournalError> {
        if self.finished.load(Ordering::Relaxed) {
            return Err(JournalError::NotActive(self.tid));
        }
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        self.credits.fetch_sub(1, Ordering::Relaxed);
        let mut records = self.records.lock();
        // a later image of the same block supersedes the earlier one
        if let Some(slot) = records.iter_mut().find(|(blk, _)| *blk == home_block) {
            slot.1 = data.to_vec();
        } else {
            records.push((home_block, data.to_vec()));
        }
        Ok(())
    }

    fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::Relaxed)
    }
}

impl Drop for TxHandle {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Relaxed) {
            log::warn!("transaction {} dropped without commit or abort", self.tid);
        }
    }
}

/// The volume journal
pub struct Journal {
    device: Arc<dyn BlockDevice>,
    cache: Arc<BlockCache>,
    snapshots: Arc<SnapshotSet>,
    area_start: u64,
    area_blocks: u32,
    next_tid: AtomicU64,
    aborted: AtomicBool,
    commit_lock: tokio::sync::Mutex<()>,
    cow_marks: Mutex<HashMap<u64, u64>>,
}

impl Journal {
    /// Create a journal over the reserved area `[area_start,
    /// area_start + area_blocks)`
    pub fn new(
        device: Arc<dyn BlockDevice>,
        cache: Arc<BlockCache>,
        snapshots: Arc<SnapshotSet>,
        area_start: u64,
        area_blocks: u32,
    ) -> Self {
        Self {
            device,
            cache,
            snapshots,
            area_start,
            area_blocks,
            next_tid: AtomicU64::new(1),
            aborted: AtomicBool::new(false),
            commit_lock: tokio::sync::Mutex::new(()),
            cow_marks: Mutex::new(HashMap::new()),
        }
    }

    /// Tests if the journal has been aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// The tid the next transaction will receive. Recorded by snapshot
    /// take so "preserved during or after take" is decidable by tid
    /// comparison.
    pub fn current_tid(&self) -> u64 {
        self.next_tid.load(Ordering::SeqCst)
    }

    /// Abort the whole journal; every subsequent begin/commit fails and
    /// the volume must be treated as read-only
    pub fn abort_journal(&self, reason: &str) {
        if !self.aborted.swap(true, Ordering::Relaxed) {
            log::error!("journal aborted: {reason}");
        }
    }

    /// Begin a transaction with a credit budget of `credits` blocks.
    /// Captures the active snapshot for the transaction's lifetime.
    pub fn begin(&self, credits: u32) -> Result<TxHandle, JournalError> {
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        log::debug!("journal: begin tid={tid} credits={credits}");
        Ok(TxHandle {
            tid,
            credits: AtomicI64::new(credits as i64),
            cowing: AtomicBool::new(false),
            active: self.snapshots.active(),
            records: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        })
    }

    /// Tests if `block` was already preserved during transaction `tid`
    pub fn was_cowed(&self, handle: &TxHandle, block: u64) -> bool {
        self.cow_marks.lock().get(&block) == Some(&handle.tid)
    }

    /// Record that `block` was preserved during `handle`'s transaction
    pub fn mark_cowed(&self, handle: &TxHandle, block: u64) {
        self.cow_marks.lock().insert(block, handle.tid);
    }

    #[cfg(test)]
    pub(crate) fn cow_mark_count(&self) -> usize {
        self.cow_marks.lock().len()
    }

    async fn write_record(
        &self,
        head: &mut u64,
        kind: RecordKind,
        tid: u64,
        home_block: u64,
        data: &[u8],
    ) -> Result<(), JournalError> {
        let header = RecordHeader {
            kind,
            tid,
            home_block,
            data_len: data.len() as u32,
            checksum: crc32fast::hash(data),
        };

        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(data);
        let nblocks = ((bytes.len() + BLOCK_SIZE - 1) / BLOCK_SIZE) as u64;
        if *head + nblocks > self.area_blocks as u64 {
            return Err(JournalError::Full(
                *head + nblocks,
                self.area_blocks as u64,
            ));
        }
        bytes.resize((nblocks as usize) * BLOCK_SIZE, 0);

        for (i, chunk) in bytes.chunks(BLOCK_SIZE).enumerate() {
            self.device
                .write_block(self.area_start + *head + i as u64, chunk)
                .await
                .map_err(JournalError::Io)?;
        }
        *head += nblocks;
        Ok(())
    }

    /// Commit a transaction: journal records, sync, checkpoint images to
    /// home locations, then invalidate the journal area and this
    /// transaction's dedup marks.
    pub async fn commit(&self, handle: TxHandle) -> Result<(), JournalError> {
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        if !handle.finish() {
            return Err(JournalError::NotActive(handle.tid));
        }

        let records = std::mem::take(&mut *handle.records.lock());
        let tid = handle.tid;
        let _guard = self.commit_lock.lock().await;

        let mut head = 0u64;
        self.write_record(&mut head, RecordKind::TxStart, tid, 0, &[])
            .await?;
        for (home, data) in &records {
            self.write_record(&mut head, RecordKind::BlockImage, tid, *home, data)
                .await?;
        }
        self.write_record(&mut head, RecordKind::TxEnd, tid, 0, &[])
            .await?;
        self.device.sync().await.map_err(JournalError::Io)?;

        // checkpoint
        for (home, data) in &records {
            self.cache
                .write_block(*home, data)
                .await
                .map_err(JournalError::Io)?;
        }
        self.device.sync().await.map_err(JournalError::Io)?;

        // the journal area can be reused now that the images are home
        self.device
            .write_block(self.area_start, &[0u8; BLOCK_SIZE])
            .await
            .map_err(JournalError::Io)?;

        self.cow_marks.lock().retain(|_, t| *t != tid);

        log::debug!(
            "journal: committed tid={tid} ({} block images)",
            records.len()
        );
        Ok(())
    }

    /// Abort a single transaction: discard its records and dedup marks.
    pub fn abort_tx(&self, handle: TxHandle, reason: &str) {
        if handle.finish() {
            let tid = handle.tid;
            handle.records.lock().clear();
            self.cow_marks.lock().retain(|_, t| *t != tid);
            log::warn!("journal: aborted tid={tid}: {reason}");
        }
    }

    /// Replay complete transactions found in the journal area after a
    /// crash. Returns the number of transactions applied.
    pub async fn recover(&self) -> Result<u64, JournalError> {
        let _guard = self.commit_lock.lock().await;
        let mut replayed = 0u64;
        let mut last_tid = 0u64;
        let mut head = 0u64;
        let mut buf = vec![0u8; BLOCK_SIZE];

        'scan: while head < self.area_blocks as u64 {
            self.device
                .read_block(self.area_start + head, &mut buf)
                .await
                .map_err(JournalError::Io)?;
            let Some(header) = RecordHeader::from_bytes(&buf) else {
                break;
            };
            if header.kind != RecordKind::TxStart || header.tid <= last_tid {
                break;
            }
            let tid = header.tid;
            head += 1;

            // collect the transaction's images; only apply if we reach a
            // TxEnd with every checksum intact
            let mut images: Vec<(u64, Vec<u8>)> = Vec::new();
            loop {
                if head >= self.area_blocks as u64 {
                    break 'scan;
                }
                self.device
                    .read_block(self.area_start + head, &mut buf)
                    .await
                    .map_err(JournalError::Io)?;
                let Some(rec) = RecordHeader::from_bytes(&buf) else {
                    break 'scan;
                };
                if rec.tid != tid {
                    break 'scan;
                }
                match rec.kind {
                    RecordKind::TxStart => break 'scan,
                    RecordKind::TxEnd => {
                        head += 1;
                        for (home, data) in &images {
                            self.cache
                                .write_block(*home, data)
                                .await
                                .map_err(JournalError::Io)?;
                        }
                        replayed += 1;
                        last_tid = tid;
                        break;
                    }
                    RecordKind::BlockImage => {
                        let len = rec.data_len as usize;
                        let total = RecordHeader::SIZE + len;
                        let nblocks = ((total + BLOCK_SIZE - 1) / BLOCK_SIZE) as u64;
                        let mut data = Vec::with_capacity(total);
                        data.extend_from_slice(&buf);
                        for i in 1..nblocks {
                            let mut more = vec![0u8; BLOCK_SIZE];
                            self.device
                                .read_block(self.area_start + head + i, &mut more)
                                .await
                                .map_err(JournalError::Io)?;
                            data.extend_from_slice(&more);
                        }
                        let payload = &data[RecordHeader::SIZE..RecordHeader::SIZE + len];
                        if crc32fast::hash(payload) != rec.checksum {
                            log::warn!(
                                "journal: bad checksum in tid {tid} at offset {head}, stopping recovery"
                            );
                            break 'scan;
                        }
                        images.push((rec.home_block, payload.to_vec()));
                        head += nblocks;
                    }
                }
            }
        }

        if last_tid > 0 {
            let current = self.next_tid.load(Ordering::SeqCst);
            self.next_tid
                .store(current.max(last_tid + 1), Ordering::SeqCst);
        }
        self.device.sync().await.map_err(JournalError::Io)?;
        if replayed > 0 {
            log::info!("journal: recovery replayed {replayed} transactions");
        }
        Ok(replayed)
    }
}
