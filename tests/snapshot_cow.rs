//! End-to-end tests of the snapshot COW engine: preservation decisions,
//! positional identity, bitmap freeze, move accounting and the
//! transaction-scoped dedup behavior.

use std::sync::Arc;

use chronofs::format::{FileInode, FileKind, FL_SNAPFILE};
use chronofs::snapshot::cow::{CowStatus, MoveStatus};
use chronofs::volume::DEFAULT_TX_CREDITS;
use chronofs::{BlockDevice, FileBackedBlockDevice, MemBlockDevice, Volume, BLOCK_SIZE};

fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

async fn mem_volume(blocks: u64) -> Volume {
    let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(blocks));
    Volume::format(device).await.unwrap()
}

fn pattern(seed: u8) -> Vec<u8> {
    (0..BLOCK_SIZE).map(|i| seed.wrapping_add(i as u8)).collect()
}

fn random_block() -> Vec<u8> {
    use rand::RngCore;
    let mut data = vec![0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[tokio::test]
async fn cow_is_idempotent_within_a_transaction() {
    init_logging();
    let vol = mem_volume(1024).await;

    let (blk, _) = vol.groups().allocate_near(300, 1).unwrap();
    let g = vol.take_snapshot().await.unwrap();
    let snap = vol.snapshots().find(g).unwrap();

    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let status = vol
        .engine()
        .test_and_cow(&tx, None, blk, None, true)
        .await
        .unwrap();
    assert_eq!(status, CowStatus::Handled);
    let used_after_first = snap.blocks_used();
    let mapped = vol.store().mapped_count(g);

    // second call in the same transaction: dedup hit, nothing copied
    let status = vol
        .engine()
        .test_and_cow(&tx, None, blk, None, true)
        .await
        .unwrap();
    assert_eq!(status, CowStatus::Handled);
    assert_eq!(snap.blocks_used(), used_after_first);
    assert_eq!(vol.store().mapped_count(g), mapped);

    vol.commit_transaction(tx).await.unwrap();
}

#[tokio::test]
async fn preserved_block_is_at_its_own_offset() {
    init_logging();
    let vol = mem_volume(1024).await;

    // a metadata block with known content, in use before the snapshot
    let (blk, _) = vol.groups().allocate_near(400, 1).unwrap();
    let original = random_block();
    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    vol.write_metadata_block(&tx, None, blk, &original)
        .await
        .unwrap();
    vol.commit_transaction(tx).await.unwrap();

    let g = vol.take_snapshot().await.unwrap();

    // overwrite it; the engine preserves the pre-image first
    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    vol.write_metadata_block(&tx, None, blk, &pattern(0x84))
        .await
        .unwrap();
    vol.commit_transaction(tx).await.unwrap();

    // positional identity: filesystem block N is logical offset N of the
    // snapshot's own mapping
    assert!(vol.store().mapped_block(g, blk).is_some());
    let seen = vol.read_block_through_snapshot(g, blk).await.unwrap();
    assert_eq!(seen, original);

    // and the live block carries the new content
    let live = vol.read_block(blk).await.unwrap();
    assert_eq!(live, pattern(0x84));
}

#[tokio::test]
async fn generation_bitmap_stays_frozen() {
    init_logging();
    let vol = mem_volume(1024).await;

    let (blk, _) = vol.groups().allocate_near(500, 1).unwrap();
    let g = vol.take_snapshot().await.unwrap();
    let snap = vol.snapshots().find(g).unwrap();

    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let first = vol
        .engine()
        .bitmap_cache()
        .read_cow_bitmap(&tx, &snap, 0)
        .await
        .unwrap();

    // the live bitmap keeps changing
    vol.groups().allocate_near(600, 16).unwrap();
    vol.groups().free_range(blk, 1).unwrap();

    // simulated crash: the cached slot is lost, the bitmap is re-derived
    vol.groups().reset_cow_slots();
    let second = vol
        .engine()
        .bitmap_cache()
        .read_cow_bitmap(&tx, &snap, 0)
        .await
        .unwrap();
    assert_eq!(first, second);
    vol.commit_transaction(tx).await.unwrap();
}

#[tokio::test]
async fn generation_bitmap_survives_remount() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chronofs.img");
    let device: Arc<dyn BlockDevice> = Arc::new(
        FileBackedBlockDevice::create(&path, 1024 * BLOCK_SIZE as u64)
            .await
            .unwrap(),
    );

    let vol = Volume::format(device).await.unwrap();
    vol.groups().allocate_near(500, 4).unwrap();
    let g = vol.take_snapshot().await.unwrap();
    let snap = vol.snapshots().find(g).unwrap();

    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let frozen = vol
        .engine()
        .bitmap_cache()
        .read_cow_bitmap(&tx, &snap, 0)
        .await
        .unwrap();
    vol.commit_transaction(tx).await.unwrap();
    vol.groups().write_bitmaps(vol.cache()).await.unwrap();
    vol.persist_snapshot_meta().await.unwrap();
    vol.cache().sync().await.unwrap();
    drop(vol);

    // reopen: the bitmap comes back bit-identical from snapshot storage,
    // even though the live bitmap has changed since the freeze
    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBackedBlockDevice::open(&path, false).await.unwrap());
    let vol = Volume::open(device).await.unwrap();
    let snap = vol.snapshots().find(g).unwrap();
    vol.groups().allocate_near(700, 8).unwrap();

    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let reloaded = vol
        .engine()
        .bitmap_cache()
        .read_cow_bitmap(&tx, &snap, 0)
        .await
        .unwrap();
    assert_eq!(frozen, reloaded);
    vol.commit_transaction(tx).await.unwrap();
}

#[tokio::test]
async fn engine_is_a_noop_without_active_snapshot() {
    init_logging();
    let vol = mem_volume(1024).await;
    let (blk, _) = vol.groups().allocate_near(300, 4).unwrap();
    let free = vol.groups().free_count();

    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let status = vol
        .engine()
        .test_and_cow(&tx, None, blk, None, true)
        .await
        .unwrap();
    assert_eq!(status, CowStatus::Handled);

    let file = FileInode::new(30, FileKind::Regular, 0);
    let status = vol
        .engine()
        .test_and_move(&tx, Some(&file), blk, 4, true)
        .await
        .unwrap();
    assert_eq!(status, MoveStatus::NotNeeded { checked: 4 });

    // zero effect: nothing allocated, nothing mapped
    assert_eq!(vol.groups().free_count(), free);
    vol.commit_transaction(tx).await.unwrap();
}

#[tokio::test]
async fn ignored_inode_blocks_never_reach_snapshot_storage() {
    init_logging();
    let vol = mem_volume(1024).await;

    // a block owned by an (inactive) snapshot file, allocated pre-take
    let (blk, _) = vol.groups().allocate_near(450, 1).unwrap();
    let snapfile = FileInode::new(99, FileKind::Regular, FL_SNAPFILE);
    snapfile.charge_blocks(1);

    let g = vol.take_snapshot().await.unwrap();

    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let status = vol
        .engine()
        .test_and_cow(&tx, Some(&snapfile), blk, None, true)
        .await
        .unwrap();
    assert_eq!(status, CowStatus::Handled);
    // suppressed: no content for this block in the snapshot's storage
    assert_eq!(vol.store().mapped_block(g, blk), None);

    let status = vol
        .engine()
        .test_and_move(&tx, Some(&snapfile), blk, 1, true)
        .await
        .unwrap();
    assert!(matches!(status, MoveStatus::NotNeeded { .. }));
    assert_eq!(vol.store().mapped_block(g, blk), None);
    vol.commit_transaction(tx).await.unwrap();
}

#[tokio::test]
async fn move_transfers_charges_and_keeps_free_count() {
    init_logging();
    let vol = mem_volume(1024).await;

    let file = FileInode::new(40, FileKind::Regular, 0);
    let (start, got) = vol.groups().allocate_near(500, 3).unwrap();
    assert_eq!(got, 3);
    file.charge_blocks(3);

    let g = vol.take_snapshot().await.unwrap();
    let snap = vol.snapshots().find(g).unwrap();

    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    // materialize the bitmap before sampling counters
    let status = vol
        .engine()
        .test_and_move(&tx, Some(&file), start, 3, false)
        .await
        .unwrap();
    assert_eq!(status, MoveStatus::Needed { count: 3 });

    let free_before = vol.groups().free_count();
    let snap_before = snap.blocks_used();
    let file_before = file.blocks();

    let status = vol
        .engine()
        .test_and_move(&tx, Some(&file), start, 3, true)
        .await
        .unwrap();
    assert_eq!(status, MoveStatus::Moved { count: 3 });

    // owner -K, snapshot +K, net free count unchanged by the move
    assert_eq!(file.blocks(), file_before - 3);
    assert_eq!(snap.blocks_used(), snap_before + 3);
    assert_eq!(vol.groups().free_count(), free_before);
    vol.commit_transaction(tx).await.unwrap();
}

#[tokio::test]
async fn block_five_scenario_across_transactions() {
    init_logging();
    let vol = mem_volume(1024).await;

    // "block 5": an allocated block whose bit is set at take time
    let (blk, _) = vol.groups().allocate_near(205, 1).unwrap();
    let original = pattern(0x05);
    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    vol.write_metadata_block(&tx, None, blk, &original)
        .await
        .unwrap();
    vol.commit_transaction(tx).await.unwrap();

    let g = vol.take_snapshot().await.unwrap();
    let snap = vol.snapshots().find(g).unwrap();

    // T1: first overwrite preserves the pre-image
    let t1 = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let status = vol
        .engine()
        .test_and_cow(&t1, None, blk, None, true)
        .await
        .unwrap();
    assert_eq!(status, CowStatus::Handled);
    let used = snap.blocks_used();

    // T1 again: dedup, no additional I/O
    let status = vol
        .engine()
        .test_and_cow(&t1, None, blk, None, true)
        .await
        .unwrap();
    assert_eq!(status, CowStatus::Handled);
    assert_eq!(snap.blocks_used(), used);
    vol.commit_transaction(t1).await.unwrap();

    // T2, no snapshot change: the mapped-check answers immediately
    let t2 = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let status = vol
        .engine()
        .test_and_cow(&t2, None, blk, None, true)
        .await
        .unwrap();
    assert_eq!(status, CowStatus::Handled);
    assert_eq!(snap.blocks_used(), used);
    vol.commit_transaction(t2).await.unwrap();

    // the preserved copy still reads back at offset `blk`
    let seen = vol.read_block_through_snapshot(g, blk).await.unwrap();
    assert_eq!(seen, original);
}

#[tokio::test]
async fn data_write_leaves_preimage_with_snapshot() {
    init_logging();
    let vol = mem_volume(1024).await;

    let file = FileInode::new(50, FileKind::Regular, 0);
    let (blk, _) = vol.groups().allocate_near(350, 1).unwrap();
    file.charge_blocks(1);
    let old = pattern(0x0A);
    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    vol.write_metadata_block(&tx, None, blk, &old).await.unwrap();
    vol.commit_transaction(tx).await.unwrap();

    let g = vol.take_snapshot().await.unwrap();

    // in-place overwrite: old block moves to the snapshot, new content
    // lands in a fresh block
    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let new = pattern(0xB0);
    let new_blk = vol.write_data_block(&tx, &file, blk, &new).await.unwrap();
    vol.commit_transaction(tx).await.unwrap();
    assert_ne!(new_blk, blk);

    // the snapshot sees the old bytes at the old position, without any
    // copying having happened
    assert_eq!(vol.store().mapped_block(g, blk), Some(blk));
    let seen = vol.read_block_through_snapshot(g, blk).await.unwrap();
    assert_eq!(seen, old);
    let live = vol.read_block(new_blk).await.unwrap();
    assert_eq!(live, new);

    // a later write to the same file offset is plain: the old position
    // already belongs to the snapshot
    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    let target = vol
        .write_data_block(&tx, &file, new_blk, &pattern(0xC1))
        .await
        .unwrap();
    assert_eq!(target, new_blk);
    vol.commit_transaction(tx).await.unwrap();
}

#[tokio::test]
async fn older_snapshot_reads_nearest_newer_copy() {
    init_logging();
    let vol = mem_volume(1024).await;

    let (blk, _) = vol.groups().allocate_near(420, 1).unwrap();
    let v1 = pattern(0x01);
    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    vol.write_metadata_block(&tx, None, blk, &v1).await.unwrap();
    vol.commit_transaction(tx).await.unwrap();

    let g1 = vol.take_snapshot().await.unwrap();
    let g2 = vol.take_snapshot().await.unwrap();

    // overwrite under g2: the pre-image lands in g2's storage
    let tx = vol.begin_transaction(DEFAULT_TX_CREDITS).unwrap();
    vol.write_metadata_block(&tx, None, blk, &pattern(0x02))
        .await
        .unwrap();
    vol.commit_transaction(tx).await.unwrap();

    // g1 never preserved the block itself; its view walks forward to
    // g2's copy
    assert_eq!(vol.store().mapped_block(g1, blk), None);
    let seen = vol.read_block_through_snapshot(g1, blk).await.unwrap();
    assert_eq!(seen, v1);
    let seen = vol.read_block_through_snapshot(g2, blk).await.unwrap();
    assert_eq!(seen, v1);
}
