//! # Rollback Scenarios
//!
//! Writes enough epochs that the metadata store pages out several times,
//! then truncates the log back to the middle and verifies:
//!
//! - the durable horizon drops to the rollback epoch,
//! - the paged metadata horizon drops to or below it,
//! - iteration sees exactly the surviving epochs,
//! - the write path resumes cleanly past the rollback point.

use std::path::Path;
use std::time::{Duration, Instant};

use nvlog::{Epoch, InitMode, Wal, WalConfig};
use tempfile::tempdir;

fn config(dir: &Path) -> WalConfig {
    WalConfig {
        nv_root: dir.join("nv"),
        disk_root: dir.join("disk"),
        writer_count: 1,
        writer_buffer_size: 4096,
        segment_size: 32 * 1024,
        nv_quota: 4 * 32 * 1024,
        // 512-byte pages hold 8 records: 100 epochs page out repeatedly.
        mds_page_size: 512,
        resuming_epoch: Epoch::INVALID,
    }
}

fn wait_durable(wal: &Wal, epoch: Epoch) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !wal.query_durable_epoch().is_equal_or_after(epoch) {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for durable epoch {}",
            epoch
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn commit(wal: &Wal, epoch: Epoch) {
    assert!(wal.advance_stable_epoch(epoch), "stable epoch not accepted");
    wait_durable(wal, epoch);
}

fn write_epochs(wal: &Wal, range: std::ops::RangeInclusive<u64>) {
    for e in range {
        let epoch = Epoch::new(e);
        wal.assure_writer_space(0).unwrap();
        wal.on_wal_write(0, &[e as u8; 512], epoch).unwrap();
        commit(wal, epoch);
    }
}

fn count_epochs(wal: &Wal, begin: u64, end: u64) -> Vec<u64> {
    let mut cursor = wal
        .open_log_cursor(Epoch::new(begin), Epoch::new(end))
        .unwrap();
    let mut seen = Vec::new();
    while cursor.is_valid() {
        let e = cursor.current_epoch().raw();
        if seen.last() != Some(&e) {
            seen.push(e);
        }
        cursor.next().unwrap();
    }
    seen
}

#[test]
fn rollback_to_midpoint_truncates_metadata() {
    let dir = tempdir().unwrap();
    let wal = Wal::init(config(dir.path()), InitMode::CreateIfNotExists).unwrap();

    write_epochs(&wal, 1..=100);
    assert_eq!(wal.query_durable_epoch(), Epoch::new(100));

    wal.rollback_to_epoch(Epoch::new(50)).unwrap();
    assert_eq!(wal.query_durable_epoch(), Epoch::new(50));

    // Exactly the surviving epochs are iterable; a range past the horizon
    // truncates to it.
    let seen = count_epochs(&wal, 1, 51);
    assert_eq!(seen, (1..=50).collect::<Vec<_>>());
    let truncated = count_epochs(&wal, 1, 101);
    assert_eq!(truncated.len(), 50);

    wal.uninit().unwrap();
}

#[test]
fn writes_resume_after_rollback() {
    let dir = tempdir().unwrap();
    let wal = Wal::init(config(dir.path()), InitMode::CreateIfNotExists).unwrap();

    write_epochs(&wal, 1..=60);
    wal.rollback_to_epoch(Epoch::new(40)).unwrap();

    // The next epoch after the new horizon commits normally.
    let epoch = Epoch::new(41);
    wal.assure_writer_space(0).unwrap();
    wal.on_wal_write(0, &[0xeeu8; 256], epoch).unwrap();
    commit(&wal, epoch);

    let mut cursor = wal.open_log_cursor(Epoch::new(40), Epoch::new(42)).unwrap();
    let mut found = Vec::new();
    while cursor.is_valid() {
        found.push((cursor.current_epoch().raw(), cursor.data().to_vec()));
        cursor.next().unwrap();
    }
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].0, 40);
    assert_eq!(found[0].1, vec![40u8; 512]);
    assert_eq!(found[1].0, 41);
    assert_eq!(found[1].1, vec![0xeeu8; 256]);

    drop(cursor);
    wal.uninit().unwrap();
}

#[test]
fn metadata_bounds_search_after_commit() {
    let dir = tempdir().unwrap();
    let wal = Wal::init(config(dir.path()), InitMode::CreateIfNotExists).unwrap();

    write_epochs(&wal, 1..=20);

    // Epoch records carry zero user metadata from the flusher, so a
    // predicate on zero matches everything and the bounds are the range
    // ends.
    let lower = wal
        .find_metadata_lower_bound(0, |v| v == 0)
        .unwrap()
        .unwrap();
    assert_eq!(lower.epoch_id, 1);
    let upper = wal
        .find_metadata_upper_bound(0, |v| v == 0)
        .unwrap()
        .unwrap();
    assert_eq!(upper.epoch_id, 20);
    let none = wal.find_metadata_lower_bound(0, |v| v > 0).unwrap();
    assert!(none.is_none());

    wal.uninit().unwrap();
}
