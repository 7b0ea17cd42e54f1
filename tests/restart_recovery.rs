//! # Restart and Recovery
//!
//! Closes an instance and brings it back from its persistent state:
//!
//! - the durable horizon survives,
//! - committed bytes remain readable (NVM-resident segments are drained
//!   to disk during recovery),
//! - the write path resumes in a fresh segment,
//! - `CreateTruncate` wipes prior state, `Restart` requires it.

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
        segment_size: 4096,
        nv_quota: 4 * 4096,
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

fn read_all(wal: &Wal, begin: u64, end: u64) -> Vec<(u64, Vec<u8>)> {
    let mut cursor = wal
        .open_log_cursor(Epoch::new(begin), Epoch::new(end))
        .unwrap();
    let mut out = Vec::new();
    while cursor.is_valid() {
        out.push((cursor.current_epoch().raw(), cursor.data().to_vec()));
        cursor.next().unwrap();
    }
    out
}

#[test]
fn committed_epochs_survive_restart() {
    let dir = tempdir().unwrap();

    {
        let wal = Wal::init(config(dir.path()), InitMode::CreateIfNotExists).unwrap();
        for e in 1..=5u64 {
            let epoch = Epoch::new(e);
            wal.assure_writer_space(0).unwrap();
            wal.on_wal_write(0, &[e as u8; 1024], epoch).unwrap();
            commit(&wal, epoch);
        }
        wal.uninit().unwrap();
    }

    let wal = Wal::init(config(dir.path()), InitMode::Restart).unwrap();
    assert_eq!(wal.query_durable_epoch(), Epoch::new(5));

    let epochs = read_all(&wal, 1, 6);
    let total: usize = epochs.iter().map(|(_, data)| data.len()).sum();
    assert_eq!(total, 5 * 1024);
    for (e, data) in &epochs {
        assert!(data.iter().all(|&b| b == *e as u8));
    }

    // The write path resumes past the recovered horizon.
    let epoch = Epoch::new(6);
    wal.assure_writer_space(0).unwrap();
    wal.on_wal_write(0, &[6u8; 512], epoch).unwrap();
    commit(&wal, epoch);
    let after = read_all(&wal, 6, 7);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].1, vec![6u8; 512]);

    wal.uninit().unwrap();
}

#[test]
fn create_if_not_exists_restarts_existing_state() {
    let dir = tempdir().unwrap();
    {
        let wal = Wal::init(config(dir.path()), InitMode::CreateIfNotExists).unwrap();
        wal.on_wal_write(0, &[7u8; 256], Epoch::new(1)).unwrap();
        commit(&wal, Epoch::new(1));
        wal.uninit().unwrap();
    }
    let wal = Wal::init(config(dir.path()), InitMode::CreateIfNotExists).unwrap();
    assert_eq!(wal.query_durable_epoch(), Epoch::new(1));
    assert_eq!(read_all(&wal, 1, 2)[0].1, vec![7u8; 256]);
    wal.uninit().unwrap();
}

#[test]
fn create_truncate_discards_existing_state() {
    let dir = tempdir().unwrap();
    {
        let wal = Wal::init(config(dir.path()), InitMode::CreateIfNotExists).unwrap();
        wal.on_wal_write(0, &[9u8; 256], Epoch::new(1)).unwrap();
        commit(&wal, Epoch::new(1));
        wal.uninit().unwrap();
    }
    let wal = Wal::init(config(dir.path()), InitMode::CreateTruncate).unwrap();
    assert_eq!(wal.query_durable_epoch(), Epoch::INVALID);
    let cursor = wal.open_log_cursor(Epoch::new(1), Epoch::new(2)).unwrap();
    assert!(!cursor.is_valid());
    drop(cursor);
    wal.uninit().unwrap();
}

#[test]
fn restart_without_state_fails() {
    let dir = tempdir().unwrap();
    assert!(Wal::init(config(dir.path()), InitMode::Restart).is_err());
}

#[test]
fn resuming_epoch_seeds_the_horizon() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.resuming_epoch = Epoch::new(41);
    let wal = Wal::init(cfg, InitMode::CreateIfNotExists).unwrap();
    assert_eq!(wal.query_durable_epoch(), Epoch::new(41));

    // The first writable epoch is the successor of the resumed horizon.
    let epoch = Epoch::new(42);
    wal.on_wal_write(0, &[0x42u8; 128], epoch).unwrap();
    commit(&wal, epoch);
    assert_eq!(read_all(&wal, 42, 43)[0].1, vec![0x42u8; 128]);

    wal.uninit().unwrap();
}
