//! # Persistent Control Block
//!
//! A distinguished NVM region recording the durability frontier of the whole
//! instance:
//!
//! ```text
//! +------------------+------------------+--------------------+----------+
//! | durable_epoch    | paged_mds_epoch  | last_synced_dsid   | reserved |
//! | (8 bytes)        | (8 bytes)        | (8 bytes)          | (488)    |
//! +------------------+------------------+--------------------+----------+
//! ```
//!
//! Each word has exactly one writer: the flusher owns `durable_epoch` and
//! `paged_mds_epoch`, the fsyncer owns `last_synced_dsid`. Ordering rule:
//! a control word is persisted only *after* the data it describes is
//! persistent, so a recovered control block never claims more than the
//! media holds.
//!
//! Words are read and written through `AtomicU64` views into the mapping so
//! that concurrent readers (cursors loading `last_synced_dsid`) are
//! well-defined; every durable store is followed by a word-granular
//! [`pmem::persist`].

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::CONTROL_FILE_NAME;
use crate::epoch::Epoch;
use crate::pmem;

/// File size; one sector so a single-block filesystem journal covers it.
const CONTROL_FILE_SIZE: u64 = 512;

const DURABLE_EPOCH_OFFSET: usize = 0;
const PAGED_MDS_EPOCH_OFFSET: usize = 8;
const LAST_SYNCED_DSID_OFFSET: usize = 16;

pub struct ControlBlock {
    map: MmapMut,
}

impl ControlBlock {
    pub fn exists(nv_root: &Path) -> bool {
        nv_root.join(CONTROL_FILE_NAME).exists()
    }

    /// Creates a fresh control block with the durable horizon at
    /// `resuming_epoch` and everything else at zero.
    pub fn create(nv_root: &Path, resuming_epoch: Epoch) -> Result<Self> {
        let path = nv_root.join(CONTROL_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create control block at {:?}", path))?;
        file.set_len(CONTROL_FILE_SIZE)
            .wrap_err("failed to size control block file")?;

        // SAFETY: freshly created file with exclusive write access, sized
        // above; the mapping is owned by the returned ControlBlock and all
        // concurrent access goes through the AtomicU64 views below.
        let map = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to map control block at {:?}", path))?
        };

        let block = Self { map };
        block
            .word(DURABLE_EPOCH_OFFSET)
            .store(resuming_epoch.raw(), Ordering::Release);
        block.word(PAGED_MDS_EPOCH_OFFSET).store(0, Ordering::Release);
        block.word(LAST_SYNCED_DSID_OFFSET).store(0, Ordering::Release);
        pmem::persist_all(&block.map)?;
        Ok(block)
    }

    /// Reopens an existing control block; its recorded frontiers drive
    /// recovery.
    pub fn open(nv_root: &Path) -> Result<Self> {
        let path = nv_root.join(CONTROL_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open control block at {:?}", path))?;
        let len = file
            .metadata()
            .wrap_err("failed to stat control block file")?
            .len();
        if len != CONTROL_FILE_SIZE {
            bail!(crate::error::WalError::Corrupt(format!(
                "control block at {:?} has size {}, expected {}",
                path, len, CONTROL_FILE_SIZE
            )));
        }

        // SAFETY: the file has the expected size and nvlog is the only
        // writer of files under nv_root; all shared access goes through
        // the AtomicU64 views.
        let map = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to map control block at {:?}", path))?
        };
        Ok(Self { map })
    }

    fn word(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: offset is one of the three compile-time field offsets,
        // 8-byte aligned within a page-aligned mapping of at least
        // CONTROL_FILE_SIZE bytes; AtomicU64 has the same layout as u64.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn persist_word(&self, offset: usize) -> Result<()> {
        pmem::persist(&self.map, offset, 8)
    }

    pub fn durable_epoch(&self) -> Epoch {
        Epoch::new(self.word(DURABLE_EPOCH_OFFSET).load(Ordering::Acquire))
    }

    /// Durably advances the durable epoch. Monotone; called only by the
    /// flusher at a stable-epoch boundary.
    pub fn update_durable_epoch(&self, epoch: Epoch) -> Result<()> {
        ensure!(
            epoch.is_equal_or_after(self.durable_epoch()),
            "durable epoch must not regress: {} -> {}",
            self.durable_epoch(),
            epoch
        );
        self.word(DURABLE_EPOCH_OFFSET)
            .store(epoch.raw(), Ordering::Release);
        self.persist_word(DURABLE_EPOCH_OFFSET)
    }

    /// Durably stores the durable epoch without the monotonicity check.
    /// Only rollback may lower the horizon.
    pub fn set_durable_epoch(&self, epoch: Epoch) -> Result<()> {
        self.word(DURABLE_EPOCH_OFFSET)
            .store(epoch.raw(), Ordering::Release);
        self.persist_word(DURABLE_EPOCH_OFFSET)
    }

    pub fn paged_mds_epoch(&self) -> Epoch {
        Epoch::new(self.word(PAGED_MDS_EPOCH_OFFSET).load(Ordering::Acquire))
    }

    pub fn update_paged_mds_epoch(&self, epoch: Epoch) -> Result<()> {
        ensure!(
            epoch.is_equal_or_after(self.paged_mds_epoch()),
            "paged mds epoch must not regress: {} -> {}",
            self.paged_mds_epoch(),
            epoch
        );
        self.word(PAGED_MDS_EPOCH_OFFSET)
            .store(epoch.raw(), Ordering::Release);
        self.persist_word(PAGED_MDS_EPOCH_OFFSET)
    }

    /// Durably stores the paged horizon without the monotonicity check;
    /// rollback lowers it after truncating the page file.
    pub fn set_paged_mds_epoch(&self, epoch: Epoch) -> Result<()> {
        self.word(PAGED_MDS_EPOCH_OFFSET)
            .store(epoch.raw(), Ordering::Release);
        self.persist_word(PAGED_MDS_EPOCH_OFFSET)
    }

    pub fn last_synced_dsid(&self) -> u64 {
        self.word(LAST_SYNCED_DSID_OFFSET).load(Ordering::Acquire)
    }

    /// Durably advances the on-disk segment frontier. Strictly increasing;
    /// called only by the fsyncer after the segment file and its parent
    /// directory are fsynced.
    pub fn advance_last_synced_dsid(&self, dsid: u64) -> Result<()> {
        ensure!(
            dsid > self.last_synced_dsid(),
            "last_synced_dsid must strictly increase: {} -> {}",
            self.last_synced_dsid(),
            dsid
        );
        self.word(LAST_SYNCED_DSID_OFFSET)
            .store(dsid, Ordering::Release);
        self.persist_word(LAST_SYNCED_DSID_OFFSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen_preserves_words() {
        let dir = tempdir().unwrap();
        {
            let cb = ControlBlock::create(dir.path(), Epoch::new(7)).unwrap();
            cb.update_durable_epoch(Epoch::new(9)).unwrap();
            cb.update_paged_mds_epoch(Epoch::new(8)).unwrap();
            cb.advance_last_synced_dsid(3).unwrap();
        }
        let cb = ControlBlock::open(dir.path()).unwrap();
        assert_eq!(cb.durable_epoch(), Epoch::new(9));
        assert_eq!(cb.paged_mds_epoch(), Epoch::new(8));
        assert_eq!(cb.last_synced_dsid(), 3);
    }

    #[test]
    fn durable_epoch_rejects_regression() {
        let dir = tempdir().unwrap();
        let cb = ControlBlock::create(dir.path(), Epoch::new(5)).unwrap();
        assert!(cb.update_durable_epoch(Epoch::new(4)).is_err());
        // Explicit rollback path is allowed to lower it.
        cb.set_durable_epoch(Epoch::new(4)).unwrap();
        assert_eq!(cb.durable_epoch(), Epoch::new(4));
    }

    #[test]
    fn last_synced_dsid_must_strictly_increase() {
        let dir = tempdir().unwrap();
        let cb = ControlBlock::create(dir.path(), Epoch::INVALID).unwrap();
        cb.advance_last_synced_dsid(1).unwrap();
        assert!(cb.advance_last_synced_dsid(1).is_err());
        cb.advance_last_synced_dsid(2).unwrap();
    }

    #[test]
    fn open_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        ControlBlock::create(dir.path(), Epoch::INVALID).unwrap();
        let path = dir.path().join(CONTROL_FILE_NAME);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(100).unwrap();
        assert!(ControlBlock::open(dir.path()).is_err());
    }
}
