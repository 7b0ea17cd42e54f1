//! # Metadata Store (MDS)
//!
//! A paged, buffered index mapping every committed epoch to the segment
//! range and byte offsets holding its log bytes. The flusher writes one
//! 64-byte record per concluded epoch; readers binary-search and iterate
//! records to bind cursors to byte extents.
//!
//! ## Layout
//!
//! Epoch `e` maps to a fixed location:
//!
//! ```text
//! file_no = e % MDS_PAGEFILE_COUNT
//! record  = e / MDS_PAGEFILE_COUNT
//! page_no = record / records_per_page + 1      (pages are 1-based)
//! offset  = record % records_per_page
//! ```
//!
//! Page files are append-only ([`io`]); the tail page of each file lives in
//! an NVM write buffer ([`buffer`]) until the next page is needed, at which
//! point it is written back and the buffer recycled. Because epochs arrive
//! sequentially, the records not yet on disk always fit in that single
//! buffered page.
//!
//! ## Readers
//!
//! Concurrent readers use the optimistic anchor protocol in [`buffer`] and
//! fall back to positional reads of the page file. The write path is
//! single-threaded (the flusher); only `rollback` breaks the append-only
//! discipline, and it is documented as unsafe against concurrent readers.

pub mod buffer;
pub mod io;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use tracing::{debug, info};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::config::{InitMode, EPOCH_METADATA_SIZE, MDS_PAGEFILE_COUNT, MDS_READ_PREFETCH};
use crate::control::ControlBlock;
use crate::epoch::Epoch;
use crate::error::WalError;

use self::buffer::BufferManager;
use self::io::MdsIo;

/// One epoch's extent in the log. Fixed 64 bytes — the NVM failure-atomic
/// write unit — so a record is never observed torn.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct EpochMetadata {
    pub epoch_id: u64,
    pub from_seg_id: u64,
    pub from_offset: u64,
    pub to_seg_id: u64,
    pub to_off: u64,
    pub user_metadata_0: u64,
    pub user_metadata_1: u64,
    _reserved: u64,
}

const _: () = assert!(std::mem::size_of::<EpochMetadata>() == EPOCH_METADATA_SIZE);

impl EpochMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        epoch: Epoch,
        from_seg_id: u64,
        from_offset: u64,
        to_seg_id: u64,
        to_off: u64,
        user_metadata_0: u64,
        user_metadata_1: u64,
    ) -> Self {
        Self {
            epoch_id: epoch.raw(),
            from_seg_id,
            from_offset,
            to_seg_id,
            to_off,
            user_metadata_0,
            user_metadata_1,
            _reserved: 0,
        }
    }

    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }

    pub fn epoch(&self) -> Epoch {
        Epoch::new(self.epoch_id)
    }

    fn user_metadata(&self, user_metadata_id: u32) -> u64 {
        match user_metadata_id {
            1 => self.user_metadata_1,
            _ => self.user_metadata_0,
        }
    }
}

pub struct MdsCore {
    io: MdsIo,
    bufmgr: BufferManager,
    control: Arc<ControlBlock>,
    /// Largest epoch with a record in the store; in-memory twin of the
    /// durable horizon, lowered only by rollback.
    latest_epoch: AtomicU64,
    page_size: u64,
    records_per_page: u64,
}

impl MdsCore {
    pub fn init(
        nv_root: &Path,
        disk_root: &Path,
        page_size: u64,
        mode: InitMode,
        control: Arc<ControlBlock>,
    ) -> Result<Self> {
        let (io, io_restarted) = MdsIo::init(disk_root, page_size, mode)?;
        let (bufmgr, buf_restarted) = BufferManager::init(nv_root, page_size, mode)?;
        ensure!(
            io_restarted == buf_restarted,
            WalError::Corrupt(
                "metadata page files and buffers disagree about prior state".into()
            )
        );

        let mds = Self {
            io,
            bufmgr,
            control,
            latest_epoch: AtomicU64::new(0),
            page_size,
            records_per_page: page_size / EPOCH_METADATA_SIZE as u64,
        };
        if io_restarted {
            mds.recover()?;
        } else {
            mds.latest_epoch
                .store(mds.control.durable_epoch().raw(), Ordering::Release);
        }
        Ok(mds)
    }

    // Epoch-to-location mapping. See the module doc for the formulas.

    fn file_no(&self, epoch: Epoch) -> u32 {
        (epoch.raw() % MDS_PAGEFILE_COUNT as u64) as u32
    }

    fn record_index(&self, epoch: Epoch) -> u64 {
        epoch.raw() / MDS_PAGEFILE_COUNT as u64
    }

    fn page_no(&self, epoch: Epoch) -> u64 {
        self.record_index(epoch) / self.records_per_page + 1
    }

    fn page_offset(&self, epoch: Epoch) -> u64 {
        self.record_index(epoch) % self.records_per_page
    }

    fn file_offset(&self, epoch: Epoch) -> u64 {
        (self.page_no(epoch) - 1) * self.page_size
            + self.page_offset(epoch) * EPOCH_METADATA_SIZE as u64
    }

    pub fn latest_epoch(&self) -> Epoch {
        Epoch::new(self.latest_epoch.load(Ordering::Acquire))
    }

    /// Restores the store to its latest consistent durable state, driven by
    /// the control block.
    fn recover(&self) -> Result<()> {
        let durable = self.control.durable_epoch();
        let paged = self.control.paged_mds_epoch();

        if paged.is_after(durable) {
            // A rollback's truncation was interrupted; finish it.
            info!(%durable, %paged, "completing interrupted metadata rollback");
            self.rollback(durable)?;
            return Ok(());
        }

        if durable.is_valid() {
            // Re-anchor each buffer to the page holding its newest record;
            // the NVM buffer contents survived, only the anchor is
            // volatile.
            for file_no in 0..MDS_PAGEFILE_COUNT {
                let mut e = durable.raw();
                while e > 0 && (e % MDS_PAGEFILE_COUNT as u64) != file_no as u64 {
                    e -= 1;
                }
                if e > 0 {
                    let page_no = self.page_no(Epoch::new(e));
                    self.bufmgr
                        .alloc_page(file_no, page_no)
                        .map_err(eyre::Report::from)?;
                }
            }
        }
        self.latest_epoch.store(durable.raw(), Ordering::Release);
        info!(%durable, %paged, "metadata store recovered");
        Ok(())
    }

    /// Writes one epoch's record: allocates its page (writing back the
    /// buffer if full), persists the 64-byte record, bumps the in-memory
    /// latest epoch, and durably advances the control block's durable
    /// epoch.
    pub fn write_epoch(&self, meta: &EpochMetadata) -> Result<()> {
        let epoch = meta.epoch();
        ensure!(
            epoch.is_valid(),
            WalError::InvalidArgument("cannot record the invalid epoch".into())
        );
        let file_no = self.file_no(epoch);
        let page_no = self.page_no(epoch);

        let buffer = match self.bufmgr.alloc_page(file_no, page_no) {
            Ok(buffer) => buffer,
            Err(WalError::BufferFull) => {
                // Expected: page out the dirty buffer, durably record how
                // far the paging got, then the allocation must succeed.
                debug!(file_no, page_no, "metadata buffer full, paging out");
                self.writeback()?;
                self.control
                    .update_paged_mds_epoch(self.control.durable_epoch())?;
                self.bufmgr.alloc_page(file_no, page_no)?
            }
            Err(other) => return Err(other.into()),
        };

        buffer.write_record(self.page_offset(epoch), meta)?;
        self.latest_epoch.store(epoch.raw(), Ordering::Release);
        self.control.update_durable_epoch(epoch)
    }

    /// Appends all dirty buffered pages to their files.
    pub fn writeback(&self) -> Result<()> {
        self.bufmgr.writeback(&self.io)
    }

    /// Reads one epoch's record, via the optimistic buffer or the page
    /// file.
    pub fn read_one_epoch(&self, epoch: Epoch) -> Result<EpochMetadata> {
        ensure!(
            epoch.is_valid(),
            WalError::InvalidArgument("cannot read the invalid epoch".into())
        );
        let iter = EpochIterator::new(self, epoch, epoch.next())?;
        ensure!(!iter.done(), "epoch {} is out of the readable range", epoch);
        let meta = *iter.current();
        ensure!(
            meta.epoch_id == epoch.raw(),
            WalError::Corrupt(format!(
                "metadata record for epoch {} carries epoch {}",
                epoch, meta.epoch_id
            ))
        );
        Ok(meta)
    }

    /// Convenience: the record of the newest epoch in the store.
    pub fn read_latest_epoch(&self) -> Result<EpochMetadata> {
        self.read_one_epoch(self.latest_epoch())
    }

    /// Truncates the store back to `epoch`: durably lowers the durable
    /// horizon, undoes paging past it, and lowers the in-memory latest.
    ///
    /// Destructive; must not run concurrently with optimistic readers.
    pub fn rollback(&self, epoch: Epoch) -> Result<()> {
        self.control.set_durable_epoch(epoch)?;

        if self.control.paged_mds_epoch().is_after(epoch) {
            if epoch.is_valid() {
                let file_no = self.file_no(epoch);
                let page_no = self.page_no(epoch);
                self.bufmgr.read_page(&self.io, file_no, page_no)?;
                self.io.truncate(file_no, page_no - 1)?;
                let paged =
                    self.records_per_page * (page_no - 1) * MDS_PAGEFILE_COUNT as u64;
                self.control.set_paged_mds_epoch(Epoch::new(paged))?;
            } else {
                for file_no in 0..MDS_PAGEFILE_COUNT {
                    self.io.truncate(file_no, 0)?;
                }
                self.control.set_paged_mds_epoch(Epoch::INVALID)?;
            }
        }

        if self.latest_epoch().is_after(epoch) {
            self.latest_epoch.store(epoch.raw(), Ordering::Release);
        }
        info!(%epoch, "metadata store rolled back");
        Ok(())
    }

    /// Binary search over `[1, latest_epoch]` for the first record whose
    /// selected user-metadata word satisfies `predicate`.
    pub fn find_metadata_lower_bound<F>(
        &self,
        user_metadata_id: u32,
        mut predicate: F,
    ) -> Result<Option<EpochMetadata>>
    where
        F: FnMut(u64) -> bool,
    {
        let mut low = 1u64;
        let mut high = self.latest_epoch().raw();
        let mut out = None;
        while low <= high {
            let mid = low + (high - low) / 2;
            let meta = self.read_one_epoch(Epoch::new(mid))?;
            if predicate(meta.user_metadata(user_metadata_id)) {
                out = Some(meta);
                high = mid - 1;
            } else {
                low = mid + 1;
            }
        }
        Ok(out)
    }

    /// Binary search over `[1, latest_epoch]` for the last record whose
    /// selected user-metadata word satisfies `predicate`.
    pub fn find_metadata_upper_bound<F>(
        &self,
        user_metadata_id: u32,
        mut predicate: F,
    ) -> Result<Option<EpochMetadata>>
    where
        F: FnMut(u64) -> bool,
    {
        let mut low = 1u64;
        let mut high = self.latest_epoch().raw();
        let mut out = None;
        while low <= high {
            let mid = low + (high - low) / 2;
            let meta = self.read_one_epoch(Epoch::new(mid))?;
            if predicate(meta.user_metadata(user_metadata_id)) {
                out = Some(meta);
                low = mid + 1;
            } else {
                high = mid - 1;
            }
        }
        Ok(out)
    }

    /// Fetches up to `max` consecutive records starting at `from`, bounded
    /// by the exclusive `end`. Cursor-side convenience over the iterator.
    pub fn fetch_window(
        &self,
        from: Epoch,
        end: Epoch,
        max: usize,
    ) -> Result<Vec<EpochMetadata>> {
        let mut out = Vec::with_capacity(max);
        let mut iter = EpochIterator::new(self, from, end)?;
        while !iter.done() && out.len() < max {
            out.push(*iter.current());
            iter.next()?;
        }
        Ok(out)
    }
}

/// Iterates epoch records over `[begin, end)`, prefetching up to
/// `MDS_READ_PREFETCH` records per page-file read and never crossing a
/// page boundary in one prefetch.
pub struct EpochIterator<'a> {
    mds: &'a MdsCore,
    cur: Epoch,
    end: Epoch,
    buf: Vec<EpochMetadata>,
}

impl<'a> EpochIterator<'a> {
    pub fn new(mds: &'a MdsCore, begin: Epoch, end: Epoch) -> Result<Self> {
        ensure!(
            end.is_equal_or_after(begin),
            WalError::InvalidArgument(format!(
                "iterator range [{}, {}) is inverted",
                begin, end
            ))
        );
        let mut iter = Self {
            mds,
            cur: begin,
            end,
            buf: Vec::new(),
        };
        if !iter.done() {
            iter.prefetch()?;
        }
        Ok(iter)
    }

    pub fn done(&self) -> bool {
        self.cur.is_equal_or_after(self.end)
    }

    /// The current record. Caller must check `done()` first.
    pub fn current(&self) -> &EpochMetadata {
        self.buffered_index()
            .map(|idx| &self.buf[idx])
            .expect("iterator prefetch invariant violated")
    }

    /// Advances by one epoch, prefetching as needed.
    pub fn next(&mut self) -> Result<()> {
        self.cur = self.cur.next();
        if !self.done() && self.buffered_index().is_none() {
            self.prefetch()?;
        }
        Ok(())
    }

    fn buffered_index(&self) -> Option<usize> {
        self.buf
            .iter()
            .position(|meta| meta.epoch_id == self.cur.raw())
    }

    fn prefetch(&mut self) -> Result<()> {
        let e = self.cur;
        let mds = self.mds;
        let file_no = mds.file_no(e);
        let page_no = mds.page_no(e);

        // Fast path: the record may still live in the NVM write buffer.
        if let Some(meta) = mds
            .bufmgr
            .buffer(file_no)
            .optimistic_read(page_no, mds.page_offset(e))
        {
            self.buf.clear();
            self.buf.push(meta);
            return Ok(());
        }

        // Fallback: the page was written back; read ahead from the file
        // without crossing the page boundary or the range end.
        let on_page = mds.records_per_page - mds.page_offset(e);
        let until_end = self.end.raw().wrapping_sub(e.raw());
        let count = (MDS_READ_PREFETCH as u64).min(on_page).min(until_end) as usize;

        let mut bytes = vec![0u8; count * EPOCH_METADATA_SIZE];
        mds.io.pread(file_no, &mut bytes, mds.file_offset(e))?;

        self.buf.clear();
        for chunk in bytes.chunks_exact(EPOCH_METADATA_SIZE) {
            match EpochMetadata::read_from_bytes(chunk) {
                Ok(meta) => self.buf.push(meta),
                Err(_) => bail!(WalError::Corrupt(
                    "metadata record failed to parse".into()
                )),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn core(dir: &Path, mode: InitMode) -> MdsCore {
        let control = if ControlBlock::exists(dir) {
            Arc::new(ControlBlock::open(dir).unwrap())
        } else {
            Arc::new(ControlBlock::create(dir, Epoch::INVALID).unwrap())
        };
        MdsCore::init(dir, dir, 512, mode, control).unwrap()
    }

    fn extent(epoch: u64) -> EpochMetadata {
        EpochMetadata::new(Epoch::new(epoch), epoch, 0, epoch, 128, epoch * 10, 0)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mds = core(dir.path(), InitMode::CreateIfNotExists);
        for e in 1..=5u64 {
            mds.write_epoch(&extent(e)).unwrap();
        }
        assert_eq!(mds.latest_epoch(), Epoch::new(5));
        for e in 1..=5u64 {
            let meta = mds.read_one_epoch(Epoch::new(e)).unwrap();
            assert_eq!(meta, extent(e));
        }
    }

    #[test]
    fn paging_out_preserves_old_records() {
        let dir = tempdir().unwrap();
        let mds = core(dir.path(), InitMode::CreateIfNotExists);
        // 512-byte pages hold 8 records; 30 epochs forces several
        // writebacks.
        for e in 1..=30u64 {
            mds.write_epoch(&extent(e)).unwrap();
        }
        for e in 1..=30u64 {
            assert_eq!(mds.read_one_epoch(Epoch::new(e)).unwrap(), extent(e));
        }
        assert!(mds.control.paged_mds_epoch().is_valid());
    }

    #[test]
    fn iterator_walks_a_range_in_order() {
        let dir = tempdir().unwrap();
        let mds = core(dir.path(), InitMode::CreateIfNotExists);
        for e in 1..=20u64 {
            mds.write_epoch(&extent(e)).unwrap();
        }
        let mut iter = EpochIterator::new(&mds, Epoch::new(3), Epoch::new(18)).unwrap();
        let mut expected = 3u64;
        while !iter.done() {
            assert_eq!(iter.current().epoch_id, expected);
            iter.next().unwrap();
            expected += 1;
        }
        assert_eq!(expected, 18);
    }

    #[test]
    fn empty_range_is_done_immediately() {
        let dir = tempdir().unwrap();
        let mds = core(dir.path(), InitMode::CreateIfNotExists);
        let iter = EpochIterator::new(&mds, Epoch::new(1), Epoch::new(1)).unwrap();
        assert!(iter.done());
    }

    #[test]
    fn rollback_truncates_pages_and_latest() {
        let dir = tempdir().unwrap();
        let mds = core(dir.path(), InitMode::CreateIfNotExists);
        for e in 1..=100u64 {
            mds.write_epoch(&extent(e)).unwrap();
        }
        assert!(mds.control.paged_mds_epoch().raw() > 50);

        mds.rollback(Epoch::new(50)).unwrap();
        assert_eq!(mds.control.durable_epoch(), Epoch::new(50));
        assert_eq!(mds.latest_epoch(), Epoch::new(50));
        assert!(mds.control.paged_mds_epoch().raw() <= 50);

        let mut iter = EpochIterator::new(&mds, Epoch::new(1), Epoch::new(51)).unwrap();
        let mut count = 0;
        while !iter.done() {
            count += 1;
            iter.next().unwrap();
        }
        assert_eq!(count, 50);
    }

    #[test]
    fn recovery_resumes_writes_after_restart() {
        let dir = tempdir().unwrap();
        {
            let mds = core(dir.path(), InitMode::CreateIfNotExists);
            for e in 1..=12u64 {
                mds.write_epoch(&extent(e)).unwrap();
            }
        }
        let mds = core(dir.path(), InitMode::Restart);
        assert_eq!(mds.latest_epoch(), Epoch::new(12));
        for e in 1..=12u64 {
            assert_eq!(mds.read_one_epoch(Epoch::new(e)).unwrap(), extent(e));
        }
        // And the write path continues where it left off.
        mds.write_epoch(&extent(13)).unwrap();
        assert_eq!(mds.read_one_epoch(Epoch::new(13)).unwrap(), extent(13));
    }

    #[test]
    fn interrupted_rollback_completes_at_recovery() {
        let dir = tempdir().unwrap();
        {
            let mds = core(dir.path(), InitMode::CreateIfNotExists);
            for e in 1..=40u64 {
                mds.write_epoch(&extent(e)).unwrap();
            }
            // Crash mid-rollback: the durable horizon was lowered but the
            // truncation never ran.
            mds.control.set_durable_epoch(Epoch::new(10)).unwrap();
        }
        let mds = core(dir.path(), InitMode::Restart);
        assert_eq!(mds.latest_epoch(), Epoch::new(10));
        assert!(mds.control.paged_mds_epoch().raw() <= 10);
        for e in 1..=10u64 {
            assert_eq!(mds.read_one_epoch(Epoch::new(e)).unwrap(), extent(e));
        }
    }

    #[test]
    fn bounds_search_user_metadata() {
        let dir = tempdir().unwrap();
        let mds = core(dir.path(), InitMode::CreateIfNotExists);
        for e in 1..=64u64 {
            mds.write_epoch(&extent(e)).unwrap();
        }
        // user_metadata_0 = 10 * epoch; find the first epoch with value
        // >= 250 and the last with value <= 250.
        let lower = mds
            .find_metadata_lower_bound(0, |v| v >= 250)
            .unwrap()
            .unwrap();
        assert_eq!(lower.epoch_id, 25);
        let upper = mds
            .find_metadata_upper_bound(0, |v| v <= 250)
            .unwrap()
            .unwrap();
        assert_eq!(upper.epoch_id, 25);

        let none = mds.find_metadata_lower_bound(0, |v| v >= 100_000).unwrap();
        assert!(none.is_none());
    }
}
