//! # Log Cursor
//!
//! A cursor binds an epoch range `[begin, end)` to a sequence of
//! `(bytes, length, epoch)` views, walking each epoch's extent across the
//! segments that hold it. Segments already copied to block storage are
//! memory-mapped read-only; segments still resident in NVM are viewed in
//! place under a read pin.
//!
//! ## Contiguous disk mapping
//!
//! The first segment of a disk-resident run is mapped at a kernel-chosen
//! base (offset truncated down to a page boundary). Each subsequent
//! segment is mapped immediately after it with `MAP_FIXED_NOREPLACE`, so a
//! multi-segment extent reads as one contiguous region when the address
//! space cooperates. When it does not, the region ends early
//! (`fetch_complete = false`) and the walk resumes with a fresh region —
//! correctness never depends on the extension succeeding.
//!
//! ## NVM pins and the tier race
//!
//! A segment's tier is decided by `dsid ≤ last_synced_dsid`. The check and
//! the pin are not atomic together, so the cursor re-checks the slot's
//! dsid after pinning: a recycled slot redirects the reader to disk, a
//! slot mid-recycle (pins = −1) is retried after a yield. Both retries are
//! safe because a dsid's bytes are immutable once written.
//!
//! Consuming a view unmaps its disk region or drops its pins. A cursor
//! holds at most `NUM_READ_REGIONS` live regions.

use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use tracing::trace;

use crate::config::{CURSOR_EPOCH_PREFETCH, NUM_READ_REGIONS};
use crate::epoch::Epoch;
use crate::error::WalError;
use crate::fsyncer::disk_segment_path;
use crate::mds::EpochMetadata;
use crate::wal::WalShared;

/// One contiguously-mapped run of disk segments.
struct DiskRegion {
    base: *mut u8,
    mapped_len: usize,
    /// Start of epoch data within the mapping (alignment slack).
    data_offset: usize,
    data_len: usize,
    /// False when a fixed-address extension failed and the run was cut
    /// short of the extent's remaining disk segments.
    fetch_complete: bool,
}

impl Drop for DiskRegion {
    fn drop(&mut self) {
        // SAFETY: base/mapped_len came from a successful mmap owned
        // exclusively by this region.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mapped_len);
        }
    }
}

enum View {
    Disk(DiskRegion),
    Nvm {
        slot_index: usize,
        offset: usize,
        len: usize,
    },
    /// An epoch that produced no bytes still yields one (empty) view.
    Empty,
}

pub struct LogCursor {
    wal: Arc<WalShared>,
    end_epoch: Epoch,
    current_epoch: Epoch,
    /// Prefetched metadata; the front entry describes `current_epoch`.
    fetched: VecDeque<EpochMetadata>,
    /// Views for the current epoch; the front is what `data()` exposes.
    views: VecDeque<View>,
    /// Where to resume building views when the region cap interrupted the
    /// current epoch's extent walk: (extent, next dsid).
    pending: Option<(EpochMetadata, u64)>,
}

fn page_align_down(offset: u64) -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    offset & !(page - 1)
}

impl LogCursor {
    pub(crate) fn open(wal: Arc<WalShared>, begin: Epoch, end: Epoch) -> Result<Self> {
        ensure!(
            end.is_equal_or_after(begin),
            WalError::InvalidArgument(format!("cursor range [{}, {}) is inverted", begin, end))
        );
        let mut cursor = Self {
            wal,
            end_epoch: end,
            current_epoch: Epoch::INVALID,
            fetched: VecDeque::new(),
            views: VecDeque::new(),
            pending: None,
        };

        // Truncate the range to the durable horizon; epochs past it do not
        // exist yet as far as readers are concerned.
        let bound = cursor.wal.durable().next();
        if cursor.end_epoch.is_after(bound) {
            cursor.end_epoch = bound;
        }
        if !begin.is_valid() || begin.is_equal_or_after(cursor.end_epoch) {
            // Empty range: immediately exhausted.
            return Ok(cursor);
        }

        cursor.current_epoch = begin;
        match cursor.enter_epoch() {
            Ok(()) => Ok(cursor),
            Err(err) => {
                cursor.release_all();
                Err(err)
            }
        }
    }

    /// True while the cursor points at a readable view.
    pub fn is_valid(&self) -> bool {
        !self.views.is_empty()
    }

    /// The current view's bytes.
    pub fn data(&self) -> &[u8] {
        match self.views.front() {
            Some(View::Disk(region)) => {
                // SAFETY: the mapping is live until this view is consumed,
                // and data_offset + data_len is within it.
                unsafe {
                    std::slice::from_raw_parts(
                        region.base.add(region.data_offset),
                        region.data_len,
                    )
                }
            }
            Some(View::Nvm {
                slot_index,
                offset,
                len,
            }) => {
                // SAFETY: the cursor holds a read pin on this slot, so the
                // flusher cannot recycle it and the range is immutable.
                unsafe { self.wal.segments.slot(*slot_index).slice(*offset, *len) }
            }
            Some(View::Empty) | None => &[],
        }
    }

    pub fn data_len(&self) -> usize {
        match self.views.front() {
            Some(View::Disk(region)) => region.data_len,
            Some(View::Nvm { len, .. }) => *len,
            Some(View::Empty) | None => 0,
        }
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    /// Consumes the current view and advances to the next view or epoch.
    pub fn next(&mut self) -> Result<()> {
        self.release_front();
        if !self.views.is_empty() {
            return Ok(());
        }
        if let Some((meta, resume_dsid)) = self.pending.take() {
            // The current epoch's extent walk was interrupted by the
            // region cap; continue it.
            self.build_views(&meta, resume_dsid)?;
            if !self.views.is_empty() {
                return Ok(());
            }
        }

        self.current_epoch = self.current_epoch.next();
        self.fetched.pop_front();
        if self.current_epoch.is_equal_or_after(self.end_epoch) {
            self.current_epoch = Epoch::INVALID;
            return Ok(());
        }
        self.enter_epoch()
    }

    /// Loads metadata for the current epoch (prefetching ahead) and builds
    /// its views.
    fn enter_epoch(&mut self) -> Result<()> {
        if self.fetched.is_empty() {
            let window = self.wal.mds.fetch_window(
                self.current_epoch,
                self.end_epoch,
                CURSOR_EPOCH_PREFETCH,
            )?;
            self.fetched = window.into();
        }
        let meta = match self.fetched.front() {
            Some(meta) => *meta,
            None => bail!(WalError::Corrupt(format!(
                "no metadata for epoch {} inside the durable horizon",
                self.current_epoch
            ))),
        };
        ensure!(
            meta.epoch() == self.current_epoch,
            WalError::Corrupt(format!(
                "metadata for epoch {} carries epoch {}",
                self.current_epoch, meta.epoch_id
            ))
        );
        self.build_views(&meta, meta.from_seg_id)
    }

    /// Bounds of the epoch's bytes within segment `dsid`.
    fn piece_bounds(&self, meta: &EpochMetadata, dsid: u64) -> (u64, u64) {
        let lo = if dsid == meta.from_seg_id {
            meta.from_offset
        } else {
            0
        };
        let hi = if dsid == meta.to_seg_id {
            meta.to_off
        } else {
            self.wal.config.segment_size
        };
        (lo, hi)
    }

    fn build_views(&mut self, meta: &EpochMetadata, start_dsid: u64) -> Result<()> {
        debug_assert!(self.views.is_empty());
        ensure!(
            meta.to_seg_id >= meta.from_seg_id,
            WalError::Corrupt(format!(
                "epoch {} extent runs backwards: dsid {} to {}",
                meta.epoch_id, meta.from_seg_id, meta.to_seg_id
            ))
        );

        let started_at_extent_head = start_dsid == meta.from_seg_id;
        let mut dsid = start_dsid;
        while dsid <= meta.to_seg_id {
            if self.views.len() >= NUM_READ_REGIONS {
                // Cap live mappings; remember where to resume when the
                // queued views are consumed.
                self.pending = Some((*meta, dsid));
                return Ok(());
            }
            let (lo, hi) = self.piece_bounds(meta, dsid);
            if lo == hi {
                dsid += 1;
                continue;
            }

            let last_synced = self.wal.control.last_synced_dsid();
            if dsid <= last_synced {
                let (region, consumed) = self.map_disk_run(meta, dsid, last_synced)?;
                trace!(
                    epoch = meta.epoch_id,
                    from_dsid = dsid,
                    segments = consumed,
                    complete = region.fetch_complete,
                    "mapped disk region"
                );
                self.views.push_back(View::Disk(region));
                dsid += consumed;
                continue;
            }

            // NVM resident. Pin, then re-validate the binding.
            let slot_index = self.wal.segments.slot_index(dsid);
            let slot = self.wal.segments.slot(slot_index);
            match slot.try_pin(dsid) {
                crate::segment::PinOutcome::Pinned => {
                    self.views.push_back(View::Nvm {
                        slot_index,
                        offset: lo as usize,
                        len: (hi - lo) as usize,
                    });
                    dsid += 1;
                }
                crate::segment::PinOutcome::Recycling => {
                    std::thread::yield_now();
                }
                crate::segment::PinOutcome::Moved => {
                    // The segment reached disk while we were deciding; the
                    // loop re-reads the frontier and maps the file. The
                    // frontier word may trail the recycle by an instant.
                    std::thread::yield_now();
                }
            }
        }

        if self.views.is_empty() && started_at_extent_head {
            self.views.push_back(View::Empty);
        }
        Ok(())
    }

    /// Maps a maximal run of disk-resident segments contiguously, starting
    /// at `start_dsid`. Returns the region and how many segments it covers.
    fn map_disk_run(
        &self,
        meta: &EpochMetadata,
        start_dsid: u64,
        last_synced: u64,
    ) -> Result<(DiskRegion, u64)> {
        let seg_size = self.wal.config.segment_size;
        let disk_root = &self.wal.config.disk_root;

        let (lo, hi) = self.piece_bounds(meta, start_dsid);
        let aligned_lo = page_align_down(lo);
        let first_len = (seg_size - aligned_lo) as usize;

        let path = disk_segment_path(disk_root, start_dsid);
        let file = File::open(&path).map_err(|err| {
            eyre::Report::from(WalError::io("open disk segment", err))
        })?;

        // SAFETY: read-only shared mapping of a regular file we just
        // opened; length is within the file (segment files are exactly
        // seg_size bytes).
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                first_len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                aligned_lo as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            bail!(WalError::MmapFailed(std::io::Error::last_os_error()));
        }
        let base = base as *mut u8;
        drop(file);

        let mut region = DiskRegion {
            base,
            mapped_len: first_len,
            data_offset: (lo - aligned_lo) as usize,
            data_len: (hi - lo) as usize,
            fetch_complete: true,
        };
        let mut consumed = 1u64;

        // Extend contiguously over the rest of the disk-resident run.
        let mut next = start_dsid + 1;
        while next <= meta.to_seg_id && next <= last_synced {
            let path = disk_segment_path(disk_root, next);
            let file = File::open(&path).map_err(|err| {
                eyre::Report::from(WalError::io("open disk segment", err))
            })?;
            // SAFETY: fixed-address mapping placed exactly at the end of
            // our own region; MAP_FIXED_NOREPLACE refuses to clobber any
            // existing mapping rather than replacing it.
            let target = unsafe { region.base.add(region.mapped_len) };
            let mapped = unsafe {
                libc::mmap(
                    target as *mut libc::c_void,
                    seg_size as usize,
                    libc::PROT_READ,
                    libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
                    file.as_raw_fd(),
                    0,
                )
            };
            if mapped == libc::MAP_FAILED || mapped as *mut u8 != target {
                if mapped != libc::MAP_FAILED {
                    // The kernel placed it elsewhere; take it right back.
                    // SAFETY: we own this stray mapping.
                    unsafe {
                        libc::munmap(mapped, seg_size as usize);
                    }
                }
                region.fetch_complete = false;
                break;
            }
            let (_, piece_hi) = self.piece_bounds(meta, next);
            region.mapped_len += seg_size as usize;
            region.data_len += piece_hi as usize;
            consumed += 1;
            next += 1;
        }

        // SAFETY: hinting over our own mapping; madvise cannot fault.
        unsafe {
            libc::madvise(
                region.base as *mut libc::c_void,
                region.mapped_len,
                libc::MADV_WILLNEED,
            );
        }
        Ok((region, consumed))
    }

    fn release_front(&mut self) {
        match self.views.pop_front() {
            Some(View::Nvm { slot_index, .. }) => {
                self.wal.segments.slot(slot_index).unpin();
            }
            Some(View::Disk(region)) => drop(region),
            Some(View::Empty) | None => {}
        }
    }

    fn release_all(&mut self) {
        while !self.views.is_empty() {
            self.release_front();
        }
        self.current_epoch = Epoch::INVALID;
    }
}

impl Drop for LogCursor {
    fn drop(&mut self) {
        self.release_all();
    }
}
