//! # NVM Segment Slot Pool
//!
//! A fixed ring of N byte-addressable segment slots, each backed by a file
//! under `nv_root` and mapped for the lifetime of the instance. Durable
//! segment ids (dsids) grow monotonically from 1 and map onto slots by
//! `(dsid - 1) % N`; a slot is *recycled* for a new dsid once its previous
//! occupant is safely on block storage.
//!
//! ## Slot state
//!
//! ```text
//!           flusher fills            segment full
//! UNUSED ──────────────▶ ACTIVE ────────────────▶ FSYNC_REQUESTED
//!   ▲                                                   │ fsyncer copies,
//!   │   flusher recycles (pins 0 → -1, reset, pins 0)   │ fsyncs, marks
//!   └──────────────────────── FSYNC_COMPLETED ◀─────────┘ completed
//! ```
//!
//! The state is carried by per-slot atomics, not an enum, because three
//! threads observe it concurrently: the flusher (sole writer of segment
//! bytes), the fsyncer (reads full segments), and any number of cursors
//! (read pinned byte ranges).
//!
//! ## Reader pins
//!
//! `nv_reader_pins` is a signed count: 0 idle, >0 active readers, −1 the
//! flusher holding the slot exclusively for recycling. Readers enter with a
//! CAS increment from a non-negative value and re-check the slot's dsid
//! after pinning; the flusher recycles with a CAS of 0 → −1 and spins while
//! readers drain. A dsid's bytes never change once written, so a reader
//! that loses the race simply retries and finds the segment on disk.
//!
//! ## Safety model
//!
//! Segment bytes are written through raw pointers while other threads hold
//! shared references to the slot. This is sound because the protocol above
//! gives every byte range a single writer at a time and publishes it with
//! release/acquire pairs (`written_bytes` for the flusher → fsyncer and
//! flusher → reader edges, `nv_reader_pins` for recycling). Each unsafe
//! block states which edge it relies on.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapRaw;

use crate::config::NV_SEGMENT_FILE_PREFIX;
use crate::pmem;

/// Outcome of a reader's attempt to pin a slot for a specific dsid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// Pinned; the slot holds the requested dsid and its bytes are stable.
    Pinned,
    /// The flusher holds the slot exclusively; retry after a yield.
    Recycling,
    /// The slot has moved on to a different dsid; the requested segment is
    /// (or will shortly be) on disk.
    Moved,
}

pub struct SegmentSlot {
    map: MmapRaw,
    len: usize,
    dsid: AtomicU64,
    written_bytes: AtomicU64,
    fsync_requested: AtomicBool,
    fsync_completed: AtomicBool,
    fsync_error: AtomicI32,
    nv_reader_pins: AtomicI64,
}

impl SegmentSlot {
    fn open_file(path: &Path, len: u64, create: bool) -> Result<MmapRaw> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .wrap_err_with(|| format!("failed to open NVM segment file at {:?}", path))?;
        if create {
            file.set_len(len)
                .wrap_err_with(|| format!("failed to size NVM segment file at {:?}", path))?;
        } else {
            let actual = file
                .metadata()
                .wrap_err("failed to stat NVM segment file")?
                .len();
            ensure!(
                actual == len,
                crate::error::WalError::Corrupt(format!(
                    "NVM segment file {:?} has size {}, expected {}",
                    path, actual, len
                ))
            );
        }
        MmapRaw::map_raw(&file)
            .wrap_err_with(|| format!("failed to map NVM segment file at {:?}", path))
    }

    fn new(map: MmapRaw, len: usize) -> Self {
        Self {
            map,
            len,
            dsid: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            fsync_requested: AtomicBool::new(false),
            fsync_completed: AtomicBool::new(true),
            fsync_error: AtomicI32::new(0),
            nv_reader_pins: AtomicI64::new(0),
        }
    }

    pub fn dsid(&self) -> u64 {
        self.dsid.load(Ordering::Acquire)
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Acquire)
    }

    /// Publishes the new write frontier. Flusher only.
    pub fn publish_written_bytes(&self, written: u64) {
        debug_assert!(written as usize <= self.len);
        self.written_bytes.store(written, Ordering::Release);
    }

    pub fn fsync_requested(&self) -> bool {
        self.fsync_requested.load(Ordering::Acquire)
    }

    /// Marks the segment full and hands it to the fsyncer. Flusher only.
    pub fn request_fsync(&self) {
        self.fsync_requested.store(true, Ordering::Release);
    }

    pub fn fsync_completed(&self) -> bool {
        self.fsync_completed.load(Ordering::Acquire)
    }

    /// Marks the on-disk copy durable. Fsyncer only, after file and parent
    /// directory are fsynced.
    pub fn complete_fsync(&self) {
        self.fsync_completed.store(true, Ordering::Release);
    }

    pub fn fsync_error(&self) -> i32 {
        self.fsync_error.load(Ordering::Acquire)
    }

    /// Records a sticky fsync failure; the next rotation over this slot
    /// fails. Fsyncer only.
    pub fn record_fsync_error(&self, errno: i32) {
        self.fsync_error.store(errno, Ordering::Release);
    }

    /// Attempts to take a read pin for `expect_dsid`.
    pub fn try_pin(&self, expect_dsid: u64) -> PinOutcome {
        loop {
            let pins = self.nv_reader_pins.load(Ordering::Acquire);
            if pins < 0 {
                return PinOutcome::Recycling;
            }
            if self
                .nv_reader_pins
                .compare_exchange_weak(pins, pins + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // Re-check under the pin: the slot may have been recycled
            // between our load and the CAS.
            if self.dsid() == expect_dsid {
                return PinOutcome::Pinned;
            }
            self.unpin();
            return PinOutcome::Moved;
        }
    }

    pub fn unpin(&self) {
        let prev = self.nv_reader_pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Flusher-side: attempts to take the slot exclusively for recycling.
    /// Fails while any reader holds a pin.
    pub fn try_begin_recycle(&self) -> bool {
        self.nv_reader_pins
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Rebinds the slot to `new_dsid` and republishes it. Must only be
    /// called while holding the recycle exclusivity from
    /// [`try_begin_recycle`].
    pub fn reset_for(&self, new_dsid: u64) {
        debug_assert_eq!(self.nv_reader_pins.load(Ordering::Acquire), -1);
        self.written_bytes.store(0, Ordering::Release);
        self.fsync_requested.store(false, Ordering::Release);
        self.fsync_completed.store(false, Ordering::Release);
        self.fsync_error.store(0, Ordering::Release);
        self.dsid.store(new_dsid, Ordering::Release);
        self.nv_reader_pins.store(0, Ordering::Release);
    }

    /// Copies `len` bytes from `src` into the segment at `offset`.
    ///
    /// # Safety
    /// Caller must be the flusher, the slot's single writer, and `src` must
    /// be valid for `len` reads. The bytes become visible to other threads
    /// only through the subsequent release store of `written_bytes`.
    pub unsafe fn copy_in(&self, offset: usize, src: *const u8, len: usize) {
        debug_assert!(offset + len <= self.len);
        std::ptr::copy_nonoverlapping(src, self.map.as_mut_ptr().add(offset), len);
    }

    /// Returns a view of segment bytes.
    ///
    /// # Safety
    /// Caller must hold either a read pin (cursor), the knowledge that the
    /// segment is sealed and awaiting fsync (fsyncer), or be the flusher
    /// itself; in all three cases the protocol guarantees the range is not
    /// concurrently written.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.map.as_ptr().add(offset), len)
    }

    /// Durably persists `len` segment bytes starting at `offset`.
    pub fn persist_range(&self, offset: usize, len: usize) -> Result<()> {
        pmem::persist_raw(&self.map, offset, len)
    }

    fn zero_and_persist(&self) -> Result<()> {
        // SAFETY: called only during pool creation, before the slot is
        // shared with any other thread.
        unsafe {
            std::ptr::write_bytes(self.map.as_mut_ptr(), 0, self.len);
        }
        pmem::persist_raw_all(&self.map)
    }
}

// SAFETY: all cross-thread access to the mapped bytes is mediated by the
// pin/recycle and written_bytes publication protocol documented on the
// module; the remaining fields are atomics.
unsafe impl Send for SegmentSlot {}
unsafe impl Sync for SegmentSlot {}

pub struct SegmentPool {
    slots: Box<[SegmentSlot]>,
    segment_size: u64,
}

impl SegmentPool {
    /// Creates `segment_count` fresh slot files under `nv_root`, zeroed and
    /// persisted so the NVM allocation is finalized before first use.
    pub fn create(nv_root: &Path, segment_count: u64, segment_size: u64) -> Result<Self> {
        let pool = Self::build(nv_root, segment_count, segment_size, true)?;
        for slot in pool.slots.iter() {
            slot.zero_and_persist()?;
        }
        Ok(pool)
    }

    /// Reopens existing slot files; slot bindings are reconstructed by the
    /// caller from the control block and metadata store.
    pub fn open(nv_root: &Path, segment_count: u64, segment_size: u64) -> Result<Self> {
        Self::build(nv_root, segment_count, segment_size, false)
    }

    fn build(nv_root: &Path, segment_count: u64, segment_size: u64, create: bool) -> Result<Self> {
        let mut slots = Vec::with_capacity(segment_count as usize);
        for j in 0..segment_count {
            let path = nv_root.join(format!("{}{}", NV_SEGMENT_FILE_PREFIX, j));
            let map = SegmentSlot::open_file(&path, segment_size, create)?;
            slots.push(SegmentSlot::new(map, segment_size as usize));
        }
        Ok(Self {
            slots: slots.into_boxed_slice(),
            segment_size,
        })
    }

    pub fn segment_count(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn slot_index(&self, dsid: u64) -> usize {
        debug_assert!(dsid != 0);
        ((dsid - 1) % self.segment_count()) as usize
    }

    pub fn slot(&self, index: usize) -> &SegmentSlot {
        &self.slots[index]
    }

    pub fn slot_for_dsid(&self, dsid: u64) -> &SegmentSlot {
        &self.slots[self.slot_index(dsid)]
    }

    pub fn slots(&self) -> impl Iterator<Item = &SegmentSlot> {
        self.slots.iter()
    }
}
