//! # Writer Buffers
//!
//! Each writer context owns a circular byte buffer and a small ring of
//! *epoch frames*. The writer thread appends log bytes tagged with an epoch;
//! the flusher concurrently drains published bytes into the active NVM
//! segment. The two sides never share a lock — the frame fields are the
//! entire protocol.
//!
//! ## Epoch frames
//!
//! ```text
//! frames: [ e=7 flushed ][ e=8 head<tail ][ e=9 tail only ][ empty ] ...
//!              ▲ oldest_frame                 ▲ active (writer side)
//! ```
//!
//! A frame is `{log_epoch, head_offset, tail_offset}`. The writer advances
//! `tail_offset`; the flusher advances `head_offset` as it copies, and
//! retires a fully-drained frame at a stable-epoch boundary by zeroing it
//! and release-publishing `oldest_frame`. Frame epochs are strictly
//! increasing along the ring modulo wrap; `head == tail` iff the frame is
//! fully flushed. A writer may post epochs at most two ahead of the durable
//! horizon — violations surface here as frame-ring exhaustion.
//!
//! ## Doubled offset space
//!
//! Offsets are kept in `[0, 2·buffer_size)` and only reduced modulo
//! `buffer_size` when touching bytes. Distances between two offsets are
//! then unambiguous without a separate full/empty flag; the concrete wrap
//! happens at a single boundary. Do not replace this with plain modular
//! arithmetic — it loses the direction of the gap.
//!
//! ## Publication order
//!
//! When the writer promotes a frame to a new epoch it stores
//! `head = tail = position` (release) and only then `log_epoch` (release).
//! The flusher reads `log_epoch` with acquire before trusting `head`/`tail`,
//! so a frame is never observed half-initialized. Byte writes into the
//! buffer happen-before the release store of `tail_offset` that publishes
//! them.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use eyre::{bail, ensure, Result};

use crate::config::WRITER_FRAME_COUNT;
use crate::epoch::Epoch;
use crate::error::WalError;

/// One slot in the writer's epoch ring.
pub struct EpochFrame {
    log_epoch: AtomicU64,
    head_offset: AtomicU64,
    tail_offset: AtomicU64,
}

impl EpochFrame {
    fn new() -> Self {
        Self {
            log_epoch: AtomicU64::new(0),
            head_offset: AtomicU64::new(0),
            tail_offset: AtomicU64::new(0),
        }
    }

    pub fn epoch(&self) -> Epoch {
        Epoch::new(self.log_epoch.load(Ordering::Acquire))
    }

    pub fn head(&self) -> u64 {
        self.head_offset.load(Ordering::Acquire)
    }

    pub fn tail(&self) -> u64 {
        self.tail_offset.load(Ordering::Acquire)
    }
}

pub struct WriterBuffer {
    buf: Box<[UnsafeCell<u8>]>,
    size: u64,
    frames: [EpochFrame; WRITER_FRAME_COUNT],
    /// Ring index of the oldest live frame; flusher-published (release),
    /// writer-read (acquire).
    oldest_frame: AtomicUsize,
    /// Ring index of the frame the writer is filling. Writer-owned.
    active_frame: AtomicUsize,
    /// The writer's byte position in doubled offset space. Writer-owned;
    /// also read by `has_enough_space`.
    write_pos: AtomicU64,
}

impl WriterBuffer {
    pub fn new(buffer_size: u64) -> Self {
        let buf = (0..buffer_size as usize)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf,
            size: buffer_size,
            frames: std::array::from_fn(|_| EpochFrame::new()),
            oldest_frame: AtomicUsize::new(0),
            active_frame: AtomicUsize::new(0),
            write_pos: AtomicU64::new(0),
        }
    }

    pub fn buffer_size(&self) -> u64 {
        self.size
    }

    fn doubled(&self) -> u64 {
        self.size * 2
    }

    /// Forward distance from `from` to `to` in doubled offset space.
    pub fn distance(&self, from: u64, to: u64) -> u64 {
        (to + self.doubled() - from) % self.doubled()
    }

    fn advance(&self, pos: u64, len: u64) -> u64 {
        (pos + len) % self.doubled()
    }

    /// True iff in-flight bytes leave at least half the buffer free, which
    /// is the amount one subsequent `on_wal_write` may consume.
    pub fn has_enough_space(&self) -> bool {
        let oldest = self.oldest_frame.load(Ordering::Acquire);
        let frame = &self.frames[oldest];
        if !frame.epoch().is_valid() {
            // Ring is empty; nothing in flight.
            return true;
        }
        let head = frame.head();
        let pos = self.write_pos.load(Ordering::Acquire);
        self.distance(head, pos) <= self.size / 2
    }

    /// Appends `bytes` under `epoch`. Single calling thread per writer.
    ///
    /// A new epoch must be strictly after the active frame's epoch. The
    /// ring rejects a fourth in-flight epoch with a contract violation,
    /// which is how "no epochs past durable + 2" is enforced in practice.
    pub fn on_wal_write(&self, bytes: &[u8], epoch: Epoch) -> Result<()> {
        ensure!(
            epoch.is_valid(),
            WalError::InvalidArgument("cannot write under the invalid epoch".into())
        );
        ensure!(
            bytes.len() as u64 <= self.size / 2,
            WalError::InvalidArgument(format!(
                "write of {} bytes exceeds half the writer buffer ({})",
                bytes.len(),
                self.size / 2
            ))
        );

        let active = self.active_frame.load(Ordering::Relaxed);
        let cur = self.frames[active].epoch();

        let frame_idx = if cur == epoch {
            active
        } else if cur.is_valid() {
            if !epoch.is_after(cur) {
                bail!(WalError::ContractViolation(format!(
                    "epoch {} does not advance past active epoch {}",
                    epoch, cur
                )));
            }
            let next = (active + 1) % WRITER_FRAME_COUNT;
            let oldest = self.oldest_frame.load(Ordering::Acquire);
            if next == oldest && self.frames[oldest].epoch().is_valid() {
                bail!(WalError::ContractViolation(format!(
                    "epoch frame ring exhausted posting epoch {}; writer is \
                     past the durable horizon contract",
                    epoch
                )));
            }
            self.open_frame(next, epoch);
            self.active_frame.store(next, Ordering::Release);
            next
        } else {
            // Active frame was retired (or never used): the ring is empty
            // and the oldest index is where the next epoch belongs.
            let slot = self.oldest_frame.load(Ordering::Acquire);
            self.open_frame(slot, epoch);
            self.active_frame.store(slot, Ordering::Release);
            slot
        };

        if !bytes.is_empty() {
            let pos = self.write_pos.load(Ordering::Relaxed);
            self.copy_in(pos, bytes);
            let new_pos = self.advance(pos, bytes.len() as u64);
            self.write_pos.store(new_pos, Ordering::Release);
            self.frames[frame_idx]
                .tail_offset
                .store(new_pos, Ordering::Release);
        }
        Ok(())
    }

    /// Initializes a frame at the writer's position. Publication order:
    /// head, tail, then epoch, all release stores; the flusher acquires
    /// the epoch first and therefore sees a fully-formed frame.
    fn open_frame(&self, idx: usize, epoch: Epoch) {
        let pos = self.write_pos.load(Ordering::Relaxed);
        let frame = &self.frames[idx];
        frame.head_offset.store(pos, Ordering::Release);
        frame.tail_offset.store(pos, Ordering::Release);
        frame.log_epoch.store(epoch.raw(), Ordering::Release);
    }

    fn copy_in(&self, pos: u64, bytes: &[u8]) {
        let idx = (pos % self.size) as usize;
        let first = bytes.len().min(self.size as usize - idx);
        let base = self.buf.as_ptr() as *mut u8;
        // SAFETY: the writer is the single mutator of buffer bytes, and the
        // target range is free space (the caller checked available space
        // before writing). The bytes are published to the flusher only by
        // the subsequent release store of tail_offset.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(idx), first);
            if first < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    base,
                    bytes.len() - first,
                );
            }
        }
    }

    // Flusher-side accessors.

    pub fn frame(&self, idx: usize) -> &EpochFrame {
        &self.frames[idx]
    }

    pub fn oldest_frame(&self) -> usize {
        self.oldest_frame.load(Ordering::Acquire)
    }

    /// Publishes flusher progress within a frame.
    pub fn advance_frame_head(&self, idx: usize, new_head: u64) {
        self.frames[idx].head_offset.store(new_head, Ordering::Release);
    }

    /// Retires a fully-drained frame: zeroes the slot, then release-
    /// publishes the new oldest index. Flusher only, at a stable boundary.
    pub fn retire_frame(&self, idx: usize) {
        let frame = &self.frames[idx];
        frame.log_epoch.store(0, Ordering::Release);
        frame.head_offset.store(0, Ordering::Release);
        frame.tail_offset.store(0, Ordering::Release);
        self.oldest_frame
            .store((idx + 1) % WRITER_FRAME_COUNT, Ordering::Release);
    }

    /// Pointer to the byte at `pos`, and how many bytes are readable from
    /// it without wrapping.
    ///
    /// # Safety
    /// Caller must be the flusher and must only read ranges between a
    /// frame's acquired `head` and `tail`.
    pub unsafe fn read_chunk(&self, pos: u64, max_len: u64) -> (*const u8, u64) {
        let idx = (pos % self.size) as usize;
        let contiguous = (self.size as usize - idx) as u64;
        let base = self.buf.as_ptr() as *const u8;
        (base.add(idx), max_len.min(contiguous))
    }
}

// SAFETY: buffer bytes are raced only between the single writer thread and
// the flusher, and every byte range handed to the flusher was published by
// a release store of tail_offset that the flusher acquired; frame fields
// are atomics.
unsafe impl Send for WriterBuffer {}
unsafe impl Sync for WriterBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buf: &WriterBuffer, idx: usize, stable: bool) -> Vec<u8> {
        // Minimal flusher stand-in: drains one frame completely.
        let frame = buf.frame(idx);
        let mut head = frame.head();
        let tail = frame.tail();
        let mut out = Vec::new();
        while head != tail {
            let dist = buf.distance(head, tail);
            // SAFETY: single-threaded test standing in for the flusher.
            let (ptr, n) = unsafe { buf.read_chunk(head, dist) };
            out.extend_from_slice(unsafe { std::slice::from_raw_parts(ptr, n as usize) });
            head = (head + n) % (buf.buffer_size() * 2);
        }
        if stable {
            buf.retire_frame(idx);
        } else {
            buf.advance_frame_head(idx, head);
        }
        out
    }

    #[test]
    fn single_epoch_roundtrip() {
        let buf = WriterBuffer::new(4096);
        assert!(buf.has_enough_space());
        buf.on_wal_write(b"hello wal", Epoch::new(1)).unwrap();

        let idx = buf.oldest_frame();
        assert_eq!(buf.frame(idx).epoch(), Epoch::new(1));
        assert_eq!(drain(&buf, idx, true), b"hello wal");
    }

    #[test]
    fn wrapping_write_is_reassembled() {
        let buf = WriterBuffer::new(1024);
        // Fill and drain to move the position near the end of the buffer.
        buf.on_wal_write(&[0x11u8; 512], Epoch::new(1)).unwrap();
        drain(&buf, 0, true);
        buf.on_wal_write(&[0x22u8; 300], Epoch::new(2)).unwrap();
        drain(&buf, buf.oldest_frame(), true);

        // Position is at byte 812; this write wraps around the physical end.
        let payload: Vec<u8> = (0..400u32).map(|i| i as u8).collect();
        buf.on_wal_write(&payload, Epoch::new(3)).unwrap();
        assert_eq!(drain(&buf, buf.oldest_frame(), true), payload);
    }

    #[test]
    fn epochs_must_advance() {
        let buf = WriterBuffer::new(1024);
        buf.on_wal_write(b"a", Epoch::new(5)).unwrap();
        let err = buf.on_wal_write(b"b", Epoch::new(4)).unwrap_err();
        assert!(err.downcast_ref::<WalError>().is_some());
    }

    #[test]
    fn frame_ring_exhaustion_is_contract_violation() {
        let buf = WriterBuffer::new(4096);
        for e in 1..=WRITER_FRAME_COUNT as u64 {
            buf.on_wal_write(b"x", Epoch::new(e)).unwrap();
        }
        let err = buf
            .on_wal_write(b"x", Epoch::new(WRITER_FRAME_COUNT as u64 + 1))
            .unwrap_err();
        let kind = err.downcast_ref::<WalError>().unwrap();
        assert!(matches!(kind, WalError::ContractViolation(_)));
    }

    #[test]
    fn space_check_tracks_oldest_unflushed_frame() {
        let buf = WriterBuffer::new(1024);
        // Exactly half in flight is still within the guarantee.
        buf.on_wal_write(&[0u8; 512], Epoch::new(1)).unwrap();
        assert!(buf.has_enough_space());
        // One byte past half is not.
        buf.on_wal_write(&[0u8; 1], Epoch::new(1)).unwrap();
        assert!(!buf.has_enough_space());
        drain(&buf, 0, true);
        assert!(buf.has_enough_space());
    }

    #[test]
    fn retired_ring_accepts_new_epochs() {
        let buf = WriterBuffer::new(1024);
        for e in 1..=20u64 {
            buf.on_wal_write(&[e as u8; 100], Epoch::new(e)).unwrap();
            let idx = buf.oldest_frame();
            assert_eq!(drain(&buf, idx, true), [e as u8; 100]);
        }
    }

    #[test]
    fn partial_drain_keeps_frame_live() {
        let buf = WriterBuffer::new(1024);
        buf.on_wal_write(&[7u8; 100], Epoch::new(1)).unwrap();
        let out = drain(&buf, 0, false);
        assert_eq!(out.len(), 100);
        // Frame not retired: same epoch can keep appending.
        assert_eq!(buf.frame(0).epoch(), Epoch::new(1));
        buf.on_wal_write(&[8u8; 50], Epoch::new(1)).unwrap();
        assert_eq!(buf.distance(buf.frame(0).head(), buf.frame(0).tail()), 50);
    }
}
