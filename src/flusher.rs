//! # Flusher
//!
//! The single thread that turns writer-buffer bytes into durable log state.
//! Each pass over the writers targets exactly one epoch — the successor of
//! the durable horizon — and copies any published bytes for it into the
//! active NVM segment. When the application has declared that epoch stable,
//! the pass ends by *concluding* it: persisting the epoch's byte ranges,
//! recording its extent in the metadata store, durably bumping the control
//! block, and only then publishing the new durable horizon to readers.
//!
//! ## Segment rotation
//!
//! A full segment is handed to the fsyncer (`fsync_requested`) and the
//! flusher claims the next slot in the ring. Claiming waits for the slot's
//! previous occupant to be safely on disk, takes the slot exclusively
//! against readers (pins 0 → −1), rebinds it to the new dsid, and
//! republishes it. A sticky fsync error on the slot fails the rotation and
//! takes the flusher down; nothing downstream of a failed fsync can be
//! trusted.
//!
//! ## Ordering
//!
//! The memcpy into a segment happens after the acquire fence that pairs
//! with the writer's release store of `tail_offset`; the control block's
//! `durable_epoch` is persisted before the in-memory horizon is published.
//! Readers that observe the published horizon therefore observe persisted
//! bytes.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use tracing::debug;

use crate::config::WRITER_FRAME_COUNT;
use crate::epoch::Epoch;
use crate::error::WalError;
use crate::mds::EpochMetadata;
use crate::thread::ThreadControl;
use crate::wal::WalShared;
use crate::writer::WriterBuffer;

pub(crate) struct Flusher {
    shared: Arc<WalShared>,
    /// The dsid being filled.
    cur_dsid: u64,
    /// Where the in-progress epoch's bytes begin.
    epoch_start_dsid: u64,
    epoch_start_offset: u64,
}

impl Flusher {
    pub(crate) fn new(shared: Arc<WalShared>) -> Self {
        let start = shared.flusher_start_dsid;
        Self {
            shared,
            cur_dsid: start,
            epoch_start_dsid: start,
            epoch_start_offset: 0,
        }
    }

    pub(crate) fn run(mut self, control: &ThreadControl) -> Result<()> {
        self.claim_slot(self.cur_dsid, control)?;
        while !control.stop_requested() {
            self.pass(control)?;
            std::thread::yield_now();
        }
        Ok(())
    }

    fn pass(&mut self, control: &ThreadControl) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let durable = shared.durable();
        let target = durable.next();
        let stable = shared.stable() == target;

        for writer in shared.writers.iter() {
            self.process_writer(writer, target, stable, control)?;
        }

        if stable && shared.durable() != target {
            self.conclude_stable_epoch(target)?;
        }
        Ok(())
    }

    /// Locates the writer's frame for `target` and drains it into the
    /// active segment. Frames for later epochs are left for future passes.
    fn process_writer(
        &mut self,
        writer: &WriterBuffer,
        target: Epoch,
        stable: bool,
        control: &ThreadControl,
    ) -> Result<()> {
        let oldest = writer.oldest_frame();
        let mut found = None;
        for i in 0..WRITER_FRAME_COUNT {
            let idx = (oldest + i) % WRITER_FRAME_COUNT;
            let epoch = writer.frame(idx).epoch();
            if epoch.is_valid() && epoch.is_equal_or_after(target) {
                found = Some((idx, epoch));
                break;
            }
        }
        let (idx, epoch) = match found {
            Some(f) => f,
            None => return Ok(()),
        };
        if epoch != target {
            // The writer skipped this epoch entirely.
            return Ok(());
        }

        let frame = writer.frame(idx);
        loop {
            if control.stop_requested() {
                bail!(WalError::Cancelled);
            }
            let head = frame.head();
            let tail = frame.tail();
            let dist = writer.distance(head, tail);
            if dist == 0 {
                if stable {
                    writer.retire_frame(idx);
                }
                return Ok(());
            }

            let slot = self.shared.segments.slot_for_dsid(self.cur_dsid);
            let written = slot.written_bytes();
            let seg_remaining = self.shared.config.segment_size - written;
            if seg_remaining == 0 {
                self.rotate(control)?;
                continue;
            }
            let n = dist.min(seg_remaining);

            // Pairs with the writer's release store of tail_offset: the
            // bytes behind the tail we just read must not be reordered
            // past this point.
            fence(Ordering::Acquire);
            let mut copied = 0u64;
            let mut pos = head;
            while copied < n {
                // SAFETY: flusher-only read of [head, tail) bytes the
                // writer published; the destination range is owned by the
                // flusher until publish_written_bytes.
                unsafe {
                    let (ptr, chunk) = writer.read_chunk(pos, n - copied);
                    slot.copy_in((written + copied) as usize, ptr, chunk as usize);
                    pos = (pos + chunk) % (writer.buffer_size() * 2);
                    copied += chunk;
                }
            }
            slot.publish_written_bytes(written + n);

            let new_head = (head + n) % (writer.buffer_size() * 2);
            if new_head == tail && stable {
                writer.retire_frame(idx);
            } else {
                writer.advance_frame_head(idx, new_head);
            }
            if written + n == self.shared.config.segment_size {
                self.rotate(control)?;
            }
            if new_head == tail {
                return Ok(());
            }
        }
    }

    /// Publishes the full segment to the fsyncer and claims the next slot.
    fn rotate(&mut self, control: &ThreadControl) -> Result<()> {
        let slot = self.shared.segments.slot_for_dsid(self.cur_dsid);
        debug_assert_eq!(slot.written_bytes(), self.shared.config.segment_size);
        slot.request_fsync();
        debug!(dsid = self.cur_dsid, "segment full, rotating");

        let next = self.cur_dsid + 1;
        self.claim_slot(next, control)?;
        self.cur_dsid = next;
        Ok(())
    }

    /// Claims the slot `(dsid - 1) % N` for `dsid`: waits until its
    /// previous occupant is on disk, excludes readers, and rebinds it.
    fn claim_slot(&self, dsid: u64, control: &ThreadControl) -> Result<()> {
        let slot = self.shared.segments.slot_for_dsid(dsid);
        loop {
            let errno = slot.fsync_error();
            if errno != 0 {
                bail!(WalError::io(
                    "segment fsync (observed at rotation)",
                    std::io::Error::from_raw_os_error(errno),
                ));
            }
            if slot.dsid() == 0 || slot.fsync_completed() {
                break;
            }
            if control.stop_requested() {
                bail!(WalError::Cancelled);
            }
            std::thread::yield_now();
        }
        while !slot.try_begin_recycle() {
            if control.stop_requested() {
                bail!(WalError::Cancelled);
            }
            std::thread::yield_now();
        }
        slot.reset_for(dsid);
        Ok(())
    }

    /// The stable epoch is fully drained: persist it, record it, publish it.
    fn conclude_stable_epoch(&mut self, target: Epoch) -> Result<()> {
        let shared = &self.shared;
        let to_off = shared.segments.slot_for_dsid(self.cur_dsid).written_bytes();
        let meta = EpochMetadata::new(
            target,
            self.epoch_start_dsid,
            self.epoch_start_offset,
            self.cur_dsid,
            to_off,
            0,
            0,
        );

        // One persist per slot still resident on NVM, batching everything
        // the epoch wrote there. Slots already recycled necessarily carry
        // dsids whose bytes are fsynced to disk.
        let last_synced = shared.control.last_synced_dsid();
        for dsid in self.epoch_start_dsid..=self.cur_dsid {
            if dsid <= last_synced {
                continue;
            }
            let slot = shared.segments.slot_for_dsid(dsid);
            if slot.dsid() != dsid {
                continue;
            }
            let lo = if dsid == self.epoch_start_dsid {
                self.epoch_start_offset
            } else {
                0
            };
            let hi = if dsid == self.cur_dsid {
                to_off
            } else {
                shared.config.segment_size
            };
            slot.persist_range(lo as usize, (hi - lo) as usize)?;
        }

        // Record the extent; this durably advances the control block's
        // durable epoch. Only after that may readers learn of the epoch.
        shared.mds.write_epoch(&meta)?;
        shared.publish_durable(target);

        debug!(
            epoch = target.raw(),
            from_dsid = self.epoch_start_dsid,
            to_dsid = self.cur_dsid,
            to_off,
            "epoch concluded"
        );
        self.epoch_start_dsid = self.cur_dsid;
        self.epoch_start_offset = to_off;
        Ok(())
    }
}
