//! # Metadata Write Buffers
//!
//! Exactly one NVM-backed page buffer per page file. The buffer *is* the
//! tail of the file: records for the newest epochs are persisted into it,
//! and only when the next page is needed does the whole page get appended
//! to the file (writeback) and the buffer recycled.
//!
//! ## Allocation protocol (single writer)
//!
//! Given a requested page number:
//! - buffer free → bind it, mark dirty;
//! - buffer already holds the page → mark dirty;
//! - buffer holds the previous page, clean → atomically re-anchor to the
//!   new page (the linearization point for optimistic readers), mark dirty;
//! - buffer holds the previous page, dirty → `BufferFull`; the caller must
//!   write back, durably advance the paged horizon, and retry;
//! - anything else is a protocol bug upstream.
//!
//! ## Optimistic readers
//!
//! The monotonically-increasing `page_no` anchor is the entire reader
//! protocol: acquire-load the anchor, plain-copy the 64-byte record,
//! acquire-load the anchor again. Both loads returning the target page
//! validate the copy — records are failure-atomic units, so no torn read
//! is observable. A mismatch sends the reader to the page file instead.
//!
//! The destructive [`BufferManager::read_page`] (rollback path) discards
//! buffer contents and cannot run concurrently with optimistic readers.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{bail, Result, WrapErr};
use memmap2::MmapRaw;
use tracing::{debug, info};

use crate::config::{InitMode, EPOCH_METADATA_SIZE, MDS_BUFFER_FILE_PREFIX, MDS_PAGEFILE_COUNT};
use crate::error::WalError;
use crate::mds::io::MdsIo;
use crate::mds::EpochMetadata;
use crate::pmem;

/// Page number 0 marks a free buffer; real pages are 1-based.
pub const INVALID_PAGE: u64 = 0;

pub struct MdsBuffer {
    map: MmapRaw,
    page_size: usize,
    /// The optimistic readers' anchor. Grows monotonically while the
    /// instance runs; re-derived from the control block at recovery.
    page_no: AtomicU64,
    dirty: AtomicBool,
}

impl MdsBuffer {
    pub fn page_no(&self) -> u64 {
        self.page_no.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Persists one record into the buffered page. Single writer.
    pub fn write_record(&self, record_index: u64, meta: &EpochMetadata) -> Result<()> {
        let offset = record_index as usize * EPOCH_METADATA_SIZE;
        debug_assert!(offset + EPOCH_METADATA_SIZE <= self.page_size);
        // SAFETY: the metadata writer is single-threaded and this is the
        // only mutator of buffer bytes outside the rollback path; readers
        // validate against the page_no anchor, and a record is only read
        // after the durable epoch covering it was published.
        unsafe {
            std::ptr::copy_nonoverlapping(
                meta as *const EpochMetadata as *const u8,
                self.map.as_mut_ptr().add(offset),
                EPOCH_METADATA_SIZE,
            );
        }
        pmem::persist_raw(&self.map, offset, EPOCH_METADATA_SIZE)
    }

    /// Optimistically copies one record out if the buffer still anchors
    /// `page_no` before and after the copy.
    pub fn optimistic_read(&self, page_no: u64, record_index: u64) -> Option<EpochMetadata> {
        if page_no == INVALID_PAGE || self.page_no() != page_no {
            return None;
        }
        let offset = record_index as usize * EPOCH_METADATA_SIZE;
        debug_assert!(offset + EPOCH_METADATA_SIZE <= self.page_size);
        let mut record = EpochMetadata::zeroed();
        // SAFETY: the range is within the mapping; a concurrent recycle is
        // detected by the anchor re-check below, and the 64-byte record is
        // written with a single failure-atomic persist, so any validated
        // copy is a value some version of the page held.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.as_ptr().add(offset),
                &mut record as *mut EpochMetadata as *mut u8,
                EPOCH_METADATA_SIZE,
            );
        }
        if self.page_no() == page_no {
            Some(record)
        } else {
            None
        }
    }

    /// The whole buffered page.
    ///
    /// # Safety
    /// Caller must be the single metadata writer; concurrent readers only
    /// ever copy records out, which is safe alongside this shared view.
    unsafe fn page_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.map.as_ptr(), self.page_size)
    }
}

// SAFETY: buffer bytes are written by the single metadata writer and read
// under the anchor-validation protocol; the rest is atomics.
unsafe impl Send for MdsBuffer {}
unsafe impl Sync for MdsBuffer {}

pub struct BufferManager {
    buffers: Vec<MdsBuffer>,
}

fn buffer_path(nv_root: &Path, buffer_id: u32) -> PathBuf {
    nv_root.join(format!("{}{}", MDS_BUFFER_FILE_PREFIX, buffer_id))
}

impl BufferManager {
    /// Opens or creates the NVM buffer files, one per page file. Returns
    /// the manager and whether it restarted from existing buffers.
    pub fn init(nv_root: &Path, page_size: u64, mode: InitMode) -> Result<(Self, bool)> {
        let num_existing = (0..MDS_PAGEFILE_COUNT)
            .filter(|&i| buffer_path(nv_root, i).exists())
            .count() as u32;

        let restart = match (mode, num_existing) {
            (InitMode::Restart, n) if n == MDS_PAGEFILE_COUNT => true,
            (InitMode::CreateIfNotExists, n) if n == MDS_PAGEFILE_COUNT => true,
            (InitMode::CreateIfNotExists | InitMode::CreateTruncate, 0) => false,
            _ => bail!(WalError::Corrupt(format!(
                "found {} of {} metadata buffer files under {:?} in {:?} mode",
                num_existing, MDS_PAGEFILE_COUNT, nv_root, mode
            ))),
        };

        let mut buffers = Vec::with_capacity(MDS_PAGEFILE_COUNT as usize);
        for i in 0..MDS_PAGEFILE_COUNT {
            let path = buffer_path(nv_root, i);
            let file = if restart {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .wrap_err_with(|| format!("failed to open metadata buffer {:?}", path))?
            } else {
                info!(path = %path.display(), "creating metadata buffer file");
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .wrap_err_with(|| format!("failed to create metadata buffer {:?}", path))?;
                file.set_len(page_size)
                    .wrap_err_with(|| format!("failed to size metadata buffer {:?}", path))?;
                file
            };

            let len = file
                .metadata()
                .wrap_err("failed to stat metadata buffer file")?
                .len();
            if len != page_size {
                bail!(WalError::Corrupt(format!(
                    "metadata buffer {:?} has size {}, expected {}",
                    path, len, page_size
                )));
            }

            let map = MmapRaw::map_raw(&file)
                .wrap_err_with(|| format!("failed to map metadata buffer {:?}", path))?;
            let buffer = MdsBuffer {
                map,
                page_size: page_size as usize,
                page_no: AtomicU64::new(INVALID_PAGE),
                dirty: AtomicBool::new(false),
            };
            if !restart {
                // Persist the zero fill to finalize the NVM allocation.
                // SAFETY: freshly created file, not yet shared.
                unsafe {
                    std::ptr::write_bytes(buffer.map.as_mut_ptr(), 0, buffer.page_size);
                }
                pmem::persist_raw_all(&buffer.map)?;
            }
            buffers.push(buffer);
        }

        Ok((Self { buffers }, restart))
    }

    pub fn buffer(&self, file_no: u32) -> &MdsBuffer {
        &self.buffers[file_no as usize]
    }

    /// Hands out the buffer of `file_no` bound to `page_no`, per the
    /// allocation protocol. `BufferFull` tells the caller to write back
    /// and retry.
    pub fn alloc_page(&self, file_no: u32, page_no: u64) -> Result<&MdsBuffer, WalError> {
        if page_no == INVALID_PAGE {
            return Err(WalError::InvalidArgument(
                "cannot allocate the invalid page".into(),
            ));
        }
        let buffer = self.buffer(file_no);
        let anchored = buffer.page_no();

        if anchored == INVALID_PAGE {
            buffer.page_no.store(page_no, Ordering::Release);
            buffer.dirty.store(true, Ordering::Release);
            return Ok(buffer);
        }
        if anchored == page_no {
            buffer.dirty.store(true, Ordering::Release);
            return Ok(buffer);
        }
        if page_no == anchored + 1 {
            if buffer.is_dirty() {
                return Err(WalError::BufferFull);
            }
            // Linearization point: optimistic readers of the old page now
            // fall through to the page file, where writeback already put it.
            buffer.page_no.store(page_no, Ordering::Release);
            buffer.dirty.store(true, Ordering::Release);
            return Ok(buffer);
        }
        Err(WalError::ContractViolation(format!(
            "metadata buffer for file {} anchors page {} but page {} was requested",
            file_no, anchored, page_no
        )))
    }

    /// Appends every dirty buffered page to its file (fsynced) and marks
    /// the buffers clean.
    pub fn writeback(&self, io: &MdsIo) -> Result<()> {
        for (file_no, buffer) in self.buffers.iter().enumerate() {
            if !buffer.is_dirty() {
                continue;
            }
            debug!(file_no, page_no = buffer.page_no(), "writing back metadata page");
            // SAFETY: single metadata writer; see page_slice.
            io.append_page(file_no as u32, unsafe { buffer.page_slice() })?;
            buffer.dirty.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Destructively loads `page_no` from the page file into the buffer.
    /// Rollback only; not safe against concurrent optimistic readers.
    pub fn read_page(&self, io: &MdsIo, file_no: u32, page_no: u64) -> Result<&MdsBuffer> {
        let buffer = self.buffer(file_no);
        let mut page = vec![0u8; buffer.page_size];
        io.pread(file_no, &mut page, (page_no - 1) * buffer.page_size as u64)?;
        // SAFETY: rollback runs with the write path quiesced and no
        // concurrent optimistic readers, per the documented contract.
        unsafe {
            std::ptr::copy_nonoverlapping(page.as_ptr(), buffer.map.as_mut_ptr(), page.len());
        }
        pmem::persist_raw_all(&buffer.map)?;
        buffer.page_no.store(page_no, Ordering::Release);
        buffer.dirty.store(true, Ordering::Release);
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(page_size: u64) -> (tempfile::TempDir, BufferManager) {
        let dir = tempdir().unwrap();
        let (mgr, restarted) =
            BufferManager::init(dir.path(), page_size, InitMode::CreateIfNotExists).unwrap();
        assert!(!restarted);
        (dir, mgr)
    }

    fn meta(epoch: u64) -> EpochMetadata {
        EpochMetadata::new(crate::epoch::Epoch::new(epoch), 1, 0, 1, 64, 0, 0)
    }

    #[test]
    fn alloc_binds_free_buffer() {
        let (_dir, mgr) = manager(512);
        let buffer = mgr.alloc_page(0, 1).unwrap();
        assert_eq!(buffer.page_no(), 1);
        assert!(buffer.is_dirty());
    }

    #[test]
    fn alloc_same_page_is_idempotent() {
        let (_dir, mgr) = manager(512);
        mgr.alloc_page(0, 1).unwrap();
        let buffer = mgr.alloc_page(0, 1).unwrap();
        assert_eq!(buffer.page_no(), 1);
    }

    #[test]
    fn dirty_successor_is_buffer_full_until_writeback() {
        let dir = tempdir().unwrap();
        let (mgr, _) = BufferManager::init(dir.path(), 512, InitMode::CreateIfNotExists).unwrap();
        let (io, _) = MdsIo::init(dir.path(), 512, InitMode::CreateIfNotExists).unwrap();

        mgr.alloc_page(0, 1).unwrap();
        assert!(matches!(mgr.alloc_page(0, 2), Err(WalError::BufferFull)));

        mgr.writeback(&io).unwrap();
        assert_eq!(io.num_pages(0).unwrap(), 1);
        let buffer = mgr.alloc_page(0, 2).unwrap();
        assert_eq!(buffer.page_no(), 2);
    }

    #[test]
    fn page_jump_is_a_protocol_bug() {
        let (_dir, mgr) = manager(512);
        mgr.alloc_page(0, 1).unwrap();
        assert!(matches!(
            mgr.alloc_page(0, 5),
            Err(WalError::ContractViolation(_))
        ));
    }

    #[test]
    fn optimistic_read_validates_anchor() {
        let (_dir, mgr) = manager(512);
        let buffer = mgr.alloc_page(0, 3).unwrap();
        buffer.write_record(2, &meta(42)).unwrap();

        let read = buffer.optimistic_read(3, 2).unwrap();
        assert_eq!(read.epoch_id, 42);
        // Wrong page: the reader must fall back to the file.
        assert!(buffer.optimistic_read(2, 2).is_none());
        assert!(buffer.optimistic_read(INVALID_PAGE, 2).is_none());
    }

    #[test]
    fn destructive_read_page_restores_contents() {
        let dir = tempdir().unwrap();
        let (mgr, _) = BufferManager::init(dir.path(), 512, InitMode::CreateIfNotExists).unwrap();
        let (io, _) = MdsIo::init(dir.path(), 512, InitMode::CreateIfNotExists).unwrap();

        let buffer = mgr.alloc_page(0, 1).unwrap();
        buffer.write_record(0, &meta(7)).unwrap();
        mgr.writeback(&io).unwrap();
        mgr.alloc_page(0, 2).unwrap();
        let buffer = mgr.buffer(0);
        buffer.write_record(0, &meta(99)).unwrap();

        let buffer = mgr.read_page(&io, 0, 1).unwrap();
        assert_eq!(buffer.page_no(), 1);
        assert_eq!(buffer.optimistic_read(1, 0).unwrap().epoch_id, 7);
    }
}
