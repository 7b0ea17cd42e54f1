//! # Fsyncer
//!
//! The single thread that copies sealed NVM segments out to block storage.
//! It walks dsids in order — `last_synced_dsid + 1` is always the only
//! candidate — because the on-disk frontier is a single monotone watermark:
//! `dsid ≤ last_synced_dsid` must imply the segment file exists, is exactly
//! `segment_size` bytes, and is fsynced along with its parent directory.
//!
//! On success the slot is marked `fsync_completed` (releasing it for
//! recycling) and then the frontier is durably advanced. On failure the
//! error code is stored sticky on the slot; the flusher observes it at the
//! next rotation over that slot and shuts the instance down.
//!
//! The write loop polls the thread-state byte so a shutdown abandons the
//! current segment copy at the next write boundary instead of stalling
//! `uninit` behind a large write.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, Result};
use tracing::{debug, warn};

use crate::config::DISK_SEGMENT_FILE_PREFIX;
use crate::error::WalError;
use crate::thread::ThreadControl;
use crate::wal::WalShared;

pub(crate) struct Fsyncer {
    shared: Arc<WalShared>,
}

pub(crate) fn disk_segment_path(disk_root: &Path, dsid: u64) -> PathBuf {
    disk_root.join(format!("{}{}", DISK_SEGMENT_FILE_PREFIX, dsid))
}

/// Opens a fresh disk segment file, with `O_DIRECT` on a best-effort basis:
/// filesystems that reject it get a plain buffered file instead.
fn open_segment_file(path: &Path) -> io::Result<File> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::io::FromRawFd;

        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let flags = libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC | libc::O_DIRECT;
        // SAFETY: cpath is a valid NUL-terminated path; the returned fd is
        // immediately owned by File.
        let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o600 as libc::c_uint) };
        if fd >= 0 {
            return Ok(unsafe { File::from_raw_fd(fd) });
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(err);
        }
        // EINVAL: the filesystem does not support O_DIRECT.
    }
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Writes one full segment image to `disk_root/nvwal_ds<dsid>` and fsyncs
/// the file and its parent directory. Shared between the fsyncer loop and
/// the restart path that drains leftover NVM segments.
pub(crate) fn write_segment_file(
    disk_root: &Path,
    dsid: u64,
    bytes: &[u8],
    should_cancel: &dyn Fn() -> bool,
) -> io::Result<()> {
    let path = disk_segment_path(disk_root, dsid);
    let file = open_segment_file(&path)?;

    let mut written = 0;
    while written < bytes.len() {
        if should_cancel() {
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }
        let n = (&file).write(&bytes[written..])?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        written += n;
    }
    file.sync_all()?;
    File::open(disk_root)?.sync_all()?;
    Ok(())
}

impl Fsyncer {
    pub(crate) fn new(shared: Arc<WalShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn run(self, control: &ThreadControl) -> Result<()> {
        while !control.stop_requested() {
            if !self.sync_next(control)? {
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    /// Syncs the frontier segment if it is ready. Returns whether any work
    /// was done.
    fn sync_next(&self, control: &ThreadControl) -> Result<bool> {
        let shared = &self.shared;
        let next = shared.control.last_synced_dsid() + 1;
        let slot = shared.segments.slot_for_dsid(next);
        if slot.dsid() != next
            || !slot.fsync_requested()
            || slot.fsync_completed()
            || slot.fsync_error() != 0
        {
            return Ok(false);
        }

        let seg_size = shared.config.segment_size as usize;
        // SAFETY: the slot is sealed (fsync requested, not yet completed),
        // so the flusher has stopped writing it and cannot recycle it
        // until complete_fsync below.
        let bytes = unsafe { slot.slice(0, seg_size) };

        match write_segment_file(&shared.config.disk_root, next, bytes, &|| {
            control.stop_requested()
        }) {
            Ok(()) => {
                slot.complete_fsync();
                shared.control.advance_last_synced_dsid(next)?;
                debug!(dsid = next, "segment synced to disk");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                bail!(WalError::Cancelled)
            }
            Err(err) => {
                let errno = err.raw_os_error().unwrap_or(libc::EIO);
                warn!(dsid = next, errno, error = %err, "segment fsync failed");
                slot.record_fsync_error(errno);
                // The error is sticky; the flusher fails its next rotation
                // over this slot. Keep polling so shutdown stays prompt.
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_segment_file_produces_exact_image() {
        let dir = tempdir().unwrap();
        let payload = vec![0x3cu8; 4096];
        write_segment_file(dir.path(), 17, &payload, &|| false).unwrap();

        let path = disk_segment_path(dir.path(), 17);
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, payload);
    }

    #[test]
    fn cancellation_interrupts_the_write() {
        let dir = tempdir().unwrap();
        let payload = vec![0u8; 4096];
        let err = write_segment_file(dir.path(), 1, &payload, &|| true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
