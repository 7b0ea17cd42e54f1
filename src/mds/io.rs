//! # Metadata Page-File I/O
//!
//! Each of the metadata store's logical partitions is one append-only page
//! file under `disk_root`. The file is a flat run of fixed-size pages; page
//! numbers are 1-based and page `p` lives at byte offset
//! `(p - 1) * page_size`. Appends are whole pages followed by fsync, so a
//! file's length is always a page multiple — except after a crash mid-
//! append.
//!
//! ## Torn-append recovery
//!
//! Whether a torn tail is recoverable depends on the filesystem contract.
//! When `FS_ATOMIC_APPEND` is declared, a non-multiple length at init is a
//! torn append and the file is truncated down to the last full page. When
//! it is not declared, the writeback protocol never relies on observing a
//! partial append in the first place, so a non-multiple length means
//! something else scribbled on the file: corruption.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, info};

use crate::config::{InitMode, FS_ATOMIC_APPEND, MDS_PAGEFILE_COUNT, MDS_PAGEFILE_PREFIX};
use crate::error::WalError;

pub struct PageFile {
    file: File,
    path: PathBuf,
}

pub struct MdsIo {
    files: Vec<PageFile>,
    page_size: u64,
}

fn pagefile_path(disk_root: &Path, file_no: u32) -> PathBuf {
    disk_root.join(format!("{}{}", MDS_PAGEFILE_PREFIX, file_no))
}

fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .wrap_err_with(|| format!("failed to open directory {:?} for fsync", dir))?
        .sync_all()
        .wrap_err_with(|| format!("failed to fsync directory {:?}", dir))
}

impl MdsIo {
    /// Opens or creates the full set of page files. Returns the I/O context
    /// and whether it restarted from existing files.
    pub fn init(disk_root: &Path, page_size: u64, mode: InitMode) -> Result<(Self, bool)> {
        let num_existing = (0..MDS_PAGEFILE_COUNT)
            .filter(|&i| pagefile_path(disk_root, i).exists())
            .count() as u32;

        let restart = match (mode, num_existing) {
            (InitMode::Restart, n) if n == MDS_PAGEFILE_COUNT => true,
            (InitMode::CreateIfNotExists, n) if n == MDS_PAGEFILE_COUNT => true,
            (InitMode::CreateIfNotExists | InitMode::CreateTruncate, 0) => false,
            _ => bail!(WalError::Corrupt(format!(
                "found {} of {} metadata page files under {:?} in {:?} mode",
                num_existing, MDS_PAGEFILE_COUNT, disk_root, mode
            ))),
        };

        let mut files = Vec::with_capacity(MDS_PAGEFILE_COUNT as usize);
        for i in 0..MDS_PAGEFILE_COUNT {
            let path = pagefile_path(disk_root, i);
            let file = if restart {
                OpenOptions::new()
                    .read(true)
                    .append(true)
                    .open(&path)
                    .wrap_err_with(|| format!("failed to open metadata page file {:?}", path))?
            } else {
                info!(path = %path.display(), "creating metadata page file");
                OpenOptions::new()
                    .read(true)
                    .append(true)
                    .create_new(true)
                    .open(&path)
                    .wrap_err_with(|| format!("failed to create metadata page file {:?}", path))?
            };
            files.push(PageFile { file, path });
        }

        if !restart {
            // Make the newly created (empty) files visible before anything
            // is appended to them.
            fsync_dir(disk_root)?;
        }

        let io = Self { files, page_size };
        if restart {
            for i in 0..MDS_PAGEFILE_COUNT {
                io.recover_torn_append(i)?;
            }
        }
        Ok((io, restart))
    }

    fn pagefile(&self, file_no: u32) -> &PageFile {
        &self.files[file_no as usize]
    }

    fn recover_torn_append(&self, file_no: u32) -> Result<()> {
        let pf = self.pagefile(file_no);
        let len = pf
            .file
            .metadata()
            .wrap_err("failed to stat metadata page file")?
            .len();
        if len % self.page_size == 0 {
            return Ok(());
        }
        if FS_ATOMIC_APPEND {
            let full_pages = len / self.page_size;
            debug!(
                path = %pf.path.display(),
                len,
                full_pages,
                "truncating torn append in metadata page file"
            );
            self.truncate(file_no, full_pages)
        } else {
            bail!(WalError::Corrupt(format!(
                "metadata page file {:?} has size {} which is not a multiple \
                 of the page size {}",
                pf.path, len, self.page_size
            )))
        }
    }

    /// Positional read of `buf.len()` bytes at `offset`.
    pub fn pread(&self, file_no: u32, buf: &mut [u8], offset: u64) -> Result<()> {
        let pf = self.pagefile(file_no);
        pf.file.read_exact_at(buf, offset).wrap_err_with(|| {
            format!(
                "failed to read {} bytes at offset {} from {:?}",
                buf.len(),
                offset,
                pf.path
            )
        })
    }

    /// Appends one whole page and fsyncs it.
    pub fn append_page(&self, file_no: u32, page: &[u8]) -> Result<()> {
        ensure!(
            page.len() as u64 == self.page_size,
            "append must cover a whole page: got {} bytes, page size {}",
            page.len(),
            self.page_size
        );
        let pf = self.pagefile(file_no);
        // O_APPEND positions every write at the current end; loop over
        // partial writes like any raw write path must.
        let mut written = 0;
        while written < page.len() {
            let n = (&pf.file)
                .write(&page[written..])
                .wrap_err_with(|| format!("failed to append page to {:?}", pf.path))?;
            ensure!(n != 0, "zero-length write appending page to {:?}", pf.path);
            written += n;
        }
        pf.file
            .sync_data()
            .wrap_err_with(|| format!("failed to fsync page append to {:?}", pf.path))
    }

    /// Truncates the file to `num_pages` whole pages and fsyncs.
    pub fn truncate(&self, file_no: u32, num_pages: u64) -> Result<()> {
        let pf = self.pagefile(file_no);
        pf.file
            .set_len(num_pages * self.page_size)
            .wrap_err_with(|| format!("failed to truncate {:?} to {} pages", pf.path, num_pages))?;
        pf.file
            .sync_data()
            .wrap_err_with(|| format!("failed to fsync truncate of {:?}", pf.path))
    }

    /// Number of whole pages currently in the file.
    pub fn num_pages(&self, file_no: u32) -> Result<u64> {
        let pf = self.pagefile(file_no);
        let len = pf
            .file
            .metadata()
            .wrap_err("failed to stat metadata page file")?
            .len();
        ensure!(
            len % self.page_size == 0,
            WalError::Corrupt(format!(
                "metadata page file {:?} has size {} which is not a page multiple",
                pf.path, len
            ))
        );
        Ok(len / self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn create_then_restart_roundtrip() {
        let dir = tempdir().unwrap();
        let (io, restarted) = MdsIo::init(dir.path(), 512, InitMode::CreateIfNotExists).unwrap();
        assert!(!restarted);
        assert_eq!(io.num_pages(0).unwrap(), 0);

        let page = vec![0x5au8; 512];
        io.append_page(0, &page).unwrap();
        io.append_page(0, &page).unwrap();
        drop(io);

        let (io, restarted) = MdsIo::init(dir.path(), 512, InitMode::Restart).unwrap();
        assert!(restarted);
        assert_eq!(io.num_pages(0).unwrap(), 2);

        let mut buf = vec![0u8; 512];
        io.pread(0, &mut buf, 512).unwrap();
        assert_eq!(buf, page);
    }

    #[test]
    fn restart_without_files_fails() {
        let dir = tempdir().unwrap();
        assert!(MdsIo::init(dir.path(), 512, InitMode::Restart).is_err());
    }

    #[test]
    fn truncate_drops_tail_pages() {
        let dir = tempdir().unwrap();
        let (io, _) = MdsIo::init(dir.path(), 512, InitMode::CreateIfNotExists).unwrap();
        for fill in [1u8, 2, 3] {
            io.append_page(0, &vec![fill; 512]).unwrap();
        }
        io.truncate(0, 1).unwrap();
        assert_eq!(io.num_pages(0).unwrap(), 1);

        let mut buf = vec![0u8; 512];
        io.pread(0, &mut buf, 0).unwrap();
        assert_eq!(buf, vec![1u8; 512]);
    }

    #[test]
    fn non_page_multiple_size_is_corrupt_without_atomic_append() {
        let dir = tempdir().unwrap();
        {
            let (io, _) = MdsIo::init(dir.path(), 512, InitMode::CreateIfNotExists).unwrap();
            io.append_page(0, &vec![9u8; 512]).unwrap();
            io.append_page(0, &vec![9u8; 512]).unwrap();
        }
        // Simulate a torn append of the second page.
        let path = dir.path().join(format!("{}0", MDS_PAGEFILE_PREFIX));
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..700]).unwrap();

        let result = MdsIo::init(dir.path(), 512, InitMode::Restart);
        if FS_ATOMIC_APPEND {
            let (io, _) = result.unwrap();
            assert_eq!(io.num_pages(0).unwrap(), 1);
        } else {
            assert!(result.is_err());
        }
    }
}
