//! # Configuration Module
//!
//! This module centralizes the runtime configuration (`WalConfig`) and all
//! compile-time constants for nvlog. Constants are grouped by functional
//! area in [`constants`] with their interdependencies documented, because
//! scattered constants with implicit relationships are how segment-size and
//! page-size mismatches turn into corruption.
//!
//! Configuration is validated once, at `Wal::init`, with `ensure!` chains;
//! nothing downstream re-checks it.

pub mod constants;

pub use constants::*;

use std::path::PathBuf;

use eyre::{ensure, Result};

use crate::epoch::Epoch;

/// How `Wal::init` treats pre-existing state under the configured roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Restart from existing state if a complete set of files is present,
    /// otherwise create a fresh instance.
    CreateIfNotExists,
    /// Remove any existing state and create a fresh instance.
    CreateTruncate,
    /// Require a complete set of existing files and recover from them.
    Restart,
}

/// Runtime configuration for one WAL instance.
///
/// `nv_root` holds the byte-addressable tier (segment slots, metadata write
/// buffers, the control block); `disk_root` holds the block-storage tier
/// (segment files, metadata page files). The two may be the same directory
/// on systems without NVM, at a durability-performance cost only.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for NVM-backed files.
    pub nv_root: PathBuf,
    /// Directory for block-storage files.
    pub disk_root: PathBuf,
    /// Number of writer contexts (one producing thread each).
    pub writer_count: u32,
    /// Size of each writer's circular buffer in bytes.
    pub writer_buffer_size: u64,
    /// Size of one log segment in bytes.
    pub segment_size: u64,
    /// Total NVM bytes for segment slots; determines the slot count.
    pub nv_quota: u64,
    /// Size of one metadata-store page in bytes.
    pub mds_page_size: u64,
    /// Epoch to resume from on a fresh instance (durable horizon starts here).
    pub resuming_epoch: Epoch,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            nv_root: PathBuf::new(),
            disk_root: PathBuf::new(),
            writer_count: 1,
            writer_buffer_size: DEFAULT_WRITER_BUFFER_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            nv_quota: DEFAULT_SEGMENT_SIZE * 2,
            mds_page_size: DEFAULT_MDS_PAGE_SIZE,
            resuming_epoch: Epoch::INVALID,
        }
    }
}

impl WalConfig {
    /// Number of NVM segment slots implied by `nv_quota`.
    pub fn segment_count(&self) -> u64 {
        self.nv_quota / self.segment_size
    }

    /// Pre-screens the configuration. Called once from `Wal::init`.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.nv_root.as_os_str().is_empty(),
            "nv_root must not be empty"
        );
        ensure!(
            !self.disk_root.as_os_str().is_empty(),
            "disk_root must not be empty"
        );
        ensure!(
            self.writer_count >= 1 && self.writer_count <= MAX_WRITERS,
            "writer_count must be 1 to {}, got {}",
            MAX_WRITERS,
            self.writer_count
        );
        ensure!(
            self.writer_buffer_size != 0 && self.writer_buffer_size % 512 == 0,
            "writer_buffer_size must be a non-zero multiple of 512, got {}",
            self.writer_buffer_size
        );
        ensure!(
            self.segment_size != 0 && self.segment_size % 512 == 0,
            "segment_size must be a non-zero multiple of 512, got {}",
            self.segment_size
        );
        ensure!(
            self.nv_quota % self.segment_size == 0,
            "nv_quota {} must be a multiple of segment_size {}",
            self.nv_quota,
            self.segment_size
        );
        ensure!(
            self.segment_count() >= 2,
            "nv_quota must cover at least 2 segments, got {}",
            self.segment_count()
        );
        ensure!(
            self.segment_count() <= MAX_ACTIVE_SEGMENTS,
            "nv_quota must cover at most {} segments, got {}",
            MAX_ACTIVE_SEGMENTS,
            self.segment_count()
        );
        ensure!(
            self.mds_page_size % 512 == 0 && self.mds_page_size != 0,
            "mds_page_size must be a non-zero multiple of 512, got {}",
            self.mds_page_size
        );
        ensure!(
            self.mds_page_size >= EPOCH_METADATA_SIZE as u64,
            "mds_page_size must hold at least one epoch record"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> WalConfig {
        WalConfig {
            nv_root: PathBuf::from("/tmp/nv"),
            disk_root: PathBuf::from("/tmp/disk"),
            writer_count: 2,
            writer_buffer_size: 4096,
            segment_size: 4096,
            nv_quota: 4 * 4096,
            mds_page_size: 512,
            resuming_epoch: Epoch::INVALID,
        }
    }

    #[test]
    fn valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn rejects_unaligned_buffer_size() {
        let mut c = valid();
        c.writer_buffer_size = 1000;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_quota_below_two_segments() {
        let mut c = valid();
        c.nv_quota = c.segment_size;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_quota_not_segment_multiple() {
        let mut c = valid();
        c.nv_quota = c.segment_size * 2 + 512;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_zero_writers() {
        let mut c = valid();
        c.writer_count = 0;
        assert!(c.validate().is_err());
    }
}
