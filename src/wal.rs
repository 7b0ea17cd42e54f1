//! # WAL Facade
//!
//! `Wal` assembles the engine: the persistent control block, the NVM
//! segment pool, the per-writer buffers, the metadata store, and the two
//! background threads (flusher, fsyncer). `init` wires them up and waits
//! for both threads to report Running; `uninit` (or Drop) requests a
//! cooperative stop, joins, and surfaces the first error either thread
//! stashed.
//!
//! ## Init modes and recovery
//!
//! - `CreateIfNotExists`: restart from a complete set of existing files,
//!   otherwise create a fresh instance.
//! - `CreateTruncate`: remove this instance's files under both roots and
//!   create fresh.
//! - `Restart`: require existing state.
//!
//! Restart recovery runs before the threads spawn: the metadata store
//! finishes any interrupted rollback and re-anchors its buffers, then any
//! NVM segments holding durable bytes past the on-disk frontier are
//! drained to block storage. The flusher resumes in a fresh segment just
//! past the drained frontier — partially-filled tail space is abandoned,
//! never rewritten, so disk segment images stay immutable.
//!
//! ## Shared state
//!
//! `WalShared` is the single `Arc` every engine and cursor hangs off. The
//! published `durable_epoch` word in it is the only horizon readers may
//! trust; the control block's copy is persisted strictly before this one
//! is stored.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{info, warn};

use crate::config::{InitMode, WalConfig};
use crate::control::ControlBlock;
use crate::cursor::LogCursor;
use crate::epoch::Epoch;
use crate::error::WalError;
use crate::flusher::Flusher;
use crate::fsyncer::{self, Fsyncer};
use crate::mds::{EpochMetadata, MdsCore};
use crate::segment::SegmentPool;
use crate::thread::BackgroundThread;
use crate::writer::WriterBuffer;

pub(crate) struct WalShared {
    pub(crate) config: WalConfig,
    pub(crate) control: Arc<ControlBlock>,
    pub(crate) segments: SegmentPool,
    pub(crate) writers: Box<[WriterBuffer]>,
    pub(crate) mds: MdsCore,
    /// The published durable horizon. Stored only after the control
    /// block's copy is persisted.
    durable_epoch: AtomicU64,
    /// The epoch the application last declared closed.
    stable_epoch: AtomicU64,
    /// First dsid the flusher fills after init.
    pub(crate) flusher_start_dsid: u64,
}

impl WalShared {
    pub(crate) fn durable(&self) -> Epoch {
        Epoch::new(self.durable_epoch.load(Ordering::Acquire))
    }

    pub(crate) fn stable(&self) -> Epoch {
        Epoch::new(self.stable_epoch.load(Ordering::Acquire))
    }

    pub(crate) fn publish_durable(&self, epoch: Epoch) {
        self.durable_epoch.store(epoch.raw(), Ordering::Release);
    }
}

pub struct Wal {
    shared: Arc<WalShared>,
    flusher: Option<BackgroundThread>,
    fsyncer: Option<BackgroundThread>,
}

/// Removes this instance's files so `CreateTruncate` starts clean. Only
/// files matching our naming scheme are touched.
fn wipe_instance_files(config: &WalConfig) -> Result<()> {
    use crate::config::{
        CONTROL_FILE_NAME, DISK_SEGMENT_FILE_PREFIX, MDS_BUFFER_FILE_PREFIX,
        MDS_PAGEFILE_PREFIX, NV_SEGMENT_FILE_PREFIX,
    };
    let matches_ours = |name: &str, root_is_nv: bool| {
        if root_is_nv {
            name == CONTROL_FILE_NAME
                || name.starts_with(NV_SEGMENT_FILE_PREFIX)
                || name.starts_with(MDS_BUFFER_FILE_PREFIX)
        } else {
            name.starts_with(DISK_SEGMENT_FILE_PREFIX) || name.starts_with(MDS_PAGEFILE_PREFIX)
        }
    };
    for (root, is_nv) in [(&config.nv_root, true), (&config.disk_root, false)] {
        if !root.exists() {
            continue;
        }
        for entry in fs::read_dir(root)
            .wrap_err_with(|| format!("failed to list directory {:?}", root))?
        {
            let entry = entry.wrap_err("failed to read directory entry")?;
            let name = entry.file_name();
            if matches_ours(&name.to_string_lossy(), is_nv) {
                fs::remove_file(entry.path())
                    .wrap_err_with(|| format!("failed to remove {:?}", entry.path()))?;
            }
        }
    }
    Ok(())
}

impl Wal {
    /// Brings up a WAL instance and its background engines.
    pub fn init(config: WalConfig, mode: InitMode) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.nv_root)
            .wrap_err_with(|| format!("failed to create nv_root {:?}", config.nv_root))?;
        fs::create_dir_all(&config.disk_root)
            .wrap_err_with(|| format!("failed to create disk_root {:?}", config.disk_root))?;

        let mode = if mode == InitMode::CreateTruncate {
            wipe_instance_files(&config)?;
            InitMode::CreateIfNotExists
        } else {
            mode
        };

        let restart = ControlBlock::exists(&config.nv_root);
        if mode == InitMode::Restart && !restart {
            bail!(WalError::Corrupt(format!(
                "restart requested but no control block under {:?}",
                config.nv_root
            )));
        }

        let control = Arc::new(if restart {
            ControlBlock::open(&config.nv_root)?
        } else {
            ControlBlock::create(&config.nv_root, config.resuming_epoch)?
        });

        let segments = if restart {
            SegmentPool::open(&config.nv_root, config.segment_count(), config.segment_size)?
        } else {
            SegmentPool::create(&config.nv_root, config.segment_count(), config.segment_size)?
        };

        let mds = MdsCore::init(
            &config.nv_root,
            &config.disk_root,
            config.mds_page_size,
            mode,
            Arc::clone(&control),
        )?;

        let flusher_start_dsid = if restart {
            Self::drain_nvm_segments(&config, &control, &segments, &mds)?
        } else {
            1
        };

        let writers = (0..config.writer_count)
            .map(|_| WriterBuffer::new(config.writer_buffer_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let durable = control.durable_epoch();
        let shared = Arc::new(WalShared {
            segments,
            writers,
            mds,
            durable_epoch: AtomicU64::new(durable.raw()),
            stable_epoch: AtomicU64::new(durable.raw()),
            flusher_start_dsid,
            control,
            config,
        });

        let fsyncer_thread = BackgroundThread::spawn("nvlog-fsyncer", {
            let shared = Arc::clone(&shared);
            move |control| Fsyncer::new(shared).run(control)
        })?;
        let flusher_thread = BackgroundThread::spawn("nvlog-flusher", {
            let shared = Arc::clone(&shared);
            move |control| Flusher::new(shared).run(control)
        })?;

        info!(
            durable = durable.raw(),
            start_dsid = flusher_start_dsid,
            restart,
            "wal initialized"
        );
        Ok(Self {
            shared,
            flusher: Some(flusher_thread),
            fsyncer: Some(fsyncer_thread),
        })
    }

    /// Restart path: copy NVM segments that hold durable bytes past the
    /// on-disk frontier out to block storage, so every durable byte is
    /// reachable by `dsid ≤ last_synced_dsid` and the slot ring starts
    /// empty. Returns the dsid the flusher should fill first.
    fn drain_nvm_segments(
        config: &WalConfig,
        control: &ControlBlock,
        segments: &SegmentPool,
        mds: &MdsCore,
    ) -> Result<u64> {
        let durable = control.durable_epoch();
        let last_synced = control.last_synced_dsid();
        if !durable.is_valid() {
            return Ok(last_synced + 1);
        }
        // The store's newest record is the durable epoch's after recovery;
        // its extent names the frontier dsid.
        let frontier = match mds.read_latest_epoch() {
            Ok(meta) => meta.to_seg_id,
            Err(err) => {
                // A resumed instance that never concluded an epoch has a
                // durable horizon but no record for it.
                warn!(
                    durable = durable.raw(),
                    error = %err,
                    "no extent record for the durable epoch; nothing to drain"
                );
                return Ok(last_synced + 1);
            }
        };

        let seg_size = config.segment_size as usize;
        for dsid in (last_synced + 1)..=frontier {
            let slot = segments.slot(segments.slot_index(dsid));
            // SAFETY: recovery is single-threaded; no engine is running
            // yet.
            let bytes = unsafe { slot.slice(0, seg_size) };
            fsyncer::write_segment_file(&config.disk_root, dsid, bytes, &|| false)
                .map_err(|err| WalError::io("drain NVM segment to disk", err))?;
            control.advance_last_synced_dsid(dsid)?;
            info!(dsid, "drained NVM segment to disk during recovery");
        }
        Ok(frontier.max(last_synced) + 1)
    }

    fn shutdown(&mut self) -> Result<()> {
        let mut first_error = None;
        // The flusher can be waiting on the fsyncer during rotation, so it
        // goes down first.
        for thread in [self.flusher.take(), self.fsyncer.take()].into_iter().flatten() {
            if let Err(err) = thread.stop() {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Joins the background engines and returns the first error observed.
    pub fn uninit(mut self) -> Result<()> {
        self.shutdown()
    }

    /// The format version of this engine.
    pub fn version() -> u32 {
        1
    }

    /// The published durable horizon: every epoch at or before it is fully
    /// persisted. Monotone across successful calls.
    pub fn query_durable_epoch(&self) -> Epoch {
        self.shared.durable()
    }

    /// Declares `new_stable` closed. Honored only when it is exactly the
    /// successor of the durable horizon; set with a CAS so concurrent
    /// callers cannot skip an epoch.
    pub fn advance_stable_epoch(&self, new_stable: Epoch) -> bool {
        let durable = self.shared.durable();
        if new_stable != durable.next() {
            return false;
        }
        self.shared
            .stable_epoch
            .compare_exchange(
                durable.raw(),
                new_stable.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn writer_buffer(&self, writer: usize) -> Result<&WriterBuffer> {
        self.shared.writers.get(writer).ok_or_else(|| {
            WalError::InvalidArgument(format!(
                "writer index {} out of range (writer_count {})",
                writer,
                self.shared.writers.len()
            ))
            .into()
        })
    }

    /// Appends `bytes` under `epoch` for writer context `writer`. Single
    /// calling thread per writer; callers check space first.
    pub fn on_wal_write(&self, writer: usize, bytes: &[u8], epoch: Epoch) -> Result<()> {
        self.writer_buffer(writer)?.on_wal_write(bytes, epoch)
    }

    /// True iff the writer may issue another write of up to half its
    /// buffer without waiting.
    pub fn has_enough_writer_space(&self, writer: usize) -> Result<bool> {
        Ok(self.writer_buffer(writer)?.has_enough_space())
    }

    /// Yields until the writer has space. Fails if the flusher died, since
    /// space would then never come back.
    pub fn assure_writer_space(&self, writer: usize) -> Result<()> {
        let buffer = self.writer_buffer(writer)?;
        while !buffer.has_enough_space() {
            if let Some(flusher) = &self.flusher {
                ensure!(
                    !flusher.is_stopped(),
                    "flusher is down; writer space cannot be reclaimed"
                );
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Opens a cursor over `[begin, end)`. The range is truncated to the
    /// durable horizon at open time.
    pub fn open_log_cursor(&self, begin: Epoch, end: Epoch) -> Result<LogCursor> {
        LogCursor::open(Arc::clone(&self.shared), begin, end)
    }

    /// Truncates the log back to `epoch`: durably lowers the horizons and
    /// discards newer metadata. Callers must have quiesced writers and
    /// closed cursors first; the page reload is destructive.
    pub fn rollback_to_epoch(&self, epoch: Epoch) -> Result<()> {
        self.shared.mds.rollback(epoch)?;
        self.shared
            .stable_epoch
            .store(epoch.raw(), Ordering::Release);
        self.shared.publish_durable(epoch);
        Ok(())
    }

    /// Binary search over committed epochs for the first record whose
    /// user-metadata word satisfies `predicate`.
    pub fn find_metadata_lower_bound<F>(
        &self,
        user_metadata_id: u32,
        predicate: F,
    ) -> Result<Option<EpochMetadata>>
    where
        F: FnMut(u64) -> bool,
    {
        self.shared
            .mds
            .find_metadata_lower_bound(user_metadata_id, predicate)
    }

    /// Binary search over committed epochs for the last record whose
    /// user-metadata word satisfies `predicate`.
    pub fn find_metadata_upper_bound<F>(
        &self,
        user_metadata_id: u32,
        predicate: F,
    ) -> Result<Option<EpochMetadata>>
    where
        F: FnMut(u64) -> bool,
    {
        self.shared
            .mds
            .find_metadata_upper_bound(user_metadata_id, predicate)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "error while shutting down wal");
        }
    }
}
