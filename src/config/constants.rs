//! # Configuration Constants
//!
//! All numeric configuration values for nvlog, grouped by the component they
//! govern. Interdependent values are co-located and their relationships
//! documented; the compile-time assertions at the bottom enforce the ones
//! that must never drift apart.
//!
//! ## Dependency Graph
//!
//! ```text
//! EPOCH_METADATA_SIZE (64 bytes, failure-atomic unit)
//!       │
//!       ├─> records_per_page = mds_page_size / EPOCH_METADATA_SIZE
//!       │     The epoch-to-page mapping divides by this; page files are
//!       │     append-only in whole-page units.
//!       │
//!       └─> MDS_READ_PREFETCH (records per iterator prefetch)
//!             A prefetch never crosses a page boundary, so values above
//!             records_per_page buy nothing.
//!
//! WRITER_FRAME_COUNT (8)
//!       │
//!       └─> Writers may post epochs at most two ahead of the durable
//!           horizon, so at most 3 frames are ever live; the remaining
//!           slack absorbs retirement lag before on_wal_write fails with
//!           a contract violation.
//!
//! CURSOR_EPOCH_PREFETCH / NUM_READ_REGIONS
//!       │
//!       └─> Bound the metadata cache and live mappings held per cursor.
//! ```

/// Size of one epoch metadata record. This is the NVM failure-atomic write
/// unit; every on-media record layout is built around it.
pub const EPOCH_METADATA_SIZE: usize = 64;

/// Maximum number of writer contexts.
pub const MAX_WRITERS: u32 = 64;

/// Maximum number of NVM segment slots (`nv_quota / segment_size`).
pub const MAX_ACTIVE_SEGMENTS: u64 = 1024;

/// Frames in each writer's epoch ring. Must be at least 5: up to 3 live
/// epochs (durable+1..durable+2 plus the one being retired) and slack for
/// the flusher to retire behind the writer.
pub const WRITER_FRAME_COUNT: usize = 8;

/// Number of metadata page files (logical partitions). Epoch `e` lives in
/// file `e % MDS_PAGEFILE_COUNT`.
pub const MDS_PAGEFILE_COUNT: u32 = 1;

/// Records fetched per metadata-iterator prefetch. Never crosses a page
/// boundary.
pub const MDS_READ_PREFETCH: usize = 8;

/// Epoch metadata entries a cursor fetches from the metadata store at once.
pub const CURSOR_EPOCH_PREFETCH: usize = 4;

/// Maximum live mapped regions per cursor.
pub const NUM_READ_REGIONS: usize = 4;

/// Whether the filesystem is declared to append whole pages atomically.
/// When false, a page file whose size is not a page multiple at init is
/// corruption rather than a recoverable torn append.
pub const FS_ATOMIC_APPEND: bool = false;

/// Default size of one metadata-store page.
pub const DEFAULT_MDS_PAGE_SIZE: u64 = 4096;

/// Default size of one log segment.
pub const DEFAULT_SEGMENT_SIZE: u64 = 32 * 1024 * 1024;

/// Default size of each writer's circular buffer.
pub const DEFAULT_WRITER_BUFFER_SIZE: u64 = 4 * 1024 * 1024;

/// NVM segment slot files: `<nv_root>/nv_segment_<slot>`.
pub const NV_SEGMENT_FILE_PREFIX: &str = "nv_segment_";

/// Disk segment files: `<disk_root>/nvwal_ds<dsid>`.
pub const DISK_SEGMENT_FILE_PREFIX: &str = "nvwal_ds";

/// Metadata page files: `<disk_root>/mds-pagefile-<i>`.
pub const MDS_PAGEFILE_PREFIX: &str = "mds-pagefile-";

/// NVM metadata write buffers: `<nv_root>/mds-nvram-buf-<i>`.
pub const MDS_BUFFER_FILE_PREFIX: &str = "mds-nvram-buf-";

/// The persistent control block: `<nv_root>/nvwal-control`.
pub const CONTROL_FILE_NAME: &str = "nvwal-control";

const _: () = assert!(WRITER_FRAME_COUNT >= 5);
const _: () = assert!(MDS_PAGEFILE_COUNT >= 1);
const _: () = assert!(EPOCH_METADATA_SIZE == 64);
const _: () = assert!(MDS_READ_PREFETCH >= 1 && CURSOR_EPOCH_PREFETCH >= 1);
