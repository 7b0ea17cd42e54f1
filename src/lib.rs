//! # nvlog - Hybrid NVM/Disk Write-Ahead Log Engine
//!
//! nvlog makes a stream of epoch-tagged log bytes durable across a hybrid
//! storage hierarchy: a small ring of byte-addressable non-volatile memory
//! (NVM) segments absorbs writes at memory speed, while a deeper tier of
//! block-storage files holds the long log tail. Readers replay any range
//! of committed epochs back as contiguous byte spans.
//!
//! ## Architecture
//!
//! ```text
//! writer threads          background engines              readers
//! ┌────────────┐   ┌──────────────────────────────┐   ┌────────────┐
//! │ writer buf ├──▶│ flusher: drain → NVM segment │   │ log cursor │
//! │ (epoch     │   │   rotate, persist, commit    │   │  mmap disk │
//! │  frames)   │   ├──────────────────────────────┤   │  pin NVM   │
//! └────────────┘   │ fsyncer: NVM seg → disk file │◀──┤  segments  │
//!                  └──────────────┬───────────────┘   └─────┬──────┘
//!                                 │                         │
//!                  ┌──────────────▼───────────────┐         │
//!                  │ metadata store: epoch → byte │◀────────┘
//!                  │ extent, paged + NVM-buffered │
//!                  └──────────────────────────────┘
//! ```
//!
//! Epochs are the only commit abstraction: writers tag bytes with a
//! monotonically advancing epoch, the application declares epochs *stable*,
//! and the flusher publishes a *durable* horizon that readers may trust.
//! Everything between a writer's buffer and the published horizon is
//! lock-free; the hot paths synchronize through release/acquire atomics
//! only.
//!
//! ## Quick start
//!
//! ```ignore
//! use nvlog::{Epoch, InitMode, Wal, WalConfig};
//!
//! let wal = Wal::init(
//!     WalConfig {
//!         nv_root: "/mnt/nvm/log".into(),
//!         disk_root: "/var/lib/log".into(),
//!         writer_count: 1,
//!         ..WalConfig::default()
//!     },
//!     InitMode::CreateIfNotExists,
//! )?;
//!
//! wal.on_wal_write(0, b"payload", Epoch::new(1))?;
//! wal.advance_stable_epoch(Epoch::new(1));
//! // ... wait for query_durable_epoch() to reach epoch 1 ...
//!
//! let mut cursor = wal.open_log_cursor(Epoch::new(1), Epoch::new(2))?;
//! while cursor.is_valid() {
//!     consume(cursor.data());
//!     cursor.next()?;
//! }
//! ```
//!
//! ## Durability model
//!
//! Every byte of every epoch at or before the published durable horizon is
//! persisted — on NVM via flush-and-drain persists, or on disk via fsynced
//! segment files — before the horizon moves. The persistent control block
//! records the three frontiers (`durable_epoch`, `paged_mds_epoch`,
//! `last_synced_dsid`) and is written strictly after the data each word
//! describes.
//!
//! ## Module Overview
//!
//! - [`config`]: runtime configuration and centralized constants
//! - [`epoch`]: wrap-around epoch arithmetic
//! - [`segment`]: the NVM segment slot ring and reader pins
//! - [`writer`]: per-writer circular buffers and epoch frames
//! - `flusher` / `fsyncer`: the two background engines
//! - [`mds`]: the paged epoch-metadata store
//! - [`cursor`]: epoch-range readers
//! - [`control`]: the persistent control block
//! - [`pmem`]: the persist primitive

pub mod config;
pub mod control;
pub mod cursor;
pub mod epoch;
pub mod error;
mod flusher;
mod fsyncer;
pub mod mds;
pub mod pmem;
pub mod segment;
mod thread;
pub mod wal;
pub mod writer;

pub use config::{InitMode, WalConfig};
pub use cursor::LogCursor;
pub use epoch::Epoch;
pub use error::WalError;
pub use mds::EpochMetadata;
pub use wal::Wal;
