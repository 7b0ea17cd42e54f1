//! # Persist Primitive
//!
//! A single durability primitive over memory-mapped ranges: after
//! [`persist`] returns, every byte in the named range survives power
//! failure, the CPU cache is drained, and the persist is not reordered with
//! subsequent persists.
//!
//! Over real persistent memory the kernel maps these files with DAX and
//! `msync` degenerates to cache-line flush plus drain; over plain block
//! storage the same call is an `msync(MS_SYNC)` into the file, which is the
//! strongest ordering the medium offers. Callers never need to know which
//! of the two they got.
//!
//! `memmap2::MmapMut::flush_range` aligns the address range to page
//! boundaries internally, so callers pass byte-exact offsets.

use eyre::{Result, WrapErr};
use memmap2::{MmapMut, MmapRaw};

/// Durably flushes `len` bytes of `map` starting at `offset`.
pub fn persist(map: &MmapMut, offset: usize, len: usize) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    map.flush_range(offset, len)
        .wrap_err_with(|| format!("failed to persist {} bytes at offset {}", len, offset))
}

/// Durably flushes an entire mapping.
pub fn persist_all(map: &MmapMut) -> Result<()> {
    map.flush().wrap_err("failed to persist mapping")
}

/// Durably flushes `len` bytes of a raw mapping starting at `offset`.
///
/// Raw mappings back the regions that are concurrently written through
/// pointers under a publication protocol (segment slots, metadata write
/// buffers); the flush semantics are identical to [`persist`].
pub fn persist_raw(map: &MmapRaw, offset: usize, len: usize) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    map.flush_range(offset, len)
        .wrap_err_with(|| format!("failed to persist {} bytes at offset {}", len, offset))
}

/// Durably flushes an entire raw mapping.
pub fn persist_raw_all(map: &MmapRaw) -> Result<()> {
    map.flush().wrap_err("failed to persist mapping")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    #[test]
    fn persist_survives_remap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pmem-test");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(4096).unwrap();

        // SAFETY: the file was just created with exclusive access and sized
        // before mapping; the mapping does not outlive this scope.
        let mut map = unsafe { MmapMut::map_mut(&file).unwrap() };
        map[100..108].copy_from_slice(b"durable!");
        persist(&map, 100, 8).unwrap();
        drop(map);

        // SAFETY: same file, same constraints as above.
        let map = unsafe { MmapMut::map_mut(&file).unwrap() };
        assert_eq!(&map[100..108], b"durable!");
    }

    #[test]
    fn zero_length_persist_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pmem-test");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(512).unwrap();
        // SAFETY: exclusive, freshly created file.
        let map = unsafe { MmapMut::map_mut(&file).unwrap() };
        persist(&map, 0, 0).unwrap();
    }
}
