//! # Shared File Mappings
//!
//! Every `SlabAlloc` attached to the same path shares a single
//! `MappedFile` record: the open file, the initial read-only mapping, and
//! the array of additional per-section mappings appended as the file
//! grows. The record lives in a process-wide registry of weak pointers;
//! the first attacher creates and validates it, later attachers fast-path
//! off the cached state, and the record dies with its last allocator.
//!
//! ## Mapping growth
//!
//! The initial mapping covers the file as it was at attach time and is
//! immutable from then on, so reads through it never take a lock. Sections
//! mapped later are stored in a mutex-protected vector: a reader resolving
//! a ref into an additional section holds the per-file mutex just long
//! enough to fetch the section's base pointer. Mappings are only ever
//! appended, never replaced, so a fetched pointer stays valid for the
//! lifetime of the record.
//!
//! ## Safety
//!
//! Mapping a file is unsafe because external modifications to the mapped
//! region are undefined behavior. This is safe under the engine's single
//! contract: committed bytes below the baseline are never modified, by any
//! process; commits only append sections and rewrite the 24-byte header,
//! which is read through explicit re-reads, not through cached decoded
//! state.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use memmap2::Mmap;
use parking_lot::Mutex;

/// State shared between all allocators attached to one file.
#[derive(Debug, Default)]
pub(crate) struct MappedFile {
    pub inner: Mutex<MappedInner>,
}

#[derive(Debug, Default)]
pub(crate) struct MappedInner {
    pub file: Option<File>,
    /// Read-only mapping of the file as sized at first attach. Immutable
    /// once established.
    pub initial: Option<Mmap>,
    /// Section index of the first additional mapping.
    pub first_additional: usize,
    /// One read-only mapping per section beyond the initial mapping.
    /// Append-only.
    pub additional: Vec<Mmap>,
    pub file_format: u8,
    pub streaming_form: bool,
    /// Top ref established at first attach. Authoritative while the file
    /// is on streaming form (the header slot holds the sentinel then).
    pub top_ref: u64,
    /// True once the first attacher finished validation; later attachers
    /// fast-path off the fields above.
    pub success: bool,
}

static ALL_FILES: OnceLock<Mutex<HashMap<PathBuf, Weak<MappedFile>>>> = OnceLock::new();

/// Fetch the shared record for `path`, creating a fresh one if no live
/// allocator holds it.
pub(crate) fn shared_mapping(path: &Path) -> Arc<MappedFile> {
    let registry = ALL_FILES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut files = registry.lock();

    if let Some(alive) = files.get(path).and_then(Weak::upgrade) {
        return alive;
    }

    let fresh = Arc::new(MappedFile::default());
    files.insert(path.to_path_buf(), Arc::downgrade(&fresh));
    fresh
}

/// Size of the initial section: one OS page.
pub(crate) fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf only inspects process-wide constants.
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n > 0 {
            n as u64
        } else {
            4096
        }
    })
}

/// Whether `PACKDB_DISABLE_SYNC` turned off disk syncs for this process.
/// Read once; flipping the variable later has no effect.
pub(crate) fn sync_to_disk_disabled() -> bool {
    static DISABLE_SYNC: OnceLock<bool> = OnceLock::new();
    *DISABLE_SYNC.get_or_init(|| {
        std::env::var_os("PACKDB_DISABLE_SYNC").is_some_and(|v| v != "0")
    })
}

/// Sync file contents unless the process-wide kill switch is set.
pub(crate) fn sync_file(file: &File) -> Result<()> {
    if sync_to_disk_disabled() {
        return Ok(());
    }
    file.sync_data().wrap_err("failed to sync database file")
}

#[cfg(unix)]
pub(crate) fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
        .wrap_err_with(|| format!("failed to write {} bytes at offset {}", data.len(), offset))
}

#[cfg(windows)]
pub(crate) fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < data.len() {
        let n = file
            .seek_write(&data[written..], offset + written as u64)
            .wrap_err_with(|| format!("failed to write at offset {}", offset))?;
        written += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let size = page_size();
        assert!(size >= 512);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn same_path_shares_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.pdb");

        let a = shared_mapping(&path);
        let b = shared_mapping(&path);

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn record_dies_with_last_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dying.pdb");

        let first = shared_mapping(&path);
        let raw = Arc::as_ptr(&first);
        drop(first);

        // A new attach after the last holder dropped gets a fresh record.
        let second = shared_mapping(&path);
        let _ = raw;
        assert!(!second.inner.lock().success);
    }
}
