//! # Attach Protocol
//!
//! Binding an allocator to its backing storage: a database file, an owned
//! in-memory image of one, or nothing at all. File attachment is where
//! the durability handshake happens:
//!
//! 1. The file is validated (size, magic, top-ref bounds, format
//!    version) against its size *before* any extension.
//! 2. A file whose size is off a section boundary is extended up to the
//!    next boundary, but only by the session initiator or an unshared
//!    attacher. A shared non-initiator observing such a size has caught a
//!    concurrent commit mid-extension and fails with `Retry`.
//! 3. A streaming-form file (top ref in a trailing footer) is flipped to
//!    the double-buffered committed form by the session initiator, in
//!    three synced steps. Before the select-bit store the file is valid
//!    streaming form; after it, valid committed form. There is no third
//!    observable state.
//!
//! All attach failures surface as [`StorageError::InvalidDatabase`]
//! except the extension race, which is [`StorageError::Retry`].
//!
//! After a successful file attach, free-space tracking is deliberately
//! invalid: the first write transaction must call
//! `reset_free_space_tracking`, which rebuilds it from the slab list.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use memmap2::MmapOptions;
use tracing::debug;
use zerocopy::IntoBytes;

use super::slab::{AttachMode, FreeSpaceState, Ref, SlabAlloc};
use crate::encryption::Cipher;
use crate::error::StorageError;
use crate::file::{
    file_format_supported, shared_mapping, sync_file, write_at, FileHeader, StreamingFooter,
    FILE_HEADER_SIZE, FOOTER_SIZE,
};

/// Options controlling a file attach.
#[derive(Debug, Clone, Default)]
pub struct AttachConfig {
    pub read_only: bool,
    pub is_shared: bool,
    /// First session against this file; may extend it and flip streaming
    /// form. Requires `is_shared`.
    pub session_initiator: bool,
    /// Reinitialize the file as empty. Requires `session_initiator`.
    pub clear_file: bool,
    pub no_create: bool,
    pub skip_validate: bool,
    pub cipher: Option<Arc<dyn Cipher>>,
}

impl SlabAlloc {
    /// Attach to the database file at `path` and return its top ref
    /// (0 for a file with no committed data yet).
    pub fn attach_file(&mut self, path: &Path, cfg: AttachConfig) -> Result<Ref> {
        assert!(!self.is_attached(), "allocator is already attached");
        assert!(
            !(cfg.is_shared && cfg.read_only),
            "shared access cannot be read-only"
        );
        assert!(
            cfg.is_shared || !cfg.session_initiator,
            "session initiator implies shared access"
        );
        assert!(
            cfg.session_initiator || !cfg.clear_file,
            "clear_file requires the session initiator"
        );

        let mapping = shared_mapping(path);
        let mut inner = mapping.inner.lock();

        if inner.success {
            // Another allocator in this process already attached and
            // validated the file; adopt its mapping.
            assert!(
                !cfg.session_initiator,
                "session already initiated for '{}'",
                path.display()
            );
            let initial = inner.initial.as_ref().expect("established mapping");
            let initial_len = initial.len() as u64;

            self.data = initial.as_ptr();
            self.initial_chunk_size = initial_len;
            self.baseline = if inner.additional.is_empty() {
                initial_len
            } else {
                self.sections
                    .base_of(inner.first_additional + inner.additional.len())
            };
            self.file_format = inner.file_format;
            self.streaming_form = inner.streaming_form;
            self.attach_mode = AttachMode::File {
                is_shared: cfg.is_shared,
            };
            self.free_space_state = FreeSpaceState::Invalid;
            self.cipher = cfg.cipher;

            // While streaming, the header slot still holds the sentinel;
            // otherwise re-read the live slot to pick up commits.
            let top_ref = if inner.streaming_form {
                inner.top_ref
            } else {
                let header = FileHeader::from_bytes(&initial[..FILE_HEADER_SIZE])?;
                header.top_ref(header.selected_slot())
            };

            drop(inner);
            self.mapping = Some(mapping);
            debug!("fast-path attach of '{}', top ref {:#x}", path.display(), top_ref);
            return Ok(top_ref);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!cfg.read_only)
            .create(!cfg.read_only && !cfg.no_create)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;
        let mut size = metadata.len();

        if size == 0 || cfg.clear_file {
            if cfg.read_only {
                return Err(StorageError::InvalidDatabase {
                    reason: "read-only access to empty database file",
                    path: path.to_path_buf(),
                }
                .into());
            }
            let header = FileHeader::new_empty();
            write_at(&file, 0, header.as_bytes())?;
            if let Some(cipher) = &cfg.cipher {
                cipher.write_barrier(0, FILE_HEADER_SIZE)?;
            }
            // Pre-allocate the initial section so the first mapping has a
            // stable size.
            let initial_size = self.sections.base_of(1);
            file.set_len(initial_size)
                .wrap_err("failed to pre-allocate initial section")?;
            sync_file(&file)?;
            size = initial_size;
        }

        // Validation and footer lookup use the size the writer left
        // behind, not the size after any extension below.
        let initial_size_of_file = size;

        // mmap needs the file size on a section boundary. Observing a
        // misaligned size means either this is a legacy/foreign file (we
        // may extend it if nobody else is writing) or a concurrent commit
        // is mid-extension (we must back off and retry).
        if !self.sections.matches_boundary(size) {
            if cfg.read_only {
                // Cannot extend a read-only file; map it as it is and
                // rely on it not changing underneath us.
            } else if cfg.session_initiator || !cfg.is_shared {
                size = self.sections.upper_boundary(size);
                file.set_len(size)
                    .wrap_err("failed to extend file to a section boundary")?;
            } else {
                return Err(StorageError::Retry.into());
            }
        }

        let map_len = usize::try_from(size).map_err(|_| StorageError::InvalidDatabase {
            reason: "file too large to map",
            path: path.to_path_buf(),
        })?;
        let logical_len = initial_size_of_file as usize;

        // SAFETY: committed bytes below the baseline are never modified
        // in place by any process; the file only grows, and header
        // rewrites go through explicit re-reads of the mapped bytes.
        let map = unsafe { MmapOptions::new().len(map_len).map(&file) }
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        if let Some(cipher) = &cfg.cipher {
            let header_readable = cipher.read_barrier(0, FILE_HEADER_SIZE).is_ok();
            let footer_at = logical_len.saturating_sub(FOOTER_SIZE);
            let footer_readable = cipher.read_barrier(footer_at as u64, FOOTER_SIZE).is_ok();
            if !header_readable || !footer_readable {
                return Err(StorageError::InvalidDatabase {
                    reason: "decryption failed",
                    path: path.to_path_buf(),
                }
                .into());
            }
        }

        let (mut top_ref, mut streaming, file_format) = if cfg.skip_validate {
            decode_top_ref(&map, logical_len)?
        } else {
            validate_buffer(&map, logical_len, path, cfg.is_shared)?
        };

        // A streaming-form file is converted to the double-buffered
        // committed form at session initialization, so that commits can
        // flip between the two header slots from here on.
        if cfg.session_initiator && streaming {
            let header = *FileHeader::from_bytes(&map[..FILE_HEADER_SIZE])?;
            debug_assert_eq!(header.flags(), 0);
            debug_assert_eq!(header.top_ref(1), 0);
            let footer = StreamingFooter::from_bytes(&map[logical_len - FOOTER_SIZE..])?;
            debug_assert!(footer.cookie_ok());

            // Step 1: stage the footer's top ref in slot 1. The select
            // bit still points at slot 0, so the file remains valid
            // streaming form if we crash here.
            let mut updated = header;
            updated.set_top_ref(1, footer.top_ref());
            updated.set_file_format(1, updated.file_format(0));
            write_at(&file, 0, updated.as_bytes())?;
            if let Some(cipher) = &cfg.cipher {
                cipher.write_barrier(0, FILE_HEADER_SIZE)?;
            }
            sync_file(&file)?;

            // Step 2: flip the select bit. From this store on the file is
            // valid committed form.
            updated.set_select_bit();
            write_at(&file, 0, updated.as_bytes())?;
            if let Some(cipher) = &cfg.cipher {
                cipher.write_barrier(0, FILE_HEADER_SIZE)?;
            }
            sync_file(&file)?;

            // Step 3: drop the in-memory streaming flag.
            streaming = false;
            top_ref = footer.top_ref();
            debug!(
                "converted '{}' from streaming to committed form, top ref {:#x}",
                path.display(),
                top_ref
            );
        }

        inner.file = Some(file);
        inner.first_additional = self.sections.index_of(size);
        inner.file_format = file_format;
        inner.streaming_form = streaming;
        inner.top_ref = top_ref;
        self.data = map.as_ptr();
        inner.initial = Some(map);
        inner.success = true;

        self.initial_chunk_size = size;
        self.baseline = size;
        self.attach_mode = AttachMode::File {
            is_shared: cfg.is_shared,
        };
        // Force the first write transaction to rebuild free-space
        // tracking from the slab list.
        self.free_space_state = FreeSpaceState::Invalid;
        self.file_format = file_format;
        self.streaming_form = streaming;
        self.cipher = cfg.cipher;

        drop(inner);
        self.mapping = Some(mapping);

        debug!(
            "attached '{}': size {:#x}, top ref {:#x}, format {}",
            path.display(),
            size,
            top_ref,
            file_format
        );
        Ok(top_ref)
    }

    /// Attach to an owned in-memory image of a database file. Everything
    /// in the buffer is read-only; mutations copy-on-write into slabs.
    pub fn attach_buffer(&mut self, buffer: Box<[u8]>) -> Result<Ref> {
        assert!(!self.is_attached(), "allocator is already attached");

        let path = Path::new("<buffer>");
        let (top_ref, streaming, file_format) =
            validate_buffer(&buffer, buffer.len(), path, false)?;

        self.data = buffer.as_ptr();
        self.initial_chunk_size = buffer.len() as u64;
        self.baseline = buffer.len() as u64;
        self.owned_buffer = Some(buffer);
        self.attach_mode = AttachMode::Buffer;
        self.file_format = file_format;
        self.streaming_form = streaming;
        Ok(top_ref)
    }

    /// Attach to nothing: a fresh in-memory database where every node
    /// lives in a slab. No ref may ever be smaller than the header a file
    /// would carry, so that is the baseline.
    pub fn attach_empty(&mut self) {
        assert!(!self.is_attached(), "allocator is already attached");

        self.attach_mode = AttachMode::Empty;
        self.data = std::ptr::null();
        self.file_format = 0;
        self.baseline = FILE_HEADER_SIZE as u64;
        self.initial_chunk_size = self.baseline;
    }

    /// Release the attachment and every slab, returning to the detached
    /// state.
    pub fn detach(&mut self) {
        self.invalidate_cache();
        self.mapping = None;
        self.owned_buffer = None;
        self.data = std::ptr::null();
        self.slabs.clear();
        self.free_space.clear();
        self.free_read_only.clear();
        self.free_space_state = FreeSpaceState::Clean;
        self.baseline = 0;
        self.initial_chunk_size = 0;
        self.file_format = 0;
        self.streaming_form = false;
        self.cipher = None;
        self.attach_mode = AttachMode::Unattached;
    }

    /// Grow the backing file to `new_size` bytes, synced. The caller is
    /// about to `remap`.
    pub fn resize_file(&mut self, new_size: u64) -> Result<()> {
        let mapping = self.mapping.as_ref().expect("no file attached");
        let inner = mapping.inner.lock();
        let file = inner.file.as_ref().expect("no file attached");
        file.set_len(new_size)
            .wrap_err_with(|| format!("failed to grow file to {} bytes", new_size))?;
        sync_file(file)
    }

    /// Hint the filesystem to reserve `size` bytes without changing the
    /// logical file size semantics the allocator relies on.
    pub fn reserve_disk_space(&mut self, size: u64) -> Result<()> {
        let mapping = self.mapping.as_ref().expect("no file attached");
        let inner = mapping.inner.lock();
        let file = inner.file.as_ref().expect("no file attached");
        if file.metadata().map(|m| m.len() < size).unwrap_or(false) {
            file.set_len(size)
                .wrap_err_with(|| format!("failed to reserve {} bytes", size))?;
        }
        sync_file(file)
    }
}

/// Decode the live top ref without validating, for `skip_validate`
/// attaches. Returns `(top_ref, streaming_form, file_format)`.
fn decode_top_ref(data: &[u8], logical_size: usize) -> Result<(Ref, bool, u8)> {
    let header = FileHeader::from_bytes(data)?;
    let slot = header.selected_slot();
    if header.is_streaming() {
        let footer = StreamingFooter::from_bytes(&data[logical_size - FOOTER_SIZE..])?;
        Ok((footer.top_ref(), true, header.file_format(0)))
    } else {
        Ok((header.top_ref(slot), false, header.file_format(slot)))
    }
}

/// Full structural validation of a database image. `logical_size` is the
/// size the writer produced (before any boundary extension); the footer
/// of a streaming-form file sits at its end.
pub(crate) fn validate_buffer(
    data: &[u8],
    logical_size: usize,
    path: &Path,
    is_shared: bool,
) -> Result<(Ref, bool, u8)> {
    let fail = |reason: &'static str| StorageError::InvalidDatabase {
        reason,
        path: path.to_path_buf(),
    };

    if logical_size < FILE_HEADER_SIZE || logical_size % 8 != 0 {
        return Err(fail("file has bad size").into());
    }

    let header = FileHeader::from_bytes(data)?;
    if !header.magic_ok() {
        return Err(fail("not a database file (bad magic)").into());
    }

    let slot = header.selected_slot();
    let mut top_ref = header.top_ref(slot);
    let streaming = header.is_streaming();
    if streaming {
        if logical_size < FILE_HEADER_SIZE + FOOTER_SIZE {
            return Err(fail("streaming form file has bad size").into());
        }
        let footer = StreamingFooter::from_bytes(&data[logical_size - FOOTER_SIZE..])?;
        if !footer.cookie_ok() {
            return Err(fail("bad streaming footer cookie").into());
        }
        top_ref = footer.top_ref();
    }

    if top_ref % 8 != 0 {
        return Err(fail("top ref is not 8-byte aligned").into());
    }
    if top_ref >= logical_size as u64 {
        return Err(fail("top ref out of bounds").into());
    }

    let version = header.file_format(slot);
    if !file_format_supported(version, is_shared, top_ref) {
        return Err(fail("unsupported file format version").into());
    }

    Ok((top_ref, streaming, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_empty_baseline_is_the_header_size() {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        assert!(alloc.is_attached());
        assert_eq!(alloc.baseline(), FILE_HEADER_SIZE as u64);
        assert_eq!(alloc.total_size(), FILE_HEADER_SIZE as u64);
    }

    #[test]
    fn detach_resets_everything() {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();
        alloc.alloc(64).unwrap();

        alloc.detach();

        assert!(!alloc.is_attached());
        assert_eq!(alloc.baseline(), 0);
        assert_eq!(alloc.total_size(), 0);

        // reattachable afterwards
        alloc.attach_empty();
        alloc.alloc(64).unwrap();
    }

    #[test]
    #[should_panic(expected = "shared access cannot be read-only")]
    fn shared_read_only_is_rejected() {
        let mut alloc = SlabAlloc::new();
        let cfg = AttachConfig {
            read_only: true,
            is_shared: true,
            ..Default::default()
        };
        let _ = alloc.attach_file(Path::new("/nonexistent"), cfg);
    }

    #[test]
    #[should_panic(expected = "session initiator implies shared access")]
    fn unshared_initiator_is_rejected() {
        let mut alloc = SlabAlloc::new();
        let cfg = AttachConfig {
            session_initiator: true,
            ..Default::default()
        };
        let _ = alloc.attach_file(Path::new("/nonexistent"), cfg);
    }

    #[test]
    fn buffer_attach_rejects_garbage() {
        let mut alloc = SlabAlloc::new();
        let err = alloc
            .attach_buffer(vec![0xAB; 64].into_boxed_slice())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::InvalidDatabase { .. })
        ));
        assert!(!alloc.is_attached());
    }
}
