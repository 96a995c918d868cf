//! # Slab Allocator
//!
//! `SlabAlloc` serves 8-byte-aligned allocations out of a single flat ref
//! space that spans two regions:
//!
//! ```text
//! ref 0 ──────────────── baseline ─────────────────────────▶
//! |   mmap'd file (read-only)   |  slab  |  slab  |  slab  |
//! ```
//!
//! Refs below `baseline` resolve into the mapped file and are immutable
//! for the lifetime of the attachment; refs at or above it resolve into
//! zero-initialized in-memory slabs that double in size as they are
//! appended. Callers never learn which region a ref targets; mutation
//! paths ask `is_read_only` and copy-on-write across the boundary.
//!
//! ## Free space tracking
//!
//! Two free lists: `free_space` for slab memory (reusable immediately)
//! and `free_read_only` for file memory replaced within the current
//! snapshot (reclaimable only at commit). Freed chunks coalesce with both
//! neighbours, but never across a slab boundary: a coalesced chunk must
//! stay contiguous in *memory*, not just in ref space.
//!
//! The tracking runs a three-state machine:
//!
//! ```text
//! Clean ──alloc/free──▶ Dirty ──reset──▶ Clean
//!                         │
//!                   record failure
//!                         ▼
//!                      Invalid   (allocations fail until reset)
//! ```
//!
//! `Clean` means the free list covers exactly the union of all slabs,
//! which is the precondition for `remap` re-basing slabs after the file
//! grew under them.
//!
//! ## Translation
//!
//! `translate(ref)` is the hot path of every node access, so it runs
//! through a 256-slot direct-mapped cache keyed by a fold of the ref.
//! Any change to the mapping geometry bumps `version`, which invalidates
//! every cached slot at once.
//!
//! ## Thread model
//!
//! One `SlabAlloc` is used by one thread at a time (concurrent readers
//! each hold their own instance), so the cache uses plain `Cell`s. The
//! only cross-thread state is the shared `MappedFile`, guarded by its own
//! mutex.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use tracing::trace;

use super::section::SectionTable;
use crate::array::header as node_header;
use crate::encryption::Cipher;
use crate::error::StorageError;
use crate::file::{page_size, MappedFile};

/// Offset into the flat ref space. Always a multiple of 8; 0 is the null
/// ref.
pub type Ref = u64;

const TRANSLATE_CACHE_SLOTS: usize = 256;

/// Synchronization state of the free lists against the logical file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpaceState {
    /// Free list equals the union of complete slabs; `remap` is safe.
    Clean,
    /// Allocations have been served since the last reset.
    Dirty,
    /// A free-list mutation failed; allocations fail until reset.
    Invalid,
}

/// A contiguous free range in ref space. Never crosses a slab boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: Ref,
    pub size: usize,
}

#[derive(Debug)]
pub(crate) struct Slab {
    /// One past the last ref covered by this slab.
    pub ref_end: Ref,
    pub mem: Box<[u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachMode {
    Unattached,
    /// No backing storage at all; every ref lives in a slab.
    Empty,
    /// An owned in-memory image of a database file.
    Buffer,
    File {
        is_shared: bool,
    },
}

#[derive(Clone, Copy)]
struct CacheSlot {
    target: Ref,
    version: u64,
    addr: *const u8,
}

const EMPTY_CACHE_SLOT: Cell<CacheSlot> = Cell::new(CacheSlot {
    target: 0,
    version: 0,
    addr: std::ptr::null(),
});

pub struct SlabAlloc {
    pub(crate) attach_mode: AttachMode,
    pub(crate) mapping: Option<Arc<MappedFile>>,
    pub(crate) owned_buffer: Option<Box<[u8]>>,
    /// Base address of the initial mapping or buffer; null when `Empty`.
    pub(crate) data: *const u8,
    /// Size of the initial contiguous mapping. Refs below this translate
    /// without a lock.
    pub(crate) initial_chunk_size: u64,
    pub(crate) baseline: Ref,
    pub(crate) slabs: Vec<Slab>,
    pub(crate) free_space: Vec<Chunk>,
    pub(crate) free_read_only: Vec<Chunk>,
    pub(crate) free_space_state: FreeSpaceState,
    pub(crate) sections: SectionTable,
    pub(crate) file_format: u8,
    pub(crate) streaming_form: bool,
    pub(crate) cipher: Option<Arc<dyn Cipher>>,
    version: u64,
    cache: [Cell<CacheSlot>; TRANSLATE_CACHE_SLOTS],
}

// SAFETY: the raw pointers point into memory owned by `owned_buffer`, the
// slabs, or the Arc-shared `MappedFile`, all of which move with the
// allocator. The translate cache is thread-local state. A SlabAlloc is
// used by one thread at a time (it is intentionally !Sync).
unsafe impl Send for SlabAlloc {}

impl SlabAlloc {
    pub fn new() -> Self {
        Self {
            attach_mode: AttachMode::Unattached,
            mapping: None,
            owned_buffer: None,
            data: std::ptr::null(),
            initial_chunk_size: 0,
            baseline: 0,
            slabs: Vec::new(),
            free_space: Vec::new(),
            free_read_only: Vec::new(),
            free_space_state: FreeSpaceState::Clean,
            sections: SectionTable::new(page_size()),
            file_format: 0,
            streaming_form: false,
            cipher: None,
            version: 1,
            cache: [EMPTY_CACHE_SLOT; TRANSLATE_CACHE_SLOTS],
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attach_mode != AttachMode::Unattached
    }

    /// First ref that lies in a slab rather than the mapped file.
    pub fn baseline(&self) -> Ref {
        self.baseline
    }

    /// End of the ref continuum: the last slab's end, or the baseline when
    /// no slab exists yet.
    pub fn total_size(&self) -> Ref {
        self.slabs.last().map_or(self.baseline, |s| s.ref_end)
    }

    pub fn file_format_version(&self) -> u8 {
        self.file_format
    }

    pub fn free_space_state(&self) -> FreeSpaceState {
        self.free_space_state
    }

    /// Refs below the baseline target committed file memory, which no
    /// mutation path may touch in place.
    pub fn is_read_only(&self, r: Ref) -> bool {
        r < self.baseline
    }

    /// Resolve a ref to an address. Expected O(1) through the cache.
    pub fn translate(&self, r: Ref) -> *const u8 {
        debug_assert!(self.is_attached());
        let index = cache_index(r);
        let slot = self.cache[index].get();
        if slot.target == r && slot.version == self.version {
            return slot.addr;
        }

        let addr = self.translate_slow(r);
        self.cache[index].set(CacheSlot {
            target: r,
            version: self.version,
            addr,
        });
        addr
    }

    fn translate_slow(&self, r: Ref) -> *const u8 {
        if r < self.initial_chunk_size {
            // The initial mapping is immutable once established, no lock
            // needed.
            // SAFETY: r is within the initial mapping/buffer, whose base
            // is `data` and whose length is `initial_chunk_size`.
            unsafe { self.data.add(r as usize) }
        } else if r < self.baseline {
            let section = self.sections.index_of(r);
            let offset = r - self.sections.base_of(section);
            let mapping = self
                .mapping
                .as_ref()
                .expect("ref below baseline without an attached file");
            // Additional mappings are appended under the per-file mutex;
            // hold it just long enough to fetch the section base. The
            // mapping itself is never unmapped while the record lives, so
            // the address stays valid after unlock.
            let inner = mapping.inner.lock();
            let map = &inner.additional[section - inner.first_additional];
            // SAFETY: `offset` is within this section's mapping, which
            // covers the whole section.
            unsafe { map.as_ptr().add(offset as usize) }
        } else {
            let index = self.slabs.partition_point(|s| s.ref_end <= r);
            assert!(index < self.slabs.len(), "ref {:#x} past end of slabs", r);
            let slab_start = if index == 0 {
                self.baseline
            } else {
                self.slabs[index - 1].ref_end
            };
            // SAFETY: slab covers [slab_start, ref_end), and r is within
            // it by the partition_point above.
            unsafe { self.slabs[index].mem.as_ptr().add((r - slab_start) as usize) }
        }
    }

    /// Borrow `len` bytes at `r`.
    pub fn bytes(&self, r: Ref, len: usize) -> &[u8] {
        // SAFETY: translate returns a pointer into one of the allocator's
        // regions, each of which holds at least the block that `r` heads;
        // callers size `len` from the block's own header or capacity. The
        // borrow of self prevents remapping or reallocation while the
        // slice lives.
        unsafe { std::slice::from_raw_parts(self.translate(r), len) }
    }

    /// Mutably borrow `len` bytes at `r`. Only slab memory is writable.
    pub fn bytes_mut(&mut self, r: Ref, len: usize) -> &mut [u8] {
        debug_assert!(
            !self.is_read_only(r),
            "attempted in-place write to committed ref {:#x}",
            r
        );
        // SAFETY: as `bytes`, plus: the ref is above baseline, so the
        // bytes live in a slab owned by self, and &mut self gives
        // exclusive access to them.
        unsafe { std::slice::from_raw_parts_mut(self.translate(r) as *mut u8, len) }
    }

    /// Copy `len` bytes from the block at `src` to the block at `dst`.
    /// Used by copy-on-write; the destination must be slab memory.
    pub fn copy_block(&mut self, src: Ref, dst: Ref, len: usize) {
        debug_assert!(!self.is_read_only(dst));
        debug_assert!(src != dst);
        // SAFETY: both refs head distinct allocated blocks of at least
        // `len` bytes (the caller allocated `dst` with size >= len), so
        // the ranges cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.translate(src), self.translate(dst) as *mut u8, len);
        }
    }

    /// Allocate `size` bytes (positive, multiple of 8) and return the new
    /// block's ref.
    pub fn alloc(&mut self, size: usize) -> Result<Ref> {
        debug_assert!(self.is_attached());
        debug_assert!(size > 0, "allocation size must be positive");
        debug_assert!(size % 8 == 0, "allocation size {} not 8-byte aligned", size);

        // Once the free-space record is lost, nothing may be carved out of
        // it until the tracking is rebuilt.
        if self.free_space_state == FreeSpaceState::Invalid {
            return Err(StorageError::InvalidFreeSpace.into());
        }
        self.free_space_state = FreeSpaceState::Dirty;

        // Reuse free space, scanning from the most recently pushed end.
        for i in (0..self.free_space.len()).rev() {
            if self.free_space[i].size >= size {
                let r = self.free_space[i].start;
                let rest = self.free_space[i].size - size;
                if rest == 0 {
                    self.free_space.swap_remove(i);
                } else {
                    self.free_space[i].start += size as u64;
                    self.free_space[i].size = rest;
                }
                trace!("alloc ref {:#x} size {} (reused)", r, size);
                return Ok(r);
            }
        }

        // No fit: open a new slab, at least twice the previous one.
        let mut new_size = ((size - 1) | 255) + 1;
        let r = match self.slabs.last() {
            None => self.baseline,
            Some(last) => {
                let prev_end = if self.slabs.len() == 1 {
                    self.baseline
                } else {
                    self.slabs[self.slabs.len() - 2].ref_end
                };
                let min_size = 2 * (last.ref_end - prev_end) as usize;
                if new_size < min_size {
                    new_size = min_size;
                }
                last.ref_end
            }
        };

        if self.slabs.try_reserve(1).is_err() || self.free_space.try_reserve(1).is_err() {
            self.free_space_state = FreeSpaceState::Invalid;
            return Err(StorageError::InvalidFreeSpace.into());
        }

        let mem = vec![0u8; new_size].into_boxed_slice();
        self.slabs.push(Slab {
            ref_end: r + new_size as u64,
            mem,
        });

        let unused = new_size - size;
        if unused > 0 {
            self.free_space.push(Chunk {
                start: r + size as u64,
                size: unused,
            });
        }

        trace!("alloc ref {:#x} size {} (new slab of {})", r, size, new_size);
        Ok(r)
    }

    /// Return the block at `r` to the free pool. The block's size is read
    /// from its node header: occupied byte size for committed blocks,
    /// full capacity for slab blocks.
    pub fn free(&mut self, r: Ref) {
        let read_only = self.is_read_only(r);

        let mut header = [0u8; node_header::NODE_HEADER_SIZE];
        header.copy_from_slice(self.bytes(r, node_header::NODE_HEADER_SIZE));
        let size = if read_only {
            node_header::byte_size(&header)
        } else {
            node_header::capacity(&header)
        };

        trace!("free ref {:#x} size {}", r, size);

        if self.free_space_state == FreeSpaceState::Invalid {
            return;
        }
        // Slab memory can only be freed after having been allocated, and
        // any allocation dirties the tracking.
        debug_assert!(read_only || self.free_space_state == FreeSpaceState::Dirty);
        self.free_space_state = FreeSpaceState::Dirty;

        let ref_end = r + size as u64;
        let slabs = &self.slabs;
        let list = if read_only {
            &mut self.free_read_only
        } else {
            &mut self.free_space
        };

        // Merge with the succeeding free chunk, unless that would fuse
        // across a slab boundary.
        let mut merged_with = None;
        if let Some(i) = list.iter().position(|c| c.start == ref_end) {
            if !slabs.iter().any(|s| s.ref_end == ref_end) {
                list[i].start = r;
                list[i].size += size;
                merged_with = Some(i);
            }
        }

        // Merge with the preceding free chunk under the same rule.
        if !slabs.iter().any(|s| s.ref_end == r) {
            if let Some(i) = list
                .iter()
                .position(|c| c.start + c.size as u64 == r)
            {
                if let Some(j) = merged_with {
                    list[i].size += list[j].size;
                    list.swap_remove(j);
                } else {
                    list[i].size += size;
                }
                return;
            }
        }

        if merged_with.is_none() {
            if list.try_reserve(1).is_err() {
                self.free_space_state = FreeSpaceState::Invalid;
                return;
            }
            list.push(Chunk { start: r, size });
        }
    }

    /// Move the block at `r` to a new block of `new_size` bytes, copying
    /// `old_size` bytes of content.
    pub fn realloc(&mut self, r: Ref, old_size: usize, new_size: usize) -> Result<Ref> {
        debug_assert!(new_size > 0 && new_size % 8 == 0);

        let new_ref = self.alloc(new_size)?;
        self.copy_block(r, new_ref, old_size.min(new_size));
        self.free(r);

        trace!(
            "realloc ref {:#x} -> {:#x} ({} -> {} bytes)",
            r,
            new_ref,
            old_size,
            new_size
        );
        Ok(new_ref)
    }

    /// Read-only free chunks accumulated in this snapshot, for the commit
    /// layer to reclaim.
    pub fn free_read_only(&self) -> Result<&[Chunk]> {
        if self.free_space_state == FreeSpaceState::Invalid {
            return Err(StorageError::InvalidFreeSpace.into());
        }
        Ok(&self.free_read_only)
    }

    /// Rebuild the free list as exactly one chunk per slab, restoring the
    /// "all slab memory is free" invariant. Called at the start of a write
    /// transaction.
    pub fn reset_free_space_tracking(&mut self) -> Result<()> {
        self.invalidate_cache();
        if self.free_space_state == FreeSpaceState::Clean {
            return Ok(());
        }

        self.free_read_only.clear();
        self.free_space.clear();
        if self.free_space.try_reserve(self.slabs.len()).is_err() {
            self.free_space_state = FreeSpaceState::Invalid;
            return Err(StorageError::InvalidFreeSpace.into());
        }

        let mut start = self.baseline;
        for slab in &self.slabs {
            self.free_space.push(Chunk {
                start,
                size: (slab.ref_end - start) as usize,
            });
            start = slab.ref_end;
        }

        debug_assert!(self.is_all_free());
        self.free_space_state = FreeSpaceState::Clean;
        Ok(())
    }

    /// Extend the mapping to a grown file and shift every slab upward in
    /// ref space: the baseline moved, so slab refs move with it. Requires
    /// clean free-space tracking (exactly one free chunk per slab).
    pub fn remap(&mut self, file_size: u64) -> Result<()> {
        debug_assert!(file_size % 8 == 0);
        debug_assert!(matches!(self.attach_mode, AttachMode::File { .. }));
        debug_assert!(self.baseline <= file_size);
        ensure!(
            self.free_space_state == FreeSpaceState::Clean,
            "remap requires clean free-space tracking"
        );
        ensure!(
            self.sections.matches_boundary(file_size),
            "remap size {:#x} is not on a section boundary",
            file_size
        );

        let mapping = self
            .mapping
            .clone()
            .expect("remap without an attached file");
        {
            let mut inner = mapping.inner.lock();
            let section_count = self.sections.index_of(file_size);
            debug_assert!(section_count >= inner.first_additional);
            let wanted = section_count - inner.first_additional;

            while inner.additional.len() < wanted {
                let section = inner.first_additional + inner.additional.len();
                let base = self.sections.base_of(section);
                let len = (self.sections.base_of(section + 1) - base) as usize;
                let file = inner.file.as_ref().expect("remap of a file-less mapping");
                // SAFETY: the section lies within the grown file, and
                // committed bytes are never modified in place (see module
                // docs of file::mapping).
                let map = unsafe {
                    memmap2::MmapOptions::new()
                        .offset(base)
                        .len(len)
                        .map(file)
                }
                .wrap_err_with(|| format!("failed to map section {}", section))?;
                inner.additional.push(map);
            }
        }

        trace!("remap to {:#x}, baseline {:#x}", file_size, self.baseline);

        self.baseline = file_size;
        self.invalidate_cache();

        // Re-seat slabs and their (1:1, clean) free chunks above the new
        // baseline.
        debug_assert_eq!(self.free_space.len(), self.slabs.len());
        let mut start = file_size;
        for (slab, chunk) in self.slabs.iter_mut().zip(self.free_space.iter_mut()) {
            chunk.start = start;
            let end = start + chunk.size as u64;
            slab.ref_end = end;
            start = end;
        }
        Ok(())
    }

    pub(crate) fn invalidate_cache(&mut self) {
        self.version += 1;
    }

    /// Whether the free list covers exactly the union of all slabs.
    pub fn is_all_free(&self) -> bool {
        if self.free_space.len() != self.slabs.len() {
            return false;
        }
        let mut slab_start = self.baseline;
        for slab in &self.slabs {
            let size = (slab.ref_end - slab_start) as usize;
            match self.free_space.iter().find(|c| c.start == slab_start) {
                Some(chunk) if chunk.size == size => {}
                _ => return false,
            }
            slab_start = slab.ref_end;
        }
        true
    }

    /// Check that every free chunk lies entirely inside one slab.
    pub fn verify(&self) {
        for chunk in &self.free_space {
            let index = self.slabs.partition_point(|s| s.ref_end <= chunk.start);
            assert!(index < self.slabs.len(), "free chunk outside any slab");
            let chunk_end = chunk.start + chunk.size as u64;
            assert!(
                chunk_end <= self.slabs[index].ref_end,
                "free chunk {:#x}+{} crosses slab boundary {:#x}",
                chunk.start,
                chunk.size,
                self.slabs[index].ref_end
            );
        }
    }
}

impl Default for SlabAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SlabAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabAlloc")
            .field("attach_mode", &self.attach_mode)
            .field("baseline", &self.baseline)
            .field("initial_chunk_size", &self.initial_chunk_size)
            .field("slabs", &self.slabs.len())
            .field("free_space", &self.free_space)
            .field("free_read_only", &self.free_read_only)
            .field("free_space_state", &self.free_space_state)
            .finish_non_exhaustive()
    }
}

/// Fold a ref into the direct-mapped cache index.
fn cache_index(r: Ref) -> usize {
    let mut h = r ^ (r >> 32);
    h ^= h >> 16;
    h ^= h >> 8;
    (h & 0xFF) as usize
}
