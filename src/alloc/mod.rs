//! # Allocator Layer
//!
//! The two-region allocation model every persistent structure sits on:
//! a read-only memory-mapped file below the `baseline` and writable
//! in-memory slabs above it, presented as one flat space of 8-byte-aligned
//! refs.
//!
//! - `slab`: the [`SlabAlloc`] core: allocation, free lists, the
//!   translate cache, remapping.
//! - `attach`: binding an allocator to a file, buffer, or nothing, and
//!   the streaming→committed durability handshake.
//! - `section`: the exponential section staircase the file is mapped in.
//!
//! ## Contract
//!
//! The column/cluster layer consumes the allocator exclusively through
//! the [`Allocator`] trait: sized allocation in ref space, ref
//! translation, and the read-only query that drives copy-on-write.

use eyre::Result;

mod attach;
mod section;
mod slab;

pub use self::attach::AttachConfig;
pub use self::slab::{Chunk, FreeSpaceState, Ref, SlabAlloc};

/// The narrow allocator contract consumed by the layers above.
///
/// Sizes are positive multiples of 8. `translate` is cheap enough to call
/// per access; addresses must be re-derived after any call that may
/// reallocate or remap.
pub trait Allocator {
    fn alloc(&mut self, size: usize) -> Result<Ref>;
    fn realloc(&mut self, r: Ref, old_size: usize, new_size: usize) -> Result<Ref>;
    fn free(&mut self, r: Ref);
    fn translate(&self, r: Ref) -> *const u8;
    fn is_read_only(&self, r: Ref) -> bool;
}

impl Allocator for SlabAlloc {
    fn alloc(&mut self, size: usize) -> Result<Ref> {
        SlabAlloc::alloc(self, size)
    }

    fn realloc(&mut self, r: Ref, old_size: usize, new_size: usize) -> Result<Ref> {
        SlabAlloc::realloc(self, r, old_size, new_size)
    }

    fn free(&mut self, r: Ref) {
        SlabAlloc::free(self, r)
    }

    fn translate(&self, r: Ref) -> *const u8 {
        SlabAlloc::translate(self, r)
    }

    fn is_read_only(&self, r: Ref) -> bool {
        SlabAlloc::is_read_only(self, r)
    }
}
