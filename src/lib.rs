//! # PackDB Core Storage Engine
//!
//! PackDB is the storage core of an embedded, single-file object
//! database. It stores a graph of columnar structures inside one
//! memory-mapped file using a single on-disk primitive, the bit-packed
//! integer array node, and a two-region allocator that makes committed
//! file bytes and in-flight transaction memory look like one flat
//! address space.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   column / cluster layer (external)          │
//! ├──────────────────────────────────────────────┤
//! │   array: packed nodes, COW, parent linkage   │
//! ├──────────────────────────────────────────────┤
//! │   alloc: SlabAlloc: refs, free lists,        │
//! │          translate cache, attach protocol    │
//! ├──────────────────────────────────────────────┤
//! │   file: header/footer records, shared mmaps  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## The ref space
//!
//! Everything is addressed by **refs**: 8-byte-aligned offsets into a
//! flat space. Refs below the allocator's `baseline` point into the
//! memory-mapped file and are strictly read-only; refs above it point
//! into writable in-memory slabs. A write transaction mutates nodes
//! copy-on-write into slab memory, new refs bubble up to the root
//! through parent links, and a commit (performed by a higher layer)
//! materializes the new tree into the file and flips the header's select
//! bit.
//!
//! ## Durability handshake
//!
//! The file header carries **two** top refs and a select bit choosing
//! the live one, so a commit is one atomic byte store after the inactive
//! slot is synced. Files produced by one-pass writers instead carry
//! their top ref in a trailing footer ("streaming form"); the first
//! session initiator converts them to the double-buffered form on
//! attach. See [`alloc::AttachConfig`].
//!
//! ## Concurrency model
//!
//! Single writer, many readers. One `SlabAlloc` (and any node pool over
//! it) belongs to one thread at a time; concurrent readers each attach
//! their own allocator, sharing the underlying file mapping through a
//! process-wide registry.
//!
//! ## Quick start
//!
//! ```ignore
//! use packdb::{AttachConfig, NodeKind, NodePool, SlabAlloc};
//!
//! let mut alloc = SlabAlloc::new();
//! let top_ref = alloc.attach_file("data.pdb".as_ref(), AttachConfig::default())?;
//! alloc.reset_free_space_tracking()?;
//!
//! let mut pool = NodePool::new(&mut alloc);
//! let list = pool.create_empty(NodeKind::Normal)?;
//! pool.add(list, 42)?;
//! assert_eq!(pool.get(list, 0), 42);
//! ```

pub mod alloc;
pub mod array;
pub mod encryption;
pub mod error;
pub mod file;

pub use self::alloc::{Allocator, AttachConfig, Chunk, FreeSpaceState, Ref, SlabAlloc};
pub use self::array::{bit_width, NodeId, NodeKind, NodePool, Slot, Width};
pub use self::encryption::Cipher;
pub use self::error::StorageError;
pub use self::file::{FileHeader, StreamingFooter, FILE_HEADER_SIZE, FOOTER_COOKIE, FOOTER_SIZE};
