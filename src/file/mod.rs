//! # File Layer
//!
//! On-disk records and shared mappings for the single database file.
//!
//! - `header`: the 24-byte double-buffered file header and the 16-byte
//!   streaming footer, bit-exact.
//! - `mapping`: the process-wide `MappedFile` registry and the per-file
//!   mapping record the slab allocator resolves refs through.
//!
//! The attach protocol that ties the two together lives in
//! [`crate::alloc::attach`].

mod header;
mod mapping;

pub use self::header::{
    file_format_supported, FileHeader, StreamingFooter, FILE_HEADER_SIZE, FILE_MAGIC,
    FLAGS_SELECT_BIT, FOOTER_COOKIE, FOOTER_SIZE, STREAMING_SENTINEL,
};
pub(crate) use self::mapping::{page_size, shared_mapping, sync_file, write_at, MappedFile};
