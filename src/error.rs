//! # Storage Error Kinds
//!
//! Low-level storage failures carry a typed kind so that callers can react
//! to specific conditions: the attach retry race must be distinguishable
//! from a corrupt file, and a poisoned free list must abort the enclosing
//! transaction rather than surface as a generic I/O failure.
//!
//! All fallible APIs in this crate return `eyre::Result`; a `StorageError`
//! travels inside the `eyre::Report` and is recovered with
//! `report.downcast_ref::<StorageError>()`:
//!
//! ```ignore
//! loop {
//!     match alloc.attach_file(&path, cfg.clone()) {
//!         Ok(top_ref) => break top_ref,
//!         Err(report) if matches!(
//!             report.downcast_ref::<StorageError>(),
//!             Some(StorageError::Retry)
//!         ) => continue,
//!         Err(report) => return Err(report),
//!     }
//! }
//! ```
//!
//! ## Recovery policy
//!
//! - `InvalidDatabase` is not recoverable; close and report.
//! - `Retry` means a non-initiator observed an in-progress file extension;
//!   the caller simply attaches again.
//! - `InvalidFreeSpace` poisons the allocator until
//!   `reset_free_space_tracking` restores the free-list invariants; the
//!   enclosing transaction must be abandoned.
//! - `OutOfRange` is caller misuse surfaced without any state change.

use std::path::PathBuf;

use thiserror::Error;

/// Tagged error kinds raised by the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Header or footer validation failed while attaching a database.
    #[error("invalid database: {reason} ('{}')", .path.display())]
    InvalidDatabase {
        reason: &'static str,
        path: PathBuf,
    },

    /// A non-initiator observed a file size that is not on a section
    /// boundary (a concurrent commit is extending the file). Attach again.
    #[error("database file is being extended concurrently, retry attach")]
    Retry,

    /// Free-space bookkeeping was lost (a record insertion failed).
    /// Allocations fail until free-space tracking is reset.
    #[error("free space tracking was lost due to out-of-memory")]
    InvalidFreeSpace,

    /// The encryption read barrier could not decrypt a page. Reported to
    /// attach callers as `InvalidDatabase`.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Index past the end of a node.
    #[error("index {index} out of range (length {len})")]
    OutOfRange { index: usize, len: usize },
}
