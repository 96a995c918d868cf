//! # Encryption Barrier Interface
//!
//! The engine never encrypts anything itself; it exposes the two hooks an
//! encryption layer needs. When a cipher is installed on an attach, the
//! mapping layer brackets access to freshly mapped or rewritten regions
//! with these barriers. With no cipher installed every access is direct.
//!
//! A `read_barrier` failure during attach is reported to the caller as
//! `InvalidDatabase` (the file is unreadable, whatever the cause).

use std::fmt;

use eyre::Result;

/// Capability installed by an encryption layer.
///
/// `offset`/`len` describe a byte range of the attached file. The cipher
/// must make that range readable (resp. durable) before the call returns.
pub trait Cipher: Send + Sync + fmt::Debug {
    /// Decrypt `len` bytes at `offset` ahead of a read from the mapped
    /// region.
    fn read_barrier(&self, offset: u64, len: usize) -> Result<()>;

    /// Encrypt `len` bytes at `offset` after a write to the file, before
    /// it is synced.
    fn write_barrier(&self, offset: u64, len: usize) -> Result<()>;
}
