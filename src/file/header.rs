//! # Database File Header and Streaming Footer
//!
//! Every database file begins with a 24-byte header holding two alternative
//! top refs. Bit 0 of `flags` (the select bit) chooses which slot is live;
//! committing flips the bit after the inactive slot has been written and
//! synced, which makes the commit a single atomic byte store.
//!
//! ## Header layout (24 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------
//! 0       8     top_ref[0]
//! 8       8     top_ref[1]
//! 16      4     magic: 'T' '-' 'D' 'B'
//! 20      1     file_format[0]
//! 21      1     file_format[1]
//! 22      1     reserved (must be 0)
//! 23      1     flags (bit 0 = select bit)
//! ```
//!
//! ## Streaming form
//!
//! A file produced by a one-pass writer cannot know its top ref until the
//! end, so it writes `top_ref[0] = 0xFFFF_FFFF_FFFF_FFFF` up front and
//! appends a 16-byte footer `{ top_ref, magic_cookie }` as the last thing
//! in the file. The first session initiator to attach such a file copies
//! the footer's top ref into slot 1 and flips the select bit (see
//! `alloc::attach`), after which the footer bytes are dead data.
//!
//! ## Zerocopy
//!
//! Both records derive the zerocopy traits so they can be read in place
//! from the mapped file without copying; multi-byte fields use
//! `little_endian::U64` wrappers.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Magic bytes at offset 16 of every database file.
pub const FILE_MAGIC: [u8; 4] = *b"T-DB";

pub const FILE_HEADER_SIZE: usize = 24;
pub const FOOTER_SIZE: usize = 16;

/// Cookie closing a streaming-form file.
pub const FOOTER_COOKIE: u64 = u64::from_le_bytes(*b"pdbfootr");

/// Sentinel in `top_ref[0]` marking a file as streaming form.
pub const STREAMING_SENTINEL: u64 = u64::MAX;

/// Bit 0 of `flags`: selects the live `top_ref`/`file_format` slot.
pub const FLAGS_SELECT_BIT: u8 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    top_ref: [U64; 2],
    magic: [u8; 4],
    file_format: [u8; 2],
    reserved: u8,
    flags: u8,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    /// Header of a freshly created, still empty database file. The file
    /// format is undecided (0) until the first commit.
    pub fn new_empty() -> Self {
        Self {
            top_ref: [U64::new(0), U64::new(0)],
            magic: FILE_MAGIC,
            file_format: [0, 0],
            reserved: 0,
            flags: 0,
        }
    }

    /// Header opening a streaming-form file: the real top ref lives in the
    /// trailing [`StreamingFooter`].
    pub fn streaming(file_format: u8) -> Self {
        Self {
            top_ref: [U64::new(STREAMING_SENTINEL), U64::new(0)],
            magic: FILE_MAGIC,
            file_format: [file_format, 0],
            reserved: 0,
            flags: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))
    }

    pub fn magic_ok(&self) -> bool {
        self.magic == FILE_MAGIC
    }

    /// Index of the live slot, 0 or 1.
    pub fn selected_slot(&self) -> usize {
        (self.flags & FLAGS_SELECT_BIT) as usize
    }

    pub fn top_ref(&self, slot: usize) -> u64 {
        self.top_ref[slot].get()
    }

    pub fn set_top_ref(&mut self, slot: usize, value: u64) {
        self.top_ref[slot] = U64::new(value);
    }

    pub fn file_format(&self, slot: usize) -> u8 {
        self.file_format[slot]
    }

    pub fn set_file_format(&mut self, slot: usize, value: u8) {
        self.file_format[slot] = value;
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_select_bit(&mut self) {
        self.flags |= FLAGS_SELECT_BIT;
    }

    /// A file is on streaming form when slot 0 is selected and carries the
    /// sentinel; the real top ref is then in the footer.
    pub fn is_streaming(&self) -> bool {
        self.selected_slot() == 0 && self.top_ref(0) == STREAMING_SENTINEL
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StreamingFooter {
    top_ref: U64,
    magic_cookie: U64,
}

const _: () = assert!(std::mem::size_of::<StreamingFooter>() == FOOTER_SIZE);

impl StreamingFooter {
    pub fn new(top_ref: u64) -> Self {
        Self {
            top_ref: U64::new(top_ref),
            magic_cookie: U64::new(FOOTER_COOKIE),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FOOTER_SIZE,
            "buffer too small for StreamingFooter: {} < {}",
            bytes.len(),
            FOOTER_SIZE
        );
        Self::ref_from_bytes(&bytes[..FOOTER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StreamingFooter: {:?}", e))
    }

    pub fn top_ref(&self) -> u64 {
        self.top_ref.get()
    }

    pub fn cookie_ok(&self) -> bool {
        self.magic_cookie.get() == FOOTER_COOKIE
    }
}

/// Whether `version` may be opened. Version 0 means "not yet decided" and
/// is only valid while the file is empty (top ref 0). Shared sessions can
/// open version 2 files because the session initiator upgrades them in
/// place; unshared access cannot write, so 2 is refused there.
pub fn file_format_supported(version: u8, is_shared: bool, top_ref: u64) -> bool {
    match version {
        0 => top_ref == 0,
        2 => is_shared,
        3 | 4 => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_24() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 24);
    }

    #[test]
    fn footer_size_is_16() {
        assert_eq!(std::mem::size_of::<StreamingFooter>(), 16);
    }

    #[test]
    fn empty_header_roundtrip() {
        let header = FileHeader::new_empty();
        let parsed = FileHeader::from_bytes(header.as_bytes()).unwrap();

        assert!(parsed.magic_ok());
        assert_eq!(parsed.selected_slot(), 0);
        assert_eq!(parsed.top_ref(0), 0);
        assert_eq!(parsed.top_ref(1), 0);
        assert_eq!(parsed.file_format(0), 0);
        assert!(!parsed.is_streaming());
    }

    #[test]
    fn streaming_header_is_detected() {
        let header = FileHeader::streaming(4);
        let parsed = FileHeader::from_bytes(header.as_bytes()).unwrap();

        assert!(parsed.is_streaming());
        assert_eq!(parsed.file_format(0), 4);
        assert_eq!(parsed.top_ref(0), STREAMING_SENTINEL);
    }

    #[test]
    fn select_bit_switches_slot() {
        let mut header = FileHeader::new_empty();
        header.set_top_ref(1, 0x200);
        header.set_select_bit();

        assert_eq!(header.selected_slot(), 1);
        assert_eq!(header.top_ref(header.selected_slot()), 0x200);
        assert!(!header.is_streaming());
    }

    #[test]
    fn footer_roundtrip_and_cookie() {
        let footer = StreamingFooter::new(0x200);
        let parsed = StreamingFooter::from_bytes(footer.as_bytes()).unwrap();

        assert_eq!(parsed.top_ref(), 0x200);
        assert!(parsed.cookie_ok());
    }

    #[test]
    fn footer_rejects_short_buffer() {
        assert!(StreamingFooter::from_bytes(&[0u8; 8]).is_err());
    }

    #[test]
    fn file_format_acceptance_matrix() {
        assert!(file_format_supported(0, false, 0));
        assert!(!file_format_supported(0, false, 0x100));
        assert!(file_format_supported(2, true, 0x100));
        assert!(!file_format_supported(2, false, 0x100));
        assert!(file_format_supported(3, false, 0x100));
        assert!(file_format_supported(4, true, 0x100));
        assert!(!file_format_supported(5, true, 0x100));
        assert!(!file_format_supported(1, true, 0x100));
    }
}
