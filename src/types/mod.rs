//! Core identifier newtypes and checksum helpers shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod xid;

pub use xid::{TxnId, FIRST_NORMAL_XID, FROZEN_XID, INVALID_XID};

/// Log sequence number: a position in the write-ahead log, expressed as a
/// global byte offset. Strictly increasing for the lifetime of an instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero LSN, before any record has been written.
    pub const ZERO: Lsn = Lsn(0);
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Identifier of a fixed-size page in the heap file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

/// Replication generation number carried by every WAL record and wire
/// message; incremented on promotion and used to fence a stale primary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u32);

impl Epoch {
    /// The next generation after this one.
    pub fn next(self) -> Epoch {
        Epoch(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}", self.0)
    }
}

/// Stable identity of a tuple version: the page plus the item-pointer slot
/// it occupies. Item pointers never relocate, so the id stays valid for the
/// version's lifetime. Encoded as `(page + 1) << 16 | slot`; zero is the
/// null pointer terminating a version chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId(pub u64);

impl VersionId {
    /// The null id: end of a version chain.
    pub const NULL: VersionId = VersionId(0);

    /// Builds a version id from its page and slot.
    pub fn new(page: PageId, slot: u16) -> VersionId {
        VersionId(((u64::from(page.0) + 1) << 16) | u64::from(slot))
    }

    /// True for the null (chain-terminating) id.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The page holding this version. Panics on the null id in debug builds.
    pub fn page(self) -> PageId {
        debug_assert!(!self.is_null());
        PageId(((self.0 >> 16) - 1) as u32)
    }

    /// The item-pointer slot within the page.
    pub fn slot(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "(null)")
        } else {
            write!(f, "({},{})", self.page().0, self.slot())
        }
    }
}

/// Computes a crc32 over the given byte chunks.
pub fn crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_id_roundtrip() {
        let id = VersionId::new(PageId(17), 42);
        assert!(!id.is_null());
        assert_eq!(id.page(), PageId(17));
        assert_eq!(id.slot(), 42);
        assert_eq!(VersionId::NULL, VersionId::default());
    }

    #[test]
    fn version_id_page_zero_is_not_null() {
        let id = VersionId::new(PageId(0), 0);
        assert!(!id.is_null());
        assert_eq!(id.page(), PageId(0));
        assert_eq!(id.slot(), 0);
    }

    #[test]
    fn lsn_display_is_hi_lo() {
        assert_eq!(Lsn(0x1_0000_00AB).to_string(), "1/000000AB");
    }
}
