//! Fixed-size slotted pages.
//!
//! Layout: a 24-byte header, an item-pointer array growing down from the
//! header, and a tuple-data region growing up from the end of the page.
//! Free space is always `upper - lower`. Item pointers never relocate; a
//! reclaimed slot keeps its index with a zero length and may be reused for
//! a later tuple.

use crate::error::{HeartwoodError, Result};
use crate::types::{crc32, Lsn, PageId, TxnId, VersionId, FROZEN_XID};

/// Page header length in bytes.
pub const PAGE_HDR_LEN: usize = 24;
/// Item pointer length in bytes (offset u16 + len u16).
pub const ITEM_LEN: usize = 4;
/// Tuple header length in bytes, preceding key and payload.
pub const TUPLE_HDR_LEN: usize = 26;

/// Every tuple version on this page carries a frozen xmin.
pub const PAGE_FLAG_ALL_FROZEN: u16 = 0x0001;

const OFF_LSN: usize = 0;
const OFF_CRC: usize = 8;
const OFF_LOWER: usize = 12;
const OFF_UPPER: usize = 14;
const OFF_FLAGS: usize = 16;
const OFF_ITEM_COUNT: usize = 18;

/// Decoded header of one tuple version as stored on a page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TupleHeader {
    /// Creating transaction id (possibly the frozen sentinel).
    pub xmin: TxnId,
    /// Deleting transaction id; invalid (0) while the version is live.
    pub xmax: TxnId,
    /// Command sequence within the creating transaction.
    pub cmin: u16,
    /// Reserved flag bits.
    pub flags: u16,
    /// Forward pointer to the superseding version, null at the chain tail.
    pub next: VersionId,
    /// Length of the key bytes following the header.
    pub key_len: u16,
    /// Length of the payload bytes following the key.
    pub payload_len: u32,
}

impl TupleHeader {
    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.xmin.0.to_be_bytes());
        buf[4..8].copy_from_slice(&self.xmax.0.to_be_bytes());
        buf[8..10].copy_from_slice(&self.cmin.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..20].copy_from_slice(&self.next.0.to_be_bytes());
        buf[20..22].copy_from_slice(&self.key_len.to_be_bytes());
        buf[22..26].copy_from_slice(&self.payload_len.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < TUPLE_HDR_LEN {
            return Err(HeartwoodError::Corruption("tuple header truncated"));
        }
        Ok(Self {
            xmin: TxnId(u32::from_be_bytes(src[0..4].try_into().unwrap())),
            xmax: TxnId(u32::from_be_bytes(src[4..8].try_into().unwrap())),
            cmin: u16::from_be_bytes(src[8..10].try_into().unwrap()),
            flags: u16::from_be_bytes(src[10..12].try_into().unwrap()),
            next: VersionId(u64::from_be_bytes(src[12..20].try_into().unwrap())),
            key_len: u16::from_be_bytes(src[20..22].try_into().unwrap()),
            payload_len: u32::from_be_bytes(src[22..26].try_into().unwrap()),
        })
    }
}

/// Serializes a tuple (header + key + payload) for placement on a page.
pub fn encode_tuple(hdr: &TupleHeader, key: &[u8], payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(hdr.key_len as usize, key.len());
    debug_assert_eq!(hdr.payload_len as usize, payload.len());
    let mut out = vec![0u8; TUPLE_HDR_LEN + key.len() + payload.len()];
    hdr.encode_into(&mut out[..TUPLE_HDR_LEN]);
    out[TUPLE_HDR_LEN..TUPLE_HDR_LEN + key.len()].copy_from_slice(key);
    out[TUPLE_HDR_LEN + key.len()..].copy_from_slice(payload);
    out
}

/// One fixed-size page, held in memory as an owned buffer.
#[derive(Clone, Debug)]
pub struct Page {
    id: PageId,
    buf: Vec<u8>,
}

impl Page {
    /// Creates an empty page of `page_size` bytes.
    pub fn new(id: PageId, page_size: usize) -> Self {
        let mut page = Self {
            id,
            buf: vec![0u8; page_size],
        };
        page.set_lower(PAGE_HDR_LEN as u16);
        page.set_upper(page_size as u16);
        page
    }

    /// Rehydrates a page from raw bytes without checksum verification.
    /// Used when installing a full-page image from the WAL.
    pub fn from_bytes(id: PageId, buf: Vec<u8>) -> Self {
        Self { id, buf }
    }

    /// Rehydrates a page from raw bytes, verifying the stored checksum.
    pub fn verified(id: PageId, buf: Vec<u8>) -> Result<Self> {
        let page = Self { id, buf };
        let stored = u32::from_be_bytes(page.buf[OFF_CRC..OFF_CRC + 4].try_into().unwrap());
        if stored != page.compute_checksum() {
            return Err(HeartwoodError::CorruptPage { page: id });
        }
        Ok(page)
    }

    /// The page's identifier.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Raw page bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Page bytes with the checksum field refreshed, ready to persist.
    pub fn checksummed_bytes(&mut self) -> &[u8] {
        let crc = self.compute_checksum();
        self.buf[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_be_bytes());
        &self.buf
    }

    fn compute_checksum(&self) -> u32 {
        // Whole page except the checksum field itself.
        crc32(&[&self.buf[..OFF_CRC], &self.buf[OFF_CRC + 4..]])
    }

    /// LSN of the last record that modified this page.
    pub fn lsn(&self) -> Lsn {
        Lsn(u64::from_be_bytes(
            self.buf[OFF_LSN..OFF_LSN + 8].try_into().unwrap(),
        ))
    }

    /// Stamps the page with the LSN of the modifying record.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.buf[OFF_LSN..OFF_LSN + 8].copy_from_slice(&lsn.0.to_be_bytes());
    }

    /// Header flag bits.
    pub fn flags(&self) -> u16 {
        u16::from_be_bytes(self.buf[OFF_FLAGS..OFF_FLAGS + 2].try_into().unwrap())
    }

    /// Replaces the header flag bits.
    pub fn set_flags(&mut self, flags: u16) {
        self.buf[OFF_FLAGS..OFF_FLAGS + 2].copy_from_slice(&flags.to_be_bytes());
    }

    fn lower(&self) -> u16 {
        u16::from_be_bytes(self.buf[OFF_LOWER..OFF_LOWER + 2].try_into().unwrap())
    }

    fn set_lower(&mut self, v: u16) {
        self.buf[OFF_LOWER..OFF_LOWER + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn upper(&self) -> u16 {
        u16::from_be_bytes(self.buf[OFF_UPPER..OFF_UPPER + 2].try_into().unwrap())
    }

    fn set_upper(&mut self, v: u16) {
        self.buf[OFF_UPPER..OFF_UPPER + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Number of item-pointer slots, live or free.
    pub fn item_count(&self) -> u16 {
        u16::from_be_bytes(
            self.buf[OFF_ITEM_COUNT..OFF_ITEM_COUNT + 2]
                .try_into()
                .unwrap(),
        )
    }

    fn set_item_count(&mut self, v: u16) {
        self.buf[OFF_ITEM_COUNT..OFF_ITEM_COUNT + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Bytes available between the item array and the tuple region.
    pub fn free_space(&self) -> usize {
        (self.upper() - self.lower()) as usize
    }

    fn item_pos(slot: u16) -> usize {
        PAGE_HDR_LEN + slot as usize * ITEM_LEN
    }

    fn item(&self, slot: u16) -> (u16, u16) {
        let pos = Self::item_pos(slot);
        let off = u16::from_be_bytes(self.buf[pos..pos + 2].try_into().unwrap());
        let len = u16::from_be_bytes(self.buf[pos + 2..pos + 4].try_into().unwrap());
        (off, len)
    }

    fn set_item(&mut self, slot: u16, off: u16, len: u16) {
        let pos = Self::item_pos(slot);
        self.buf[pos..pos + 2].copy_from_slice(&off.to_be_bytes());
        self.buf[pos + 2..pos + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// True when `slot` exists and currently holds a tuple.
    pub fn slot_live(&self, slot: u16) -> bool {
        slot < self.item_count() && self.item(slot).1 != 0
    }

    /// True when a tuple of `tuple_len` bytes fits on this page, counting
    /// the item pointer it may need.
    pub fn can_fit(&self, tuple_len: usize) -> bool {
        let needs_pointer = if self.free_slot().is_some() {
            0
        } else {
            ITEM_LEN
        };
        self.free_space() >= tuple_len + needs_pointer
    }

    fn free_slot(&self) -> Option<u16> {
        (0..self.item_count()).find(|&slot| self.item(slot).1 == 0)
    }

    /// The slot the next insertion on this page will land in.
    pub fn next_slot(&self) -> u16 {
        self.free_slot().unwrap_or_else(|| self.item_count())
    }

    /// Places a serialized tuple on the page, returning its slot.
    pub fn insert_tuple(&mut self, tuple: &[u8]) -> Result<u16> {
        if !self.can_fit(tuple.len()) {
            return Err(HeartwoodError::Invalid("tuple does not fit on page"));
        }
        let len = u16::try_from(tuple.len())
            .map_err(|_| HeartwoodError::Invalid("tuple larger than page"))?;
        let slot = match self.free_slot() {
            Some(slot) => slot,
            None => {
                let slot = self.item_count();
                self.set_item_count(slot + 1);
                self.set_lower(self.lower() + ITEM_LEN as u16);
                slot
            }
        };
        let off = self.upper() - len;
        self.buf[off as usize..off as usize + tuple.len()].copy_from_slice(tuple);
        self.set_upper(off);
        self.set_item(slot, off, len);
        // New tuples carry a normal xmin; the page is no longer all-frozen.
        self.set_flags(self.flags() & !PAGE_FLAG_ALL_FROZEN);
        Ok(slot)
    }

    /// Frees a slot, keeping its index so other item pointers stay put.
    /// The tuple bytes become dead space until compaction.
    pub fn reclaim_slot(&mut self, slot: u16) -> Result<()> {
        if !self.slot_live(slot) {
            return Err(HeartwoodError::Invalid("reclaim of a free slot"));
        }
        let (off, _) = self.item(slot);
        self.set_item(slot, off, 0);
        Ok(())
    }

    /// Raw bytes (header + key + payload) of the tuple at `slot`.
    pub fn tuple_bytes(&self, slot: u16) -> Result<&[u8]> {
        if !self.slot_live(slot) {
            return Err(HeartwoodError::NotFound);
        }
        let (off, len) = self.item(slot);
        Ok(&self.buf[off as usize..off as usize + len as usize])
    }

    /// Decoded tuple header at `slot`.
    pub fn tuple_header(&self, slot: u16) -> Result<TupleHeader> {
        TupleHeader::decode(self.tuple_bytes(slot)?)
    }

    /// Key bytes of the tuple at `slot`.
    pub fn tuple_key(&self, slot: u16) -> Result<&[u8]> {
        let bytes = self.tuple_bytes(slot)?;
        let hdr = TupleHeader::decode(bytes)?;
        Ok(&bytes[TUPLE_HDR_LEN..TUPLE_HDR_LEN + hdr.key_len as usize])
    }

    /// Payload bytes of the tuple at `slot`.
    pub fn tuple_payload(&self, slot: u16) -> Result<&[u8]> {
        let bytes = self.tuple_bytes(slot)?;
        let hdr = TupleHeader::decode(bytes)?;
        let start = TUPLE_HDR_LEN + hdr.key_len as usize;
        Ok(&bytes[start..start + hdr.payload_len as usize])
    }

    fn tuple_field_mut(&mut self, slot: u16, field_off: usize, len: usize) -> Result<&mut [u8]> {
        if !self.slot_live(slot) {
            return Err(HeartwoodError::NotFound);
        }
        let (off, _) = self.item(slot);
        let start = off as usize + field_off;
        Ok(&mut self.buf[start..start + len])
    }

    /// Stamps the deleting transaction id on the tuple at `slot`.
    pub fn set_tuple_xmax(&mut self, slot: u16, xmax: TxnId) -> Result<()> {
        self.tuple_field_mut(slot, 4, 4)?
            .copy_from_slice(&xmax.0.to_be_bytes());
        Ok(())
    }

    /// Links the tuple at `slot` to the version superseding it.
    pub fn set_tuple_next(&mut self, slot: u16, next: VersionId) -> Result<()> {
        self.tuple_field_mut(slot, 12, 8)?
            .copy_from_slice(&next.0.to_be_bytes());
        Ok(())
    }

    /// Rewrites the tuple's xmin to the permanent frozen sentinel.
    pub fn freeze_tuple(&mut self, slot: u16) -> Result<()> {
        self.tuple_field_mut(slot, 0, 4)?
            .copy_from_slice(&FROZEN_XID.0.to_be_bytes());
        Ok(())
    }

    /// Explicit compaction: repacks live tuple bytes against the end of the
    /// page so dead space from reclaimed slots becomes free space. Slot
    /// indices are stable; only data offsets move.
    pub fn compact(&mut self) {
        let page_size = self.buf.len();
        let count = self.item_count();
        let mut live: Vec<(u16, Vec<u8>)> = Vec::new();
        for slot in 0..count {
            let (off, len) = self.item(slot);
            if len != 0 {
                live.push((
                    slot,
                    self.buf[off as usize..off as usize + len as usize].to_vec(),
                ));
            }
        }
        let mut upper = page_size as u16;
        for (slot, bytes) in live {
            let len = bytes.len() as u16;
            upper -= len;
            self.buf[upper as usize..upper as usize + bytes.len()].copy_from_slice(&bytes);
            self.set_item(slot, upper, len);
        }
        self.set_upper(upper);
    }
}
