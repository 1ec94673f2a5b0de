//! Write-ahead log: record taxonomy, framing, the append/flush manager and
//! the restartable reader.
//!
//! Every record is framed as `{payload_len u32, crc32 u32, lsn u64}` followed
//! by the payload. The LSN is the record's global byte offset, so positions
//! double as durability barriers. Payloads open with `{kind u8, epoch u32,
//! xid u32}`; the epoch fences stale primaries after a promotion.

use crate::error::{HeartwoodError, Result};
use crate::types::{crc32, Epoch, Lsn, PageId, TxnId, VersionId};

pub mod manager;
pub mod reader;

pub use manager::{WalManager, WalOptions};
pub use reader::WalReader;

/// Framing prefix length: payload_len u32 + crc u32 + lsn u64.
pub const RECORD_HDR_LEN: usize = 16;

const KIND_INSERT: u8 = 1;
const KIND_MARK_DELETED: u8 = 2;
const KIND_FREEZE: u8 = 3;
const KIND_RECLAIM: u8 = 4;
const KIND_COMMIT: u8 = 5;
const KIND_ABORT: u8 = 6;
const KIND_CHECKPOINT: u8 = 7;
const KIND_FULL_PAGE_IMAGE: u8 = 8;

/// Kind-specific contents of a WAL record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordBody {
    /// A new tuple version placed at `page`/`slot`. The record's xid is the
    /// version's xmin.
    Insert {
        /// Page receiving the tuple.
        page: PageId,
        /// Slot the tuple must land in on redo.
        slot: u16,
        /// Command sequence within the creating transaction.
        cmin: u16,
        /// True when redo must link the version from the key's existing
        /// chain tail; updates link via their MarkDeleted record instead.
        chained: bool,
        /// Row key.
        key: Vec<u8>,
        /// Row payload.
        payload: Vec<u8>,
    },
    /// The record's xid stamped as xmax on `version`; `next` links to the
    /// superseding version (null for a plain delete).
    MarkDeleted {
        /// Version being deleted or superseded.
        version: VersionId,
        /// Superseding version, if any.
        next: VersionId,
    },
    /// `version`'s xmin rewritten to the frozen sentinel.
    Freeze {
        /// Version being frozen.
        version: VersionId,
    },
    /// `version`'s slot reclaimed by the space reclaimer.
    Reclaim {
        /// Version whose space is reclaimed.
        version: VersionId,
    },
    /// Transaction commit marker.
    Commit,
    /// Transaction abort marker.
    Abort,
    /// Durability checkpoint: recovery replays from `redo`.
    Checkpoint {
        /// LSN recovery starts redo from.
        redo: Lsn,
        /// Next transaction id at checkpoint time.
        next_xid: TxnId,
        /// Oldest possibly-unfrozen transaction id.
        frozen_watermark: TxnId,
    },
    /// Complete image of a page, logged on its first mutation after a
    /// checkpoint so recovery never depends on a torn partial page write.
    FullPageImage {
        /// The imaged page.
        page: PageId,
        /// Full page bytes.
        image: Vec<u8>,
    },
}

/// One WAL record: fencing epoch, owning transaction, and body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    /// Replication generation the record was written under.
    pub epoch: Epoch,
    /// Owning transaction; invalid (0) for maintenance records.
    pub xid: TxnId,
    /// Kind-specific contents.
    pub body: RecordBody,
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.src.len() {
            return Err(HeartwoodError::Corruption("wal record truncated"));
        }
        let out = &self.src[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

impl WalRecord {
    /// Serializes the record payload (everything after the frame prefix).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        let kind = match &self.body {
            RecordBody::Insert { .. } => KIND_INSERT,
            RecordBody::MarkDeleted { .. } => KIND_MARK_DELETED,
            RecordBody::Freeze { .. } => KIND_FREEZE,
            RecordBody::Reclaim { .. } => KIND_RECLAIM,
            RecordBody::Commit => KIND_COMMIT,
            RecordBody::Abort => KIND_ABORT,
            RecordBody::Checkpoint { .. } => KIND_CHECKPOINT,
            RecordBody::FullPageImage { .. } => KIND_FULL_PAGE_IMAGE,
        };
        out.push(kind);
        out.extend_from_slice(&self.epoch.0.to_be_bytes());
        out.extend_from_slice(&self.xid.0.to_be_bytes());
        match &self.body {
            RecordBody::Insert {
                page,
                slot,
                cmin,
                chained,
                key,
                payload,
            } => {
                out.extend_from_slice(&page.0.to_be_bytes());
                out.extend_from_slice(&slot.to_be_bytes());
                out.extend_from_slice(&cmin.to_be_bytes());
                out.push(u8::from(*chained));
                put_bytes(&mut out, key);
                put_bytes(&mut out, payload);
            }
            RecordBody::MarkDeleted { version, next } => {
                out.extend_from_slice(&version.0.to_be_bytes());
                out.extend_from_slice(&next.0.to_be_bytes());
            }
            RecordBody::Freeze { version } | RecordBody::Reclaim { version } => {
                out.extend_from_slice(&version.0.to_be_bytes());
            }
            RecordBody::Commit | RecordBody::Abort => {}
            RecordBody::Checkpoint {
                redo,
                next_xid,
                frozen_watermark,
            } => {
                out.extend_from_slice(&redo.0.to_be_bytes());
                out.extend_from_slice(&next_xid.0.to_be_bytes());
                out.extend_from_slice(&frozen_watermark.0.to_be_bytes());
            }
            RecordBody::FullPageImage { page, image } => {
                out.extend_from_slice(&page.0.to_be_bytes());
                put_bytes(&mut out, image);
            }
        }
        out
    }

    /// Decodes a record payload produced by
    /// [`encode_payload`](Self::encode_payload).
    pub fn decode_payload(src: &[u8]) -> Result<Self> {
        let mut cur = Cursor { src, pos: 0 };
        let kind = cur.u8()?;
        let epoch = Epoch(cur.u32()?);
        let xid = TxnId(cur.u32()?);
        let body = match kind {
            KIND_INSERT => RecordBody::Insert {
                page: PageId(cur.u32()?),
                slot: cur.u16()?,
                cmin: cur.u16()?,
                chained: cur.u8()? != 0,
                key: cur.bytes()?,
                payload: cur.bytes()?,
            },
            KIND_MARK_DELETED => RecordBody::MarkDeleted {
                version: VersionId(cur.u64()?),
                next: VersionId(cur.u64()?),
            },
            KIND_FREEZE => RecordBody::Freeze {
                version: VersionId(cur.u64()?),
            },
            KIND_RECLAIM => RecordBody::Reclaim {
                version: VersionId(cur.u64()?),
            },
            KIND_COMMIT => RecordBody::Commit,
            KIND_ABORT => RecordBody::Abort,
            KIND_CHECKPOINT => RecordBody::Checkpoint {
                redo: Lsn(cur.u64()?),
                next_xid: TxnId(cur.u32()?),
                frozen_watermark: TxnId(cur.u32()?),
            },
            KIND_FULL_PAGE_IMAGE => RecordBody::FullPageImage {
                page: PageId(cur.u32()?),
                image: cur.bytes()?,
            },
            _ => return Err(HeartwoodError::Corruption("unknown wal record kind")),
        };
        Ok(Self { epoch, xid, body })
    }
}

/// Frames a payload for the log: `{len, crc, lsn}` + payload.
pub fn frame_record(lsn: Lsn, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HDR_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc32(&[payload]).to_be_bytes());
    out.extend_from_slice(&lsn.0.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip_all_kinds() {
        let records = vec![
            WalRecord {
                epoch: Epoch(1),
                xid: TxnId(3),
                body: RecordBody::Insert {
                    page: PageId(4),
                    slot: 2,
                    cmin: 1,
                    chained: true,
                    key: b"k".to_vec(),
                    payload: b"value".to_vec(),
                },
            },
            WalRecord {
                epoch: Epoch(1),
                xid: TxnId(5),
                body: RecordBody::MarkDeleted {
                    version: VersionId::new(PageId(4), 2),
                    next: VersionId::NULL,
                },
            },
            WalRecord {
                epoch: Epoch(2),
                xid: TxnId(0),
                body: RecordBody::Freeze {
                    version: VersionId::new(PageId(1), 0),
                },
            },
            WalRecord {
                epoch: Epoch(2),
                xid: TxnId(0),
                body: RecordBody::Reclaim {
                    version: VersionId::new(PageId(1), 1),
                },
            },
            WalRecord {
                epoch: Epoch(1),
                xid: TxnId(3),
                body: RecordBody::Commit,
            },
            WalRecord {
                epoch: Epoch(1),
                xid: TxnId(9),
                body: RecordBody::Abort,
            },
            WalRecord {
                epoch: Epoch(1),
                xid: TxnId(0),
                body: RecordBody::Checkpoint {
                    redo: Lsn(4096),
                    next_xid: TxnId(17),
                    frozen_watermark: TxnId(3),
                },
            },
            WalRecord {
                epoch: Epoch(1),
                xid: TxnId(0),
                body: RecordBody::FullPageImage {
                    page: PageId(7),
                    image: vec![0xAB; 128],
                },
            },
        ];
        for record in records {
            let bytes = record.encode_payload();
            let back = WalRecord::decode_payload(&bytes).unwrap();
            assert_eq!(back, record);
        }
    }

    #[test]
    fn truncated_payload_rejected() {
        let record = WalRecord {
            epoch: Epoch(1),
            xid: TxnId(3),
            body: RecordBody::Commit,
        };
        let bytes = record.encode_payload();
        assert!(WalRecord::decode_payload(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn frame_layout() {
        let framed = frame_record(Lsn(0x20), b"abc");
        assert_eq!(framed.len(), RECORD_HDR_LEN + 3);
        assert_eq!(&framed[0..4], &3u32.to_be_bytes());
        assert_eq!(&framed[8..16], &0x20u64.to_be_bytes());
        assert_eq!(&framed[16..], b"abc");
    }
}
