//! The meta block: a small fixed-layout file holding everything recovery
//! needs before it can read the WAL. Rewritten atomically (temp file +
//! rename) on checkpoint and clean shutdown.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{HeartwoodError, Result};
use crate::types::{crc32, Epoch, Lsn, TxnId};

const MAGIC: &[u8; 6] = b"HWMETA";
const FORMAT: u16 = 1;
const META_LEN: usize = 6 + 2 + 4 + 8 + 4 + 8 + 4 + 4 + 4;

/// Decoded contents of the meta block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Meta {
    /// Page size the heap file was created with.
    pub page_size: u32,
    /// Random instance salt, fixed at creation.
    pub salt: u64,
    /// Replication epoch at the last meta write.
    pub epoch: Epoch,
    /// WAL position recovery starts redo from.
    pub redo: Lsn,
    /// Next transaction id at the last meta write.
    pub next_xid: TxnId,
    /// Oldest possibly-unfrozen transaction id.
    pub frozen_watermark: TxnId,
}

impl Meta {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT.to_be_bytes());
        out.extend_from_slice(&self.page_size.to_be_bytes());
        out.extend_from_slice(&self.salt.to_be_bytes());
        out.extend_from_slice(&self.epoch.0.to_be_bytes());
        out.extend_from_slice(&self.redo.0.to_be_bytes());
        out.extend_from_slice(&self.next_xid.0.to_be_bytes());
        out.extend_from_slice(&self.frozen_watermark.0.to_be_bytes());
        let crc = crc32(&[&out]);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != META_LEN || &buf[0..6] != MAGIC {
            return Err(HeartwoodError::Corruption("bad meta block"));
        }
        let stored = u32::from_be_bytes(buf[META_LEN - 4..].try_into().unwrap());
        if crc32(&[&buf[..META_LEN - 4]]) != stored {
            return Err(HeartwoodError::Corruption("meta block checksum mismatch"));
        }
        let format = u16::from_be_bytes(buf[6..8].try_into().unwrap());
        if format != FORMAT {
            return Err(HeartwoodError::Corruption("unsupported meta format"));
        }
        Ok(Self {
            page_size: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            salt: u64::from_be_bytes(buf[12..20].try_into().unwrap()),
            epoch: Epoch(u32::from_be_bytes(buf[20..24].try_into().unwrap())),
            redo: Lsn(u64::from_be_bytes(buf[24..32].try_into().unwrap())),
            next_xid: TxnId(u32::from_be_bytes(buf[32..36].try_into().unwrap())),
            frozen_watermark: TxnId(u32::from_be_bytes(buf[36..40].try_into().unwrap())),
        })
    }

    /// Reads the meta block, or `None` for a fresh data directory.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut buf = Vec::with_capacity(META_LEN);
        file.read_to_end(&mut buf)?;
        Self::decode(&buf).map(Some)
    }

    /// Durably replaces the meta block.
    pub fn store(&self, path: &Path) -> Result<()> {
        let tmp: PathBuf = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&self.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent() {
            if let Ok(handle) = File::open(dir) {
                let _ = handle.sync_all();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Meta {
        Meta {
            page_size: 8192,
            salt: 0xDEAD_BEEF_00FF_1234,
            epoch: Epoch(2),
            redo: Lsn(65536),
            next_xid: TxnId(99),
            frozen_watermark: TxnId(40),
        }
    }

    #[test]
    fn store_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        assert_eq!(Meta::load(&path).unwrap(), None);
        sample().store(&path).unwrap();
        assert_eq!(Meta::load(&path).unwrap(), Some(sample()));
    }

    #[test]
    fn corrupt_meta_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        sample().store(&path).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            Meta::load(&path),
            Err(HeartwoodError::Corruption(_))
        ));
    }
}
