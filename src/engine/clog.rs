//! The commit log: the set of committed transaction ids, persisted at
//! checkpoint so their Commit records can be recycled out of the WAL.
//!
//! Only committed ids are stored; a normal id absent from the transaction
//! table resolves to Aborted, which is the correct reading for both
//! recovery orphans and genuinely aborted transactions. Ids older than the
//! freeze watermark are pruned at write time, since no surviving tuple
//! still carries them. Rewritten atomically (temp file + rename), like the
//! meta block.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{HeartwoodError, Result};
use crate::types::{crc32, TxnId};

const MAGIC: &[u8; 6] = b"HWCLOG";
const FORMAT: u16 = 1;
const HDR_LEN: usize = 6 + 2 + 4;

fn encode(committed: &[TxnId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HDR_LEN + committed.len() * 4 + 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT.to_be_bytes());
    out.extend_from_slice(&(committed.len() as u32).to_be_bytes());
    for xid in committed {
        out.extend_from_slice(&xid.0.to_be_bytes());
    }
    let crc = crc32(&[&out]);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

fn decode(buf: &[u8]) -> Result<Vec<TxnId>> {
    if buf.len() < HDR_LEN + 4 || &buf[0..6] != MAGIC {
        return Err(HeartwoodError::Corruption("bad commit log"));
    }
    let stored = u32::from_be_bytes(buf[buf.len() - 4..].try_into().unwrap());
    if crc32(&[&buf[..buf.len() - 4]]) != stored {
        return Err(HeartwoodError::Corruption("commit log checksum mismatch"));
    }
    let format = u16::from_be_bytes(buf[6..8].try_into().unwrap());
    if format != FORMAT {
        return Err(HeartwoodError::Corruption("unsupported commit log format"));
    }
    let count = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
    if buf.len() != HDR_LEN + count * 4 + 4 {
        return Err(HeartwoodError::Corruption("commit log length mismatch"));
    }
    let mut committed = Vec::with_capacity(count);
    for i in 0..count {
        let at = HDR_LEN + i * 4;
        committed.push(TxnId(u32::from_be_bytes(
            buf[at..at + 4].try_into().unwrap(),
        )));
    }
    Ok(committed)
}

/// Reads the committed-id set; an absent file is an empty set.
pub(crate) fn load(path: &Path) -> Result<Vec<TxnId>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    decode(&buf)
}

/// Durably replaces the committed-id set.
pub(crate) fn store(path: &Path, committed: &[TxnId]) -> Result<()> {
    let tmp: PathBuf = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&encode(committed))?;
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
