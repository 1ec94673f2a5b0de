//! Restartable WAL record reader.
//!
//! Starts at any previously written record boundary and yields records in
//! LSN order until the bound, a missing segment, or the first record that
//! fails validation. A corrupt tail reads as a clean end, the same
//! contract recovery and streaming both want.

use std::fs::File;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::{HeartwoodError, Result};
use crate::types::{crc32, Lsn};
use crate::wal::{WalRecord, RECORD_HDR_LEN};

/// One record as read back from the log.
pub struct ReadRecord {
    /// The record's LSN (its byte offset).
    pub lsn: Lsn,
    /// Decoded record.
    pub record: WalRecord,
    /// The full framed bytes, as they sit on disk; forwarded verbatim by
    /// replication streaming.
    pub frame: Vec<u8>,
}

impl ReadRecord {
    /// LSN of the first byte after this record.
    pub fn end_lsn(&self) -> Lsn {
        Lsn(self.lsn.0 + self.frame.len() as u64)
    }
}

/// Lazy sequence of records from a start LSN.
pub struct WalReader {
    dir: PathBuf,
    segment_size: u64,
    pos: Lsn,
    end: Option<Lsn>,
}

impl WalReader {
    /// Unbounded reader: stops at the first invalid or missing record.
    pub fn new(dir: PathBuf, segment_size: u64, from: Lsn) -> Self {
        Self {
            dir,
            segment_size,
            pos: from,
            end: None,
        }
    }

    /// Reader bounded by a known durable end.
    pub fn bounded(dir: PathBuf, segment_size: u64, from: Lsn, end: Lsn) -> Self {
        Self {
            dir,
            segment_size,
            pos: from,
            end: Some(end),
        }
    }

    /// Current position (the LSN the next record must start at).
    pub fn position(&self) -> Lsn {
        self.pos
    }

    fn read_at(&self, seg: u64, within: u64, dst: &mut [u8]) -> Result<Option<()>> {
        let path = self.dir.join(format!("{seg:016x}.wal"));
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(HeartwoodError::Io(err)),
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let mut off = within;
            let mut rest = dst;
            while !rest.is_empty() {
                let read = file.read_at(rest, off).map_err(HeartwoodError::Io)?;
                if read == 0 {
                    return Ok(None);
                }
                let (_, tail) = rest.split_at_mut(read);
                rest = tail;
                off += read as u64;
            }
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut off = within;
            let mut rest = dst;
            while !rest.is_empty() {
                let read = file.seek_read(rest, off).map_err(HeartwoodError::Io)?;
                if read == 0 {
                    return Ok(None);
                }
                let (_, tail) = rest.split_at_mut(read);
                rest = tail;
                off += read as u64;
            }
        }
        Ok(Some(()))
    }

    /// Reads the next record, or `None` at the end of valid log.
    pub fn next_record(&mut self) -> Result<Option<ReadRecord>> {
        loop {
            if let Some(end) = self.end {
                if self.pos >= end {
                    return Ok(None);
                }
            }
            let seg = self.pos.0 / self.segment_size;
            let within = self.pos.0 % self.segment_size;
            if self.segment_size - within < RECORD_HDR_LEN as u64 {
                self.pos = Lsn((seg + 1) * self.segment_size);
                continue;
            }
            let mut header = [0u8; RECORD_HDR_LEN];
            if self.read_at(seg, within, &mut header)?.is_none() {
                return Ok(None);
            }
            let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as u64;
            if len == 0 {
                // Segment tail padding.
                self.pos = Lsn((seg + 1) * self.segment_size);
                continue;
            }
            if within + RECORD_HDR_LEN as u64 + len > self.segment_size {
                return Ok(None);
            }
            if let Some(end) = self.end {
                if self.pos.0 + RECORD_HDR_LEN as u64 + len > end.0 {
                    return Ok(None);
                }
            }
            let stored_crc = u32::from_be_bytes(header[4..8].try_into().unwrap());
            let stored_lsn = Lsn(u64::from_be_bytes(header[8..16].try_into().unwrap()));
            if stored_lsn != self.pos {
                return Ok(None);
            }
            let mut payload = vec![0u8; len as usize];
            if self
                .read_at(seg, within + RECORD_HDR_LEN as u64, &mut payload)?
                .is_none()
            {
                return Ok(None);
            }
            if crc32(&[&payload]) != stored_crc {
                return Ok(None);
            }
            let record = match WalRecord::decode_payload(&payload) {
                Ok(record) => record,
                Err(_) => return Ok(None),
            };
            let lsn = self.pos;
            let mut frame = Vec::with_capacity(RECORD_HDR_LEN + payload.len());
            frame.extend_from_slice(&header);
            frame.extend_from_slice(&payload);
            self.pos = Lsn(lsn.0 + frame.len() as u64);
            return Ok(Some(ReadRecord { lsn, record, frame }));
        }
    }
}
