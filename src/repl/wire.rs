//! Replication wire protocol.
//!
//! Messages are framed as `{body_len u32, crc32 u32}` followed by the body;
//! the checksum covers the body. Bodies open with a one-byte tag. WAL
//! frames inside a `Records` message are carried verbatim, exactly as they
//! sit in the primary's log.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{HeartwoodError, Result};
use crate::types::{crc32, Epoch, Lsn};

/// Framing prefix length: body_len u32 + crc u32.
pub const MESSAGE_HDR_LEN: usize = 8;

const TAG_START: u8 = 1;
const TAG_RECORDS: u8 = 2;
const TAG_HEARTBEAT: u8 = 3;
const TAG_ACK: u8 = 4;

/// One WAL frame in flight: its position and its on-disk bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameEntry {
    /// The frame's LSN (global byte offset).
    pub lsn: Lsn,
    /// The framed record, prefix included.
    pub frame: Vec<u8>,
}

/// One replication protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Replica asks for the stream beginning at `start_lsn`.
    Start {
        /// Position streaming must begin at.
        start_lsn: Lsn,
        /// The replica's last known epoch.
        epoch: Epoch,
    },
    /// A batch of raw WAL frames in LSN order. Each frame carries its own
    /// position; gaps between consecutive frames are segment-tail padding
    /// the replica reproduces locally.
    Records {
        /// Log frames, byte-identical to the primary's disk.
        entries: Vec<FrameEntry>,
        /// Primary's epoch.
        epoch: Epoch,
    },
    /// Keepalive carrying the primary's durable end of log.
    Heartbeat {
        /// Primary's durable LSN.
        end_lsn: Lsn,
        /// Primary's epoch.
        epoch: Epoch,
    },
    /// Replica progress report.
    Ack {
        /// Last byte position received.
        received: Lsn,
        /// Last position flushed to the replica's log.
        flushed: Lsn,
        /// Last position applied to pages.
        applied: Lsn,
        /// The replica's epoch; a value above the primary's fences it.
        epoch: Epoch,
    },
}

impl Message {
    /// The epoch carried by this message.
    pub fn epoch(&self) -> Epoch {
        match self {
            Message::Start { epoch, .. }
            | Message::Records { epoch, .. }
            | Message::Heartbeat { epoch, .. }
            | Message::Ack { epoch, .. } => *epoch,
        }
    }

    fn encode_body(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(64);
        match self {
            Message::Start { start_lsn, epoch } => {
                body.put_u8(TAG_START);
                body.put_u64(start_lsn.0);
                body.put_u32(epoch.0);
            }
            Message::Records { entries, epoch } => {
                body.put_u8(TAG_RECORDS);
                body.put_u32(epoch.0);
                body.put_u32(entries.len() as u32);
                for entry in entries {
                    body.put_u64(entry.lsn.0);
                    body.put_u32(entry.frame.len() as u32);
                    body.put_slice(&entry.frame);
                }
            }
            Message::Heartbeat { end_lsn, epoch } => {
                body.put_u8(TAG_HEARTBEAT);
                body.put_u64(end_lsn.0);
                body.put_u32(epoch.0);
            }
            Message::Ack {
                received,
                flushed,
                applied,
                epoch,
            } => {
                body.put_u8(TAG_ACK);
                body.put_u64(received.0);
                body.put_u64(flushed.0);
                body.put_u64(applied.0);
                body.put_u32(epoch.0);
            }
        }
        body
    }

    /// Serializes the message with its frame prefix.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut out = Vec::with_capacity(MESSAGE_HDR_LEN + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&crc32(&[&body]).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decodes a message body whose frame checksum has already been
    /// verified by [`decode`](Self::decode) or the transport.
    pub fn decode_body(mut body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(HeartwoodError::Corruption("empty wire message"));
        }
        let tag = body.get_u8();
        let msg = match tag {
            TAG_START => {
                if body.remaining() < 12 {
                    return Err(HeartwoodError::Corruption("wire message truncated"));
                }
                Message::Start {
                    start_lsn: Lsn(body.get_u64()),
                    epoch: Epoch(body.get_u32()),
                }
            }
            TAG_RECORDS => {
                if body.remaining() < 8 {
                    return Err(HeartwoodError::Corruption("wire message truncated"));
                }
                let epoch = Epoch(body.get_u32());
                let count = body.get_u32() as usize;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    if body.remaining() < 12 {
                        return Err(HeartwoodError::Corruption("wire message truncated"));
                    }
                    let lsn = Lsn(body.get_u64());
                    let len = body.get_u32() as usize;
                    if body.remaining() < len {
                        return Err(HeartwoodError::Corruption("wire message truncated"));
                    }
                    let frame = body.copy_to_bytes(len).to_vec();
                    entries.push(FrameEntry { lsn, frame });
                }
                Message::Records { entries, epoch }
            }
            TAG_HEARTBEAT => {
                if body.remaining() < 12 {
                    return Err(HeartwoodError::Corruption("wire message truncated"));
                }
                Message::Heartbeat {
                    end_lsn: Lsn(body.get_u64()),
                    epoch: Epoch(body.get_u32()),
                }
            }
            TAG_ACK => {
                if body.remaining() < 28 {
                    return Err(HeartwoodError::Corruption("wire message truncated"));
                }
                Message::Ack {
                    received: Lsn(body.get_u64()),
                    flushed: Lsn(body.get_u64()),
                    applied: Lsn(body.get_u64()),
                    epoch: Epoch(body.get_u32()),
                }
            }
            _ => return Err(HeartwoodError::Corruption("unknown wire message tag")),
        };
        Ok(msg)
    }

    /// Decodes a fully framed message, verifying length and checksum.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < MESSAGE_HDR_LEN {
            return Err(HeartwoodError::Corruption("wire frame truncated"));
        }
        let len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_be_bytes(frame[4..8].try_into().unwrap());
        let body = &frame[MESSAGE_HDR_LEN..];
        if body.len() != len {
            return Err(HeartwoodError::Corruption("wire frame length mismatch"));
        }
        if crc32(&[body]) != crc {
            return Err(HeartwoodError::Corruption("wire frame checksum mismatch"));
        }
        Self::decode_body(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_messages() {
        let messages = vec![
            Message::Start {
                start_lsn: Lsn(4096),
                epoch: Epoch(2),
            },
            Message::Records {
                entries: vec![
                    FrameEntry {
                        lsn: Lsn(4096),
                        frame: vec![0xAB; 37],
                    },
                    FrameEntry {
                        lsn: Lsn(4149),
                        frame: vec![0xCD; 21],
                    },
                ],
                epoch: Epoch(2),
            },
            Message::Heartbeat {
                end_lsn: Lsn(9000),
                epoch: Epoch(2),
            },
            Message::Ack {
                received: Lsn(9000),
                flushed: Lsn(8000),
                applied: Lsn(7000),
                epoch: Epoch(2),
            },
        ];
        for msg in messages {
            let bytes = msg.encode();
            assert_eq!(Message::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn corrupt_frame_rejected() {
        let mut bytes = Message::Heartbeat {
            end_lsn: Lsn(1),
            epoch: Epoch(0),
        }
        .encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            Message::decode(&bytes),
            Err(HeartwoodError::Corruption(_))
        ));
    }
}
