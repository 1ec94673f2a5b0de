//! Error taxonomy for the engine.
//!
//! Variants split into three severities: transaction-local conditions the
//! caller retries (`WriteConflict`), availability degradations that block or
//! exclude a peer (`ReplicationTimeout`, `NotCaughtUp`), and loud stops that
//! must never be downgraded to warnings (`DurabilityBarrier`,
//! `WraparoundFatal`, `CorruptPage`).

use std::io;

use thiserror::Error;

use crate::types::{Epoch, Lsn, PageId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HeartwoodError>;

/// All failure modes surfaced by the engine.
#[derive(Debug, Error)]
pub enum HeartwoodError {
    /// Underlying file or socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Page checksum mismatch on read. Fatal for the page; recoverable
    /// cluster-wide only from a replica or backup.
    #[error("checksum mismatch reading {page}")]
    CorruptPage {
        /// The page that failed verification.
        page: PageId,
    },
    /// Structural corruption outside page bodies (WAL, meta, wire frames).
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// A caller-supplied argument or state precondition was violated.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Row or version not found.
    #[error("not found")]
    NotFound,
    /// The version was superseded by another transaction; first committer
    /// wins, the caller should retry the whole transaction.
    #[error("write conflict: version already superseded")]
    WriteConflict,
    /// Promotion precondition failure: the replica has received WAL it has
    /// not yet applied.
    #[error("replica not caught up: applied {applied}, received {received}")]
    NotCaughtUp {
        /// Last LSN the replica has applied.
        applied: Lsn,
        /// Last LSN the replica has received.
        received: Lsn,
    },
    /// The oldest unfrozen transaction id is close enough to the wraparound
    /// horizon that low-priority work is throttled.
    #[error("transaction id wraparound danger: oldest unfrozen age {age}")]
    WraparoundDanger {
        /// Age of the oldest unfrozen id, in transactions.
        age: u32,
    },
    /// The wraparound limit was reached; all new transactions are refused
    /// until a reclamation pass advances the frozen watermark.
    #[error(
        "transaction id wraparound limit reached (age {age}); writes halted until vacuum completes"
    )]
    WraparoundFatal {
        /// Age of the oldest unfrozen id, in transactions.
        age: u32,
    },
    /// A synchronous replica missed its acknowledgment deadline and was
    /// excluded from the quorum.
    #[error("replication acknowledgment timed out")]
    ReplicationTimeout,
    /// A durable-storage flush failed. The process must not acknowledge any
    /// pending commit past this point.
    #[error("durability barrier failure: {0}")]
    DurabilityBarrier(String),
    /// This node observed a higher replication epoch and may no longer
    /// accept writes.
    #[error("stale primary fenced by {observed}")]
    StalePrimary {
        /// The higher epoch observed on the wire.
        observed: Epoch,
    },
}

impl HeartwoodError {
    /// True for conditions the caller can recover from by retrying the
    /// transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HeartwoodError::WriteConflict)
    }

    /// True for stop conditions after which the engine refuses further
    /// writes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HeartwoodError::DurabilityBarrier(_)
                | HeartwoodError::WraparoundFatal { .. }
                | HeartwoodError::CorruptPage { .. }
        )
    }
}
