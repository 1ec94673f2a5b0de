//! Synchronous streaming replication.
//!
//! The primary streams raw WAL frames to each replica over a
//! [`transport::ReplicaChannel`]; replicas append the frames to their own
//! log verbatim (LSNs are global byte offsets, so the files match byte for
//! byte), apply records in strict LSN order, and acknowledge with their
//! `{received, flushed, applied}` positions. Commits on the primary block
//! until the configured quorum of synchronous replicas has flushed the
//! commit LSN. Every record and message carries the replication epoch;
//! promotion bumps it, and a primary that sees a higher epoch in any ack
//! fences itself.

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::types::Lsn;

pub mod coordinator;
pub mod replica;
pub mod transport;
pub mod wire;

pub use coordinator::{Coordinator, ReplicationConfig};
pub use replica::Standby;

/// Identifier of one replica in the membership table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ReplicaId(pub u32);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica#{}", self.0)
    }
}

/// Lifecycle of a replica as seen by the primary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    /// Channel open, no Start message yet.
    Connecting,
    /// Streaming WAL, not yet caught up to the primary's durable position.
    Streaming,
    /// Caught up; counts toward the synchronous quorum.
    Synchronous,
    /// Timed out or closed; excluded from quorum until it reconnects.
    Disconnected,
}

/// A replica's reported log positions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaProgress {
    /// Last byte position received.
    pub received: Lsn,
    /// Last position durably flushed to the replica's log.
    pub flushed: Lsn,
    /// Last position applied to the replica's pages.
    pub applied: Lsn,
}

/// Per-replica bookkeeping on the primary.
#[derive(Clone, Debug)]
pub struct ReplicaStatus {
    /// Membership id.
    pub id: ReplicaId,
    /// Whether the replica participates in the synchronous quorum.
    pub synchronous: bool,
    /// Current lifecycle state.
    pub state: ReplicaState,
    /// Last reported positions.
    pub progress: ReplicaProgress,
    /// When the last acknowledgment arrived.
    pub last_ack: Instant,
}
