//! Serializable health and status surface for operators.

use serde::Serialize;

use crate::repl::{ReplicaId, ReplicaProgress, ReplicaState};
use crate::types::{Epoch, Lsn, TxnId};

/// Which side of replication this instance is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Accepts writes and streams WAL to replicas.
    Primary,
    /// Applies streamed WAL; read-only until promoted.
    Replica,
}

/// Replication lag of one replica as seen by the primary.
#[derive(Clone, Debug, Serialize)]
pub struct ReplicaLag {
    /// Membership id.
    pub id: ReplicaId,
    /// Whether the replica counts toward the synchronous quorum.
    pub synchronous: bool,
    /// Lifecycle state.
    pub state: ReplicaState,
    /// Last reported positions.
    pub progress: ReplicaProgress,
    /// Bytes of durable WAL the replica has not yet flushed.
    pub lag_bytes: u64,
}

/// Point-in-time engine status.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    /// Primary or replica.
    pub role: Role,
    /// Current replication epoch.
    pub epoch: Epoch,
    /// Next WAL position to be assigned.
    pub current_lsn: Lsn,
    /// Position up to which the local log is durable.
    pub durable_lsn: Lsn,
    /// Next transaction id to be assigned.
    pub next_xid: TxnId,
    /// Age in transactions of the oldest possibly-unfrozen id.
    pub oldest_unfrozen_age: u32,
    /// True once the wraparound danger threshold is crossed.
    pub wraparound_danger: bool,
    /// Keys with at least one surviving version.
    pub keys: usize,
    /// Per-replica replication lag.
    pub replicas: Vec<ReplicaLag>,
}
