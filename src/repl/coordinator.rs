//! Primary-side replication: per-replica sender threads, ack bookkeeping,
//! and the synchronous-commit quorum wait.
//!
//! One thread per replica multiplexes both directions of its channel: it
//! drains acks, streams newly durable WAL frames, and heartbeats when
//! idle. Commit callers block in [`Coordinator::wait_for_quorum`] until
//! enough synchronous replicas have flushed the commit LSN; replicas whose
//! acks go stale are demoted to `Disconnected` inside the wait loop so a
//! hung replica cannot wedge commits the quorum no longer needs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{HeartwoodError, Result};
use crate::repl::transport::ReplicaChannel;
use crate::repl::wire::{FrameEntry, Message};
use crate::repl::{ReplicaId, ReplicaProgress, ReplicaState, ReplicaStatus};
use crate::types::{Epoch, Lsn};
use crate::wal::WalManager;

/// Coordinator tunables.
#[derive(Clone, Copy, Debug)]
pub struct ReplicationConfig {
    /// Synchronous replicas that must flush a commit LSN before the commit
    /// returns. Zero means commits never wait.
    pub quorum: usize,
    /// A replica whose last ack is older than this is demoted.
    pub ack_timeout: Duration,
    /// Idle-stream keepalive interval.
    pub heartbeat_interval: Duration,
    /// Maximum WAL frames per Records message.
    pub batch_limit: usize,
    /// Optional upper bound on a single quorum wait.
    pub commit_timeout: Option<Duration>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            quorum: 0,
            ack_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(1),
            batch_limit: 128,
            commit_timeout: None,
        }
    }
}

struct Member {
    synchronous: bool,
    state: ReplicaState,
    progress: ReplicaProgress,
    last_ack: Instant,
}

struct CoordState {
    epoch: Epoch,
    fenced_by: Option<Epoch>,
    quorum: usize,
    ack_timeout: Duration,
    next_id: u32,
    members: HashMap<ReplicaId, Member>,
}

struct CoordShared {
    wal: Arc<WalManager>,
    state: Mutex<CoordState>,
    ack_cv: Condvar,
    stop: AtomicBool,
    heartbeat_interval: Duration,
    batch_limit: usize,
}

impl CoordShared {
    fn fence(&self, observed: Epoch) {
        let mut state = self.state.lock();
        if state.fenced_by.is_none() && state.epoch < observed {
            warn!(ours = %state.epoch, %observed, "repl.primary.fenced");
            state.fenced_by = Some(observed);
            self.ack_cv.notify_all();
        }
    }

    fn mark_disconnected(&self, id: ReplicaId) {
        let mut state = self.state.lock();
        if let Some(member) = state.members.get_mut(&id) {
            if member.state != ReplicaState::Disconnected {
                warn!(%id, "repl.replica.disconnected");
                member.state = ReplicaState::Disconnected;
            }
        }
        self.ack_cv.notify_all();
    }

    fn stopped(&self, id: ReplicaId) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return true;
        }
        let state = self.state.lock();
        match state.members.get(&id) {
            Some(member) => member.state == ReplicaState::Disconnected,
            None => true,
        }
    }
}

/// Primary-side replication state and worker threads.
pub struct Coordinator {
    shared: Arc<CoordShared>,
    config: ReplicationConfig,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Creates a coordinator streaming from `wal` under `epoch`.
    pub fn new(wal: Arc<WalManager>, epoch: Epoch, config: ReplicationConfig) -> Self {
        Self {
            shared: Arc::new(CoordShared {
                wal,
                state: Mutex::new(CoordState {
                    epoch,
                    fenced_by: None,
                    quorum: config.quorum,
                    ack_timeout: config.ack_timeout,
                    next_id: 0,
                    members: HashMap::new(),
                }),
                ack_cv: Condvar::new(),
                stop: AtomicBool::new(false),
                heartbeat_interval: config.heartbeat_interval,
                batch_limit: config.batch_limit,
            }),
            config,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// The current replication epoch.
    pub fn epoch(&self) -> Epoch {
        self.shared.state.lock().epoch
    }

    /// The epoch that fenced this primary, if any ack carried a newer one.
    pub fn fenced_by(&self) -> Option<Epoch> {
        self.shared.state.lock().fenced_by
    }

    /// Fails with `StalePrimary` once a newer epoch has been observed.
    pub fn check_not_fenced(&self) -> Result<()> {
        match self.fenced_by() {
            Some(observed) => Err(HeartwoodError::StalePrimary { observed }),
            None => Ok(()),
        }
    }

    /// Registers a replica and spawns its sender thread.
    pub fn add_replica(
        &self,
        channel: Box<dyn ReplicaChannel>,
        synchronous: bool,
    ) -> Result<ReplicaId> {
        let id = {
            let mut state = self.shared.state.lock();
            let id = ReplicaId(state.next_id);
            state.next_id += 1;
            state.members.insert(
                id,
                Member {
                    synchronous,
                    state: ReplicaState::Connecting,
                    progress: ReplicaProgress::default(),
                    last_ack: Instant::now(),
                },
            );
            id
        };
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("heartwood-repl-{}", id.0))
            .spawn(move || run_sender(shared, id, channel))
            .map_err(HeartwoodError::Io)?;
        self.threads.lock().push(handle);
        info!(%id, synchronous, "repl.replica.added");
        Ok(id)
    }

    /// Drops a replica from the membership table. Its thread winds down on
    /// its own once it observes the state.
    pub fn remove_replica(&self, id: ReplicaId) {
        let mut state = self.shared.state.lock();
        if state.members.remove(&id).is_some() {
            info!(%id, "repl.replica.removed");
        }
        drop(state);
        self.shared.ack_cv.notify_all();
    }

    /// Changes the number of synchronous acknowledgments a commit needs,
    /// re-evaluating any stalled quorum waits.
    pub fn reconfigure_quorum(&self, quorum: usize) {
        let mut state = self.shared.state.lock();
        info!(old = state.quorum, new = quorum, "repl.quorum.reconfigured");
        state.quorum = quorum;
        drop(state);
        self.shared.ack_cv.notify_all();
    }

    /// Blocks until `quorum` synchronous replicas have flushed `lsn`.
    ///
    /// Replicas with stale acks are demoted inside the loop; if the quorum
    /// cannot currently be met the wait blocks until membership, progress,
    /// or configuration changes.
    pub fn wait_for_quorum(&self, lsn: Lsn) -> Result<()> {
        let started = Instant::now();
        let mut state = self.shared.state.lock();
        loop {
            if let Some(observed) = state.fenced_by {
                return Err(HeartwoodError::StalePrimary { observed });
            }
            let now = Instant::now();
            let ack_timeout = state.ack_timeout;
            for (id, member) in state.members.iter_mut() {
                if member.state != ReplicaState::Disconnected
                    && member.state != ReplicaState::Connecting
                    && now.duration_since(member.last_ack) > ack_timeout
                {
                    warn!(id = %id, "repl.replica.demoted");
                    member.state = ReplicaState::Disconnected;
                }
            }
            let acked = state
                .members
                .values()
                .filter(|m| {
                    // A Connecting member has never acked; its zeroed
                    // progress must not satisfy a wait at a low LSN.
                    m.synchronous
                        && m.state != ReplicaState::Disconnected
                        && m.state != ReplicaState::Connecting
                        && m.progress.flushed >= lsn
                })
                .count();
            if acked >= state.quorum {
                return Ok(());
            }
            if let Some(limit) = self.config.commit_timeout {
                if started.elapsed() >= limit {
                    warn!(%lsn, acked, need = state.quorum, "repl.quorum.timeout");
                    return Err(HeartwoodError::ReplicationTimeout);
                }
            }
            debug!(%lsn, acked, need = state.quorum, "repl.quorum.wait");
            self.shared
                .ack_cv
                .wait_for(&mut state, Duration::from_millis(20));
        }
    }

    /// Snapshot of the membership table for the status surface.
    pub fn statuses(&self) -> Vec<ReplicaStatus> {
        let state = self.shared.state.lock();
        let mut out: Vec<ReplicaStatus> = state
            .members
            .iter()
            .map(|(&id, m)| ReplicaStatus {
                id,
                synchronous: m.synchronous,
                state: m.state,
                progress: m.progress,
                last_ack: m.last_ack,
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Stops every sender thread and joins them.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.ack_cv.notify_all();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const RECV_POLL: Duration = Duration::from_millis(10);

fn run_sender(shared: Arc<CoordShared>, id: ReplicaId, channel: Box<dyn ReplicaChannel>) {
    // Phase one: wait for the replica's Start message.
    let mut cursor = loop {
        if shared.stopped(id) {
            return;
        }
        match channel.recv(RECV_POLL) {
            Ok(Some(Message::Start { start_lsn, epoch })) => {
                shared.fence(epoch);
                let mut state = shared.state.lock();
                let our_epoch = state.epoch;
                if let Some(member) = state.members.get_mut(&id) {
                    member.state = ReplicaState::Streaming;
                    member.last_ack = Instant::now();
                }
                drop(state);
                debug!(%id, %start_lsn, %our_epoch, "repl.stream.started");
                break start_lsn;
            }
            Ok(Some(_)) | Ok(None) => continue,
            Err(_) => {
                shared.mark_disconnected(id);
                return;
            }
        }
    };

    let mut last_sent = Instant::now();
    loop {
        if shared.stopped(id) {
            return;
        }

        // Drain acks.
        loop {
            match channel.recv(RECV_POLL) {
                Ok(Some(Message::Ack {
                    received,
                    flushed,
                    applied,
                    epoch,
                })) => {
                    shared.fence(epoch);
                    let durable = shared.wal.durable_lsn();
                    let mut state = shared.state.lock();
                    if let Some(member) = state.members.get_mut(&id) {
                        member.progress = ReplicaProgress {
                            received,
                            flushed,
                            applied,
                        };
                        member.last_ack = Instant::now();
                        member.state = if flushed >= durable {
                            ReplicaState::Synchronous
                        } else {
                            ReplicaState::Streaming
                        };
                    }
                    drop(state);
                    shared.ack_cv.notify_all();
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    shared.mark_disconnected(id);
                    return;
                }
            }
        }

        // Stream newly durable frames.
        let durable = shared.wal.durable_lsn();
        if cursor < durable {
            let mut reader = shared.wal.read_from(cursor);
            let mut entries: Vec<FrameEntry> = Vec::new();
            loop {
                if entries.len() >= shared.batch_limit {
                    break;
                }
                match reader.next_record() {
                    Ok(Some(read)) => entries.push(FrameEntry {
                        lsn: read.lsn,
                        frame: read.frame.clone(),
                    }),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            let next = reader.position();
            if !entries.is_empty() {
                let epoch = shared.state.lock().epoch;
                if channel.send(&Message::Records { entries, epoch }).is_err() {
                    shared.mark_disconnected(id);
                    return;
                }
                cursor = next;
                last_sent = Instant::now();
                continue;
            }
            cursor = next;
        }

        // Idle keepalive.
        if last_sent.elapsed() >= shared.heartbeat_interval {
            let epoch = shared.state.lock().epoch;
            let msg = Message::Heartbeat {
                end_lsn: durable,
                epoch,
            };
            if channel.send(&msg).is_err() {
                shared.mark_disconnected(id);
                return;
            }
            last_sent = Instant::now();
        }
    }
}
