//! Transaction table, snapshots, and wraparound accounting.
//!
//! Ids come from the wrapping counter in [`crate::types::xid`]. A snapshot
//! captures the visibility boundaries at transaction start: the low-water
//! mark (oldest id still in progress), the high-water mark (last assigned
//! id), and the exact set of concurrently in-progress ids. The age of the
//! oldest possibly-unfrozen id is checked at every `begin`; crossing the
//! stop threshold refuses new transactions outright.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::{HeartwoodError, Result};
use crate::types::{Epoch, TxnId, FIRST_NORMAL_XID, INVALID_XID};

/// Commit state of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    /// Started, neither committed nor aborted.
    InProgress,
    /// Durably committed.
    Committed,
    /// Rolled back (explicitly, or implicitly by crash recovery).
    Aborted,
}

/// Visibility boundaries captured at transaction start.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// Oldest transaction id that was in progress at capture time.
    pub low_water: TxnId,
    /// Last transaction id assigned at capture time; ids after it began
    /// after this snapshot.
    pub high_water: TxnId,
    /// Ids in progress at capture time (excluding the owner).
    pub in_progress: Vec<TxnId>,
}

impl Snapshot {
    /// True when `xid` was in progress when this snapshot was taken.
    pub fn saw_in_progress(&self, xid: TxnId) -> bool {
        self.in_progress.contains(&xid)
    }

    /// True when `xid` had not been assigned when this snapshot was taken.
    pub fn saw_as_future(&self, xid: TxnId) -> bool {
        self.high_water.precedes(xid)
    }
}

/// A live transaction handle: id, snapshot, and command counter.
#[derive(Debug)]
pub struct Transaction {
    /// This transaction's id.
    pub id: TxnId,
    /// Snapshot taken at start; all reads evaluate against it.
    pub snapshot: Snapshot,
    /// Replication epoch the transaction was started under.
    pub epoch: Epoch,
    /// Command counter; bumped after each statement so later commands see
    /// earlier ones' writes.
    pub command: u16,
    finished: bool,
}

impl Transaction {
    /// Advances the command counter.
    pub fn next_command(&mut self) {
        self.command = self.command.saturating_add(1);
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// True once the transaction has committed or aborted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Wraparound thresholds, in transactions of age.
#[derive(Clone, Copy, Debug)]
pub struct WraparoundPolicy {
    /// Versions older than this are frozen by the reclaimer.
    pub freeze_age: u32,
    /// Reclaimer escalates to an unthrottled pass at this age.
    pub danger_age: u32,
    /// New transactions are refused at this age.
    pub stop_age: u32,
}

impl Default for WraparoundPolicy {
    fn default() -> Self {
        Self {
            freeze_age: 50_000_000,
            danger_age: 1_000_000_000,
            stop_age: 2_000_000_000,
        }
    }
}

struct TxnTable {
    next_xid: TxnId,
    frozen_watermark: TxnId,
    statuses: HashMap<u32, TxnStatus>,
    in_progress: HashSet<u32>,
}

/// Assigns ids, tracks commit status, and answers snapshot queries.
pub struct TxnManager {
    policy: WraparoundPolicy,
    inner: Mutex<TxnTable>,
}

impl TxnManager {
    /// Creates a manager resuming from `next_xid` and `frozen_watermark`
    /// (both recovered from the meta block / WAL).
    pub fn new(next_xid: TxnId, frozen_watermark: TxnId, policy: WraparoundPolicy) -> Self {
        let next_xid = if next_xid.is_special() {
            FIRST_NORMAL_XID
        } else {
            next_xid
        };
        let frozen_watermark = if frozen_watermark.is_special() {
            next_xid
        } else {
            frozen_watermark
        };
        Self {
            policy,
            inner: Mutex::new(TxnTable {
                next_xid,
                frozen_watermark,
                statuses: HashMap::new(),
                in_progress: HashSet::new(),
            }),
        }
    }

    /// The configured wraparound thresholds.
    pub fn policy(&self) -> WraparoundPolicy {
        self.policy
    }

    /// Age in transactions of the oldest possibly-unfrozen id.
    pub fn oldest_unfrozen_age(&self) -> u32 {
        let table = self.inner.lock();
        table.next_xid.age_from(table.frozen_watermark)
    }

    /// True once the danger threshold is crossed and the reclaimer should
    /// run unthrottled.
    pub fn wraparound_danger(&self) -> bool {
        self.oldest_unfrozen_age() >= self.policy.danger_age
    }

    /// Starts a transaction: assigns an id and captures a snapshot.
    pub fn begin(&self, epoch: Epoch) -> Result<Transaction> {
        let mut table = self.inner.lock();
        let age = table.next_xid.age_from(table.frozen_watermark);
        if age >= self.policy.stop_age {
            error!(age, "txn.begin.wraparound_fatal");
            return Err(HeartwoodError::WraparoundFatal { age });
        }
        if age >= self.policy.danger_age {
            warn!(age, "txn.begin.wraparound_danger");
        }
        let id = table.next_xid;
        table.next_xid = table.next_xid.advance();
        let mut in_progress: Vec<TxnId> = table.in_progress.iter().map(|&x| TxnId(x)).collect();
        in_progress.sort_by(|a, b| {
            if a.precedes(*b) {
                std::cmp::Ordering::Less
            } else if a == b {
                std::cmp::Ordering::Equal
            } else {
                std::cmp::Ordering::Greater
            }
        });
        let low_water = in_progress.first().copied().unwrap_or(id);
        table.in_progress.insert(id.0);
        table.statuses.insert(id.0, TxnStatus::InProgress);
        Ok(Transaction {
            id,
            snapshot: Snapshot {
                low_water,
                high_water: id,
                in_progress,
            },
            epoch,
            command: 0,
            finished: false,
        })
    }

    /// A read-only snapshot that consumes no transaction id. Standbys use
    /// this to serve reads while the apply loop keeps assigning ids it
    /// observes from the primary's log.
    pub fn read_view(&self, epoch: Epoch) -> Transaction {
        let table = self.inner.lock();
        let mut in_progress: Vec<TxnId> = table.in_progress.iter().map(|&x| TxnId(x)).collect();
        in_progress.sort_by(|a, b| {
            if a.precedes(*b) {
                std::cmp::Ordering::Less
            } else if a == b {
                std::cmp::Ordering::Equal
            } else {
                std::cmp::Ordering::Greater
            }
        });
        // Last assigned id; everything from next_xid on is future.
        let high_water = {
            let prev = table.next_xid.0.wrapping_sub(1);
            if prev < FIRST_NORMAL_XID.0 {
                TxnId(u32::MAX)
            } else {
                TxnId(prev)
            }
        };
        let low_water = in_progress.first().copied().unwrap_or(table.next_xid);
        Transaction {
            id: INVALID_XID,
            snapshot: Snapshot {
                low_water,
                high_water,
                in_progress,
            },
            epoch,
            command: 0,
            finished: false,
        }
    }

    /// Records a commit.
    pub fn mark_committed(&self, xid: TxnId) {
        let mut table = self.inner.lock();
        table.statuses.insert(xid.0, TxnStatus::Committed);
        table.in_progress.remove(&xid.0);
    }

    /// Records an abort.
    pub fn mark_aborted(&self, xid: TxnId) {
        let mut table = self.inner.lock();
        table.statuses.insert(xid.0, TxnStatus::Aborted);
        table.in_progress.remove(&xid.0);
    }

    /// Registers an id observed during WAL replay as in progress until its
    /// commit or abort record is seen.
    pub fn observe_replayed(&self, xid: TxnId) {
        if xid.is_special() {
            return;
        }
        let mut table = self.inner.lock();
        if xid.precedes(table.next_xid) {
            // Already counted.
        } else {
            table.next_xid = xid.advance();
        }
        table
            .statuses
            .entry(xid.0)
            .or_insert(TxnStatus::InProgress);
        if table.statuses[&xid.0] == TxnStatus::InProgress {
            table.in_progress.insert(xid.0);
        }
    }

    /// Seeds commit statuses persisted by a previous incarnation. Runs
    /// before WAL replay, so replayed records for these ids keep their
    /// Committed reading.
    pub fn restore_committed(&self, xids: &[TxnId]) {
        let mut table = self.inner.lock();
        for xid in xids {
            if xid.is_special() {
                continue;
            }
            table.statuses.insert(xid.0, TxnStatus::Committed);
            if table.next_xid.precedes_eq(*xid) {
                table.next_xid = xid.advance();
            }
        }
    }

    /// The committed ids at or after `cutoff`, sorted, for persistence.
    /// Older ids are pruned: the freeze watermark guarantees no surviving
    /// tuple still carries them.
    pub fn committed_xids(&self, cutoff: TxnId) -> Vec<TxnId> {
        let table = self.inner.lock();
        let mut out: Vec<TxnId> = table
            .statuses
            .iter()
            .filter(|(_, status)| **status == TxnStatus::Committed)
            .map(|(&raw, _)| TxnId(raw))
            .filter(|xid| !xid.precedes(cutoff))
            .collect();
        out.sort_by(|a, b| {
            if a.precedes(*b) {
                std::cmp::Ordering::Less
            } else if a == b {
                std::cmp::Ordering::Equal
            } else {
                std::cmp::Ordering::Greater
            }
        });
        out
    }

    /// Fast-forwards the id counter to at least `next`, as recorded by a
    /// replayed checkpoint.
    pub fn observe_next_xid(&self, next: TxnId) {
        if next.is_special() {
            return;
        }
        let mut table = self.inner.lock();
        if table.next_xid.precedes(next) {
            table.next_xid = next;
        }
    }

    /// Aborts every transaction still marked in progress; recovery calls
    /// this after replay, since no commit record means no commit.
    pub fn abort_all_in_progress(&self) {
        let mut table = self.inner.lock();
        let orphaned: Vec<u32> = table.in_progress.drain().collect();
        for xid in orphaned {
            table.statuses.insert(xid, TxnStatus::Aborted);
        }
    }

    /// Commit status of `xid`. The frozen sentinel is always committed;
    /// a normal id with no surviving table entry was aborted.
    pub fn status(&self, xid: TxnId) -> TxnStatus {
        if xid.is_frozen() {
            return TxnStatus::Committed;
        }
        if xid.is_special() {
            return TxnStatus::Aborted;
        }
        self.inner
            .lock()
            .statuses
            .get(&xid.0)
            .copied()
            .unwrap_or(TxnStatus::Aborted)
    }

    /// The oldest in-progress id, if any transaction is running.
    pub fn oldest_in_progress(&self) -> Option<TxnId> {
        let table = self.inner.lock();
        table
            .in_progress
            .iter()
            .map(|&x| TxnId(x))
            .fold(None, |acc, x| match acc {
                None => Some(x),
                Some(cur) if x.precedes(cur) => Some(x),
                Some(cur) => Some(cur),
            })
    }

    /// Global low-water mark: versions deleted before this id are invisible
    /// to every present and future snapshot.
    pub fn global_low_water(&self) -> TxnId {
        self.oldest_in_progress()
            .unwrap_or_else(|| self.inner.lock().next_xid)
    }

    /// Next id to be assigned.
    pub fn next_xid(&self) -> TxnId {
        self.inner.lock().next_xid
    }

    /// Oldest possibly-unfrozen id.
    pub fn frozen_watermark(&self) -> TxnId {
        self.inner.lock().frozen_watermark
    }

    /// Moves the frozen watermark forward (never backward) and drops status
    /// entries that can no longer be consulted.
    pub fn advance_frozen_watermark(&self, new: TxnId) {
        let mut table = self.inner.lock();
        if table.frozen_watermark.precedes(new) {
            table.frozen_watermark = new;
            let keep: Vec<u32> = table
                .statuses
                .keys()
                .copied()
                .filter(|&x| !TxnId(x).precedes(new) || table.in_progress.contains(&x))
                .collect();
            let kept: HashMap<u32, TxnStatus> = keep
                .into_iter()
                .map(|x| (x, table.statuses[&x]))
                .collect();
            table.statuses = kept;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TxnManager {
        TxnManager::new(FIRST_NORMAL_XID, FIRST_NORMAL_XID, WraparoundPolicy::default())
    }

    #[test]
    fn snapshot_excludes_owner_and_captures_concurrent() {
        let mgr = manager();
        let t1 = mgr.begin(Epoch(0)).unwrap();
        let t2 = mgr.begin(Epoch(0)).unwrap();
        assert!(t1.id.precedes(t2.id));
        assert!(t2.snapshot.saw_in_progress(t1.id));
        assert!(!t2.snapshot.saw_in_progress(t2.id));
        assert_eq!(t2.snapshot.high_water, t2.id);
        assert_eq!(t2.snapshot.low_water, t1.id);
    }

    #[test]
    fn status_transitions() {
        let mgr = manager();
        let t = mgr.begin(Epoch(0)).unwrap();
        assert_eq!(mgr.status(t.id), TxnStatus::InProgress);
        mgr.mark_committed(t.id);
        assert_eq!(mgr.status(t.id), TxnStatus::Committed);
        assert_eq!(mgr.status(TxnId(9999)), TxnStatus::Aborted);
        assert_eq!(mgr.status(crate::types::FROZEN_XID), TxnStatus::Committed);
    }

    #[test]
    fn committed_set_round_trips_into_a_fresh_table() {
        let mgr = manager();
        let committed = mgr.begin(Epoch(0)).unwrap();
        let aborted = mgr.begin(Epoch(0)).unwrap();
        mgr.mark_committed(committed.id);
        mgr.mark_aborted(aborted.id);

        let saved = mgr.committed_xids(FIRST_NORMAL_XID);
        assert_eq!(saved, vec![committed.id]);

        // A new incarnation knows nothing until the set is restored.
        let reopened = manager();
        assert_eq!(reopened.status(committed.id), TxnStatus::Aborted);
        reopened.restore_committed(&saved);
        assert_eq!(reopened.status(committed.id), TxnStatus::Committed);
        assert_eq!(reopened.status(aborted.id), TxnStatus::Aborted);
        assert!(committed.id.precedes(reopened.next_xid()));
    }

    #[test]
    fn committed_xids_prunes_below_the_cutoff() {
        let mgr = manager();
        let old = mgr.begin(Epoch(0)).unwrap();
        let recent = mgr.begin(Epoch(0)).unwrap();
        mgr.mark_committed(old.id);
        mgr.mark_committed(recent.id);
        assert_eq!(mgr.committed_xids(recent.id), vec![recent.id]);
    }

    #[test]
    fn global_low_water_tracks_oldest() {
        let mgr = manager();
        let t1 = mgr.begin(Epoch(0)).unwrap();
        let t2 = mgr.begin(Epoch(0)).unwrap();
        assert_eq!(mgr.global_low_water(), t1.id);
        mgr.mark_committed(t1.id);
        assert_eq!(mgr.global_low_water(), t2.id);
        mgr.mark_aborted(t2.id);
        assert_eq!(mgr.global_low_water(), mgr.next_xid());
    }

    #[test]
    fn stop_age_refuses_new_transactions() {
        let policy = WraparoundPolicy {
            freeze_age: 4,
            danger_age: 6,
            stop_age: 8,
        };
        let mgr = TxnManager::new(FIRST_NORMAL_XID, FIRST_NORMAL_XID, policy);
        let mut started = 0;
        loop {
            match mgr.begin(Epoch(0)) {
                Ok(txn) => {
                    mgr.mark_committed(txn.id);
                    started += 1;
                }
                Err(HeartwoodError::WraparoundFatal { age }) => {
                    assert!(age >= policy.stop_age);
                    break;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
            assert!(started < 20, "stop threshold never hit");
        }
        // Advancing the watermark (a vacuum pass) lifts the stop.
        mgr.advance_frozen_watermark(mgr.next_xid());
        assert!(mgr.begin(Epoch(0)).is_ok());
    }

    #[test]
    fn watermark_never_regresses() {
        let mgr = manager();
        let t = mgr.begin(Epoch(0)).unwrap();
        mgr.mark_committed(t.id);
        mgr.advance_frozen_watermark(TxnId(100));
        mgr.advance_frozen_watermark(TxnId(50));
        assert_eq!(mgr.frozen_watermark(), TxnId(100));
    }
}
