//! The engine context object: startup recovery, the transactional API,
//! checkpointing, replication wiring, and the admin status surface.
//!
//! All global mutable state lives here with explicit initialization
//! ([`Engine::open`]) and teardown ([`Engine::close`]): the WAL append
//! position, the transaction table, the page cache and key index, and the
//! replica membership set. Tuple mutation happens under one core mutex
//! whose critical sections never span an fsync; commits do their waiting
//! (WAL flush, replication quorum) outside it.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{HeartwoodError, Result};
use crate::mvcc::VersionStore;
use crate::primitives::io::StdFileIo;
use crate::repl::transport::ReplicaChannel;
use crate::repl::{Coordinator, ReplicaId};
use crate::storage::heap::Heap;
use crate::storage::page::{TupleHeader, PAGE_FLAG_ALL_FROZEN, TUPLE_HDR_LEN};
use crate::storage::store::{PageStore, StoreOptions};
use crate::txn::{Transaction, TxnManager, TxnStatus};
use crate::types::{Epoch, Lsn, PageId, TxnId, VersionId, INVALID_XID};
use crate::vacuum::{Reclaimable, VacuumMode, VacuumStats, VacuumWorker};
use crate::wal::{RecordBody, WalManager, WalOptions, WalRecord};

pub(crate) mod clog;
pub mod config;
pub(crate) mod meta;
pub(crate) mod redo;
pub mod status;

pub use config::Config;
pub use status::{EngineStatus, ReplicaLag, Role};

use meta::Meta;

struct Core {
    vs: VersionStore,
    // Pages already imaged in the WAL since the last checkpoint.
    fpi_done: HashSet<PageId>,
}

pub(crate) struct EngineInner {
    config: Config,
    meta_path: PathBuf,
    clog_path: PathBuf,
    salt: u64,
    wal: Arc<WalManager>,
    txns: TxnManager,
    repl: Coordinator,
    core: Mutex<Core>,
    closed: AtomicBool,
}

/// A single-node storage engine instance in the primary role.
pub struct Engine {
    inner: Arc<EngineInner>,
    vacuum: Mutex<Option<VacuumWorker>>,
}

impl Engine {
    /// Opens (or creates) the data directory and recovers to a consistent
    /// state: meta block, WAL replay from the redo point, orphan aborts,
    /// index rebuild.
    pub fn open(config: Config) -> Result<Engine> {
        fs::create_dir_all(&config.dir)?;
        let wal_dir = config.dir.join("wal");
        fs::create_dir_all(&wal_dir)?;
        let meta_path = config.dir.join("meta");

        let meta = match Meta::load(&meta_path)? {
            Some(meta) => {
                if meta.page_size != config.page_size {
                    return Err(HeartwoodError::Invalid(
                        "page size does not match the data directory",
                    ));
                }
                meta
            }
            None => {
                let meta = Meta {
                    page_size: config.page_size,
                    salt: rand::random::<u64>(),
                    epoch: Epoch(0),
                    redo: Lsn::ZERO,
                    next_xid: crate::types::FIRST_NORMAL_XID,
                    frozen_watermark: crate::types::FIRST_NORMAL_XID,
                };
                meta.store(&meta_path)?;
                meta
            }
        };

        let io = StdFileIo::open(config.dir.join("heap.db"))?;
        let store = PageStore::open(
            Arc::new(io),
            StoreOptions {
                page_size: config.page_size,
            },
        )?;
        let mut vs = VersionStore::new(Heap::new(store));
        let txns = TxnManager::new(meta.next_xid, meta.frozen_watermark, config.wraparound);
        // Commit records before the redo point have been recycled; the
        // persisted commit log carries their outcomes across restarts.
        let clog_path = config.dir.join("clog");
        txns.restore_committed(&clog::load(&clog_path)?);

        let wal = Arc::new(WalManager::open(WalOptions {
            dir: wal_dir,
            segment_size: config.wal_segment_size,
            flush_threshold: config.wal_flush_threshold,
            flush_interval: config.wal_flush_interval,
            recover_from: meta.redo,
        })?);

        // Replay: the pre-replay index lets chained inserts find their
        // chain tails; the post-replay rebuild is authoritative.
        vs.rebuild_index()?;
        let mut replayed = 0u64;
        let mut reader = wal.read_from(meta.redo);
        while let Some(read) = reader.next_record()? {
            redo::apply_record(&mut vs, &txns, &read)?;
            replayed += 1;
        }
        txns.abort_all_in_progress();
        vs.rebuild_index()?;
        info!(
            records = replayed,
            redo = %meta.redo,
            end = %wal.durable_lsn(),
            keys = vs.key_count(),
            "engine.recovery.completed"
        );

        wal.start_timer(config.wal_flush_interval);
        let repl = Coordinator::new(Arc::clone(&wal), meta.epoch, config.replication);

        let inner = Arc::new(EngineInner {
            meta_path,
            clog_path,
            salt: meta.salt,
            wal,
            txns,
            repl,
            core: Mutex::new(Core {
                vs,
                fpi_done: HashSet::new(),
            }),
            closed: AtomicBool::new(false),
            config,
        });
        let vacuum = if inner.config.vacuum_enabled {
            let target: Arc<dyn Reclaimable> = inner.clone();
            Some(VacuumWorker::start(target, inner.config.vacuum))
        } else {
            None
        };
        Ok(Engine {
            inner,
            vacuum: Mutex::new(vacuum),
        })
    }

    /// Starts a transaction under the current epoch.
    pub fn begin(&self) -> Result<Transaction> {
        self.inner.repl.check_not_fenced()?;
        self.inner.txns.begin(self.inner.repl.epoch())
    }

    /// Returns the newest version of `key` visible to `txn` and its
    /// payload, or `NotFound`.
    pub fn read(&self, txn: &Transaction, key: &[u8]) -> Result<(VersionId, Vec<u8>)> {
        let mut core = self.inner.core.lock();
        core.vs
            .read(&self.inner.txns, txn, key)?
            .ok_or(HeartwoodError::NotFound)
    }

    /// Inserts a new row version under `key`.
    pub fn insert(&self, txn: &mut Transaction, key: &[u8], payload: &[u8]) -> Result<VersionId> {
        self.inner.check_writable(txn)?;
        let placed = {
            let mut core = self.inner.core.lock();
            self.inner.insert_version(&mut core, txn, key, payload, true)?
        };
        txn.next_command();
        Ok(placed)
    }

    /// Replaces the row version at `version`: stamps it deleted and links a
    /// new version holding `payload`. Fails with `WriteConflict` when any
    /// non-aborted transaction got there first.
    pub fn update(
        &self,
        txn: &mut Transaction,
        version: VersionId,
        payload: &[u8],
    ) -> Result<VersionId> {
        self.inner.check_writable(txn)?;
        let new_version = {
            let mut core = self.inner.core.lock();
            core.vs.check_write(&self.inner.txns, txn, version)?;
            let key = core.vs.heap_mut().tuple_key(version)?;
            let new_version = self.inner.insert_version(&mut core, txn, &key, payload, false)?;
            self.inner.mark_deleted(&mut core, txn, version, new_version)?;
            new_version
        };
        txn.next_command();
        Ok(new_version)
    }

    /// Deletes the row version at `version`. Fails with `WriteConflict`
    /// when any non-aborted transaction got there first.
    pub fn delete(&self, txn: &mut Transaction, version: VersionId) -> Result<()> {
        self.inner.check_writable(txn)?;
        {
            let mut core = self.inner.core.lock();
            core.vs.check_write(&self.inner.txns, txn, version)?;
            self.inner.mark_deleted(&mut core, txn, version, VersionId::NULL)?;
        }
        txn.next_command();
        Ok(())
    }

    /// Commits: appends the commit record, waits for local durability,
    /// makes the transaction visible, then blocks until the synchronous
    /// quorum has flushed the commit position.
    pub fn commit(&self, txn: &mut Transaction) -> Result<Lsn> {
        self.inner.repl.check_not_fenced()?;
        if txn.is_finished() {
            return Err(HeartwoodError::Invalid("transaction already finished"));
        }
        let record = WalRecord {
            epoch: self.inner.repl.epoch(),
            xid: txn.id,
            body: RecordBody::Commit,
        };
        let lsn = self.inner.wal.append(&record)?;
        self.inner.wal.flush_all()?;
        let durable = self.inner.wal.durable_lsn();
        self.inner.txns.mark_committed(txn.id);
        txn.mark_finished();
        self.inner.repl.wait_for_quorum(durable)?;
        debug!(xid = txn.id.0, %lsn, "engine.txn.committed");
        Ok(lsn)
    }

    /// Aborts: appends the abort record and releases the transaction.
    /// Never waits for replication.
    pub fn abort(&self, txn: &mut Transaction) -> Result<()> {
        if txn.is_finished() {
            return Ok(());
        }
        let record = WalRecord {
            epoch: self.inner.repl.epoch(),
            xid: txn.id,
            body: RecordBody::Abort,
        };
        self.inner.wal.append(&record)?;
        self.inner.txns.mark_aborted(txn.id);
        txn.mark_finished();
        debug!(xid = txn.id.0, "engine.txn.aborted");
        Ok(())
    }

    /// Flushes the WAL, writes back all dirty pages, and advances the redo
    /// point. Returns the new redo LSN.
    pub fn checkpoint(&self) -> Result<Lsn> {
        Reclaimable::checkpoint(&*self.inner)
    }

    /// Runs one reclaim pass synchronously.
    pub fn vacuum(&self, mode: VacuumMode) -> Result<VacuumStats> {
        let budget = match mode {
            VacuumMode::Throttled => Some(self.inner.config.vacuum.budget),
            VacuumMode::Aggressive => None,
        };
        self.inner.reclaim_pass(mode, budget)
    }

    /// Registers a replica channel; it starts streaming once the replica
    /// sends its Start message.
    pub fn add_replica(
        &self,
        channel: Box<dyn ReplicaChannel>,
        synchronous: bool,
    ) -> Result<ReplicaId> {
        self.inner.repl.add_replica(channel, synchronous)
    }

    /// Removes a replica from the membership table.
    pub fn remove_replica(&self, id: ReplicaId) {
        self.inner.repl.remove_replica(id);
    }

    /// Changes the synchronous-commit quorum size.
    pub fn reconfigure_quorum(&self, quorum: usize) {
        self.inner.repl.reconfigure_quorum(quorum);
    }

    /// A primary cannot be promoted; promotion belongs to
    /// [`crate::repl::Standby`].
    pub fn promote(&self) -> Result<Epoch> {
        Err(HeartwoodError::Invalid("instance is already the primary"))
    }

    /// The current replication epoch.
    pub fn epoch(&self) -> Epoch {
        self.inner.repl.epoch()
    }

    /// Point-in-time status for operators.
    pub fn status(&self) -> EngineStatus {
        let durable = self.inner.wal.durable_lsn();
        let replicas = self
            .inner
            .repl
            .statuses()
            .into_iter()
            .map(|s| ReplicaLag {
                id: s.id,
                synchronous: s.synchronous,
                state: s.state,
                progress: s.progress,
                lag_bytes: durable.0.saturating_sub(s.progress.flushed.0),
            })
            .collect();
        EngineStatus {
            role: Role::Primary,
            epoch: self.inner.repl.epoch(),
            current_lsn: self.inner.wal.next_lsn(),
            durable_lsn: durable,
            next_xid: self.inner.txns.next_xid(),
            oldest_unfrozen_age: self.inner.txns.oldest_unfrozen_age(),
            wraparound_danger: self.inner.txns.wraparound_danger(),
            keys: self.inner.core.lock().vs.key_count(),
            replicas,
        }
    }

    /// Clean shutdown: stops workers, checkpoints, and closes the WAL.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut worker) = self.vacuum.lock().take() {
            worker.stop();
        }
        let checkpoint = Reclaimable::checkpoint(&*self.inner);
        self.inner.repl.shutdown();
        self.inner.wal.shutdown()?;
        checkpoint?;
        info!("engine.closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "engine.close.failed");
        }
    }
}

impl EngineInner {
    fn check_writable(&self, txn: &Transaction) -> Result<()> {
        self.repl.check_not_fenced()?;
        if txn.is_finished() {
            return Err(HeartwoodError::Invalid("transaction already finished"));
        }
        Ok(())
    }

    /// Logs a full image of `page` if this is its first mutation since the
    /// last checkpoint. Must run before the mutation is applied.
    fn log_page_touch(&self, core: &mut Core, page: PageId) -> Result<()> {
        if !core.fpi_done.insert(page) {
            return Ok(());
        }
        let image = core.vs.heap_mut().page_image(page)?;
        let record = WalRecord {
            epoch: self.repl.epoch(),
            xid: INVALID_XID,
            body: RecordBody::FullPageImage { page, image },
        };
        let lsn = self.wal.append(&record)?;
        core.vs.heap_mut().stamp_lsn(page, lsn)?;
        Ok(())
    }

    fn insert_version(
        &self,
        core: &mut Core,
        txn: &Transaction,
        key: &[u8],
        payload: &[u8],
        chained: bool,
    ) -> Result<VersionId> {
        let tuple_len = TUPLE_HDR_LEN + key.len() + payload.len();
        let plan = core.vs.plan_insert(key, tuple_len)?;
        self.log_page_touch(core, plan.page)?;
        if chained {
            if let Some(tail) = plan.tail {
                self.log_page_touch(core, tail.page())?;
            }
        }
        let record = WalRecord {
            epoch: self.repl.epoch(),
            xid: txn.id,
            body: RecordBody::Insert {
                page: plan.page,
                slot: plan.slot,
                cmin: txn.command,
                chained,
                key: key.to_vec(),
                payload: payload.to_vec(),
            },
        };
        let lsn = self.wal.append(&record)?;
        let placed = core.vs.apply_insert(
            txn.id,
            txn.command,
            key,
            payload,
            plan.page,
            plan.slot,
            chained,
            lsn,
        )?;
        Ok(placed.version)
    }

    fn mark_deleted(
        &self,
        core: &mut Core,
        txn: &Transaction,
        version: VersionId,
        next: VersionId,
    ) -> Result<()> {
        self.log_page_touch(core, version.page())?;
        let record = WalRecord {
            epoch: self.repl.epoch(),
            xid: txn.id,
            body: RecordBody::MarkDeleted { version, next },
        };
        let lsn = self.wal.append(&record)?;
        core.vs.apply_mark_deleted(txn.id, version, next, lsn)
    }
}

enum ReclaimAction {
    Reclaim(VersionId),
    Freeze(VersionId),
}

impl Reclaimable for EngineInner {
    fn reclaim_pass(&self, mode: VacuumMode, budget: Option<usize>) -> Result<VacuumStats> {
        let mut core = self.core.lock();
        let low = self.txns.global_low_water();
        let next = self.txns.next_xid();
        let policy = self.txns.policy();

        // Full scan: reachability must be computed over the whole heap
        // before anything is reclaimed.
        let mut scanned = 0usize;
        let mut pointed_to: HashSet<VersionId> = HashSet::new();
        let mut live: Vec<(VersionId, TupleHeader)> = Vec::new();
        core.vs.heap_mut().for_each_live(|vid, hdr, _| {
            scanned += 1;
            if !hdr.next.is_null() {
                pointed_to.insert(hdr.next);
            }
            live.push((vid, hdr.clone()));
            Ok(())
        })?;

        let mut actions: Vec<ReclaimAction> = Vec::new();
        for (vid, hdr) in &live {
            let xmin_aborted =
                !hdr.xmin.is_special() && self.txns.status(hdr.xmin) == TxnStatus::Aborted;
            let xmax_dead = !hdr.xmax.is_invalid()
                && !hdr.xmax.is_special()
                && self.txns.status(hdr.xmax) == TxnStatus::Committed
                && hdr.xmax.precedes(low);
            if (xmin_aborted || xmax_dead) && !pointed_to.contains(vid) {
                actions.push(ReclaimAction::Reclaim(*vid));
                continue;
            }
            let freeze_eligible = !hdr.xmin.is_special()
                && self.txns.status(hdr.xmin) == TxnStatus::Committed
                && hdr.xmin.precedes(low)
                && (hdr.xmax.is_invalid()
                    || (!hdr.xmax.is_special()
                        && self.txns.status(hdr.xmax) == TxnStatus::Aborted));
            let old_enough = match mode {
                VacuumMode::Aggressive => true,
                VacuumMode::Throttled => next.age_from(hdr.xmin) >= policy.freeze_age,
            };
            if freeze_eligible && old_enough {
                actions.push(ReclaimAction::Freeze(*vid));
            }
        }

        let epoch = self.repl.epoch();
        let mut reclaimed = 0usize;
        let mut frozen = 0usize;
        let mut truncated = false;
        for action in actions {
            if let Some(limit) = budget {
                if reclaimed + frozen >= limit {
                    truncated = true;
                    break;
                }
            }
            match action {
                ReclaimAction::Reclaim(vid) => {
                    self.log_page_touch(&mut core, vid.page())?;
                    let record = WalRecord {
                        epoch,
                        xid: INVALID_XID,
                        body: RecordBody::Reclaim { version: vid },
                    };
                    let lsn = self.wal.append(&record)?;
                    core.vs.apply_reclaim(vid, lsn)?;
                    reclaimed += 1;
                }
                ReclaimAction::Freeze(vid) => {
                    self.log_page_touch(&mut core, vid.page())?;
                    let record = WalRecord {
                        epoch,
                        xid: INVALID_XID,
                        body: RecordBody::Freeze { version: vid },
                    };
                    let lsn = self.wal.append(&record)?;
                    core.vs.apply_freeze(vid, lsn)?;
                    frozen += 1;
                }
            }
        }

        // The watermark may only pass ids no surviving tuple still carries
        // unfrozen, so it moves only after an untruncated pass.
        if !truncated {
            let mut min_unfrozen: Option<TxnId> = None;
            core.vs.heap_mut().for_each_live(|_, hdr, _| {
                let mut note = |xid: TxnId| {
                    if !xid.is_special() {
                        min_unfrozen = Some(match min_unfrozen {
                            Some(cur) if cur.precedes(xid) => cur,
                            _ => xid,
                        });
                    }
                };
                note(hdr.xmin);
                if !hdr.xmax.is_invalid() {
                    note(hdr.xmax);
                }
                Ok(())
            })?;
            let candidate = match min_unfrozen {
                Some(oldest) if oldest.precedes(low) => oldest,
                _ => low,
            };
            self.txns.advance_frozen_watermark(candidate);
        }

        let mut all_frozen_pages = 0usize;
        for raw in 0..core.vs.heap_mut().page_count() {
            if let Ok(flags) = core.vs.heap_mut().page_flags(PageId(raw)) {
                if flags & PAGE_FLAG_ALL_FROZEN != 0 {
                    all_frozen_pages += 1;
                }
            }
        }

        Ok(VacuumStats {
            scanned,
            reclaimed,
            frozen,
            all_frozen_pages,
            oldest_unfrozen_age: self.txns.oldest_unfrozen_age(),
        })
    }

    fn checkpoint(&self) -> Result<Lsn> {
        let mut core = self.core.lock();
        self.wal.flush_all()?;
        let durable = self.wal.durable_lsn();
        core.vs.heap_mut().write_back(durable)?;
        core.vs.heap_mut().sync()?;

        let redo = durable;
        let record = WalRecord {
            epoch: self.repl.epoch(),
            xid: INVALID_XID,
            body: RecordBody::Checkpoint {
                redo,
                next_xid: self.txns.next_xid(),
                frozen_watermark: self.txns.frozen_watermark(),
            },
        };
        self.wal.append(&record)?;
        self.wal.flush_all()?;

        // The commit log must land before the redo point advances: once
        // recycle_below drops the Commit records, it is the only durable
        // record of these outcomes.
        let watermark = self.txns.frozen_watermark();
        clog::store(&self.clog_path, &self.txns.committed_xids(watermark))?;
        let meta = Meta {
            page_size: self.config.page_size,
            salt: self.salt,
            epoch: self.repl.epoch(),
            redo,
            next_xid: self.txns.next_xid(),
            frozen_watermark: watermark,
        };
        meta.store(&self.meta_path)?;
        core.fpi_done.clear();
        drop(core);

        let recycled = self.wal.recycle_below(redo)?;
        info!(%redo, recycled, "engine.checkpoint.completed");
        Ok(redo)
    }

    fn wraparound_danger(&self) -> bool {
        self.txns.wraparound_danger()
    }
}
