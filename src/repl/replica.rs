//! The standby: a read-only instance that tails the primary's log.
//!
//! A standby keeps its own heap, WAL, and transaction table in its own data
//! directory. The apply thread sends Start with the local durable position,
//! then for every Records batch appends the frames verbatim, flushes, and
//! redoes them in LSN order before acknowledging, so an acknowledged
//! position is both durable and readable here. Reads go through a
//! [`crate::txn::TxnManager::read_view`] snapshot and see exactly the
//! commits applied so far.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::engine::meta::Meta;
use crate::engine::redo;
use crate::engine::Config;
use crate::error::{HeartwoodError, Result};
use crate::mvcc::VersionStore;
use crate::primitives::io::StdFileIo;
use crate::repl::transport::ReplicaChannel;
use crate::repl::wire::{FrameEntry, Message};
use crate::repl::ReplicaProgress;
use crate::storage::heap::Heap;
use crate::storage::store::{PageStore, StoreOptions};
use crate::txn::TxnManager;
use crate::types::{Epoch, Lsn, VersionId, FIRST_NORMAL_XID};
use crate::wal::reader::ReadRecord;
use crate::wal::{WalManager, WalOptions, WalRecord, RECORD_HDR_LEN};

const RECV_POLL: Duration = Duration::from_millis(50);

struct StandbyShared {
    wal: Arc<WalManager>,
    txns: TxnManager,
    core: Mutex<VersionStore>,
    progress: Mutex<ReplicaProgress>,
    epoch: Mutex<Epoch>,
    stop: AtomicBool,
}

/// A replica instance: applies the primary's log and serves reads.
pub struct Standby {
    config: Config,
    salt: u64,
    shared: Arc<StandbyShared>,
    apply: Mutex<Option<JoinHandle<()>>>,
}

impl Standby {
    /// Opens the standby's data directory and replays its local log, the
    /// same recovery a primary runs. Streaming starts with [`Standby::start`].
    pub fn open(config: Config) -> Result<Standby> {
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
                    next_xid: FIRST_NORMAL_XID,
                    frozen_watermark: FIRST_NORMAL_XID,
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

        let wal = Arc::new(WalManager::open(WalOptions {
            dir: wal_dir,
            segment_size: config.wal_segment_size,
            flush_threshold: config.wal_flush_threshold,
            flush_interval: config.wal_flush_interval,
            recover_from: meta.redo,
        })?);

        vs.rebuild_index()?;
        let mut reader = wal.read_from(meta.redo);
        while let Some(read) = reader.next_record()? {
            redo::apply_record(&mut vs, &txns, &read)?;
        }
        vs.rebuild_index()?;
        let durable = wal.durable_lsn();
        info!(end = %durable, keys = vs.key_count(), "standby.recovery.completed");

        let shared = Arc::new(StandbyShared {
            wal,
            txns,
            core: Mutex::new(vs),
            progress: Mutex::new(ReplicaProgress {
                received: durable,
                flushed: durable,
                applied: durable,
            }),
            epoch: Mutex::new(meta.epoch),
            stop: AtomicBool::new(false),
        });
        Ok(Standby {
            salt: meta.salt,
            config,
            shared,
            apply: Mutex::new(None),
        })
    }

    /// Connects the apply loop to the primary over `channel`.
    pub fn start(&self, channel: Box<dyn ReplicaChannel>) -> Result<()> {
        let mut slot = self.apply.lock();
        if slot.is_some() {
            return Err(HeartwoodError::Invalid("standby is already streaming"));
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("heartwood-standby".into())
            .spawn(move || run_apply(shared, channel))
            .map_err(HeartwoodError::Io)?;
        *slot = Some(handle);
        Ok(())
    }

    /// The standby's current log positions.
    pub fn progress(&self) -> ReplicaProgress {
        *self.shared.progress.lock()
    }

    /// The last epoch observed from the primary (or set by promotion).
    pub fn epoch(&self) -> Epoch {
        *self.shared.epoch.lock()
    }

    /// Returns the newest committed version of `key` applied so far.
    pub fn read(&self, key: &[u8]) -> Result<(VersionId, Vec<u8>)> {
        let view = self.shared.txns.read_view(self.epoch());
        let mut vs = self.shared.core.lock();
        vs.read(&self.shared.txns, &view, key)?
            .ok_or(HeartwoodError::NotFound)
    }

    /// Promotes this standby: refuses unless every received byte has been
    /// applied, then stops the apply loop, bumps the epoch, and persists it.
    /// Reopen the directory with [`crate::engine::Engine::open`] to serve
    /// writes under the new epoch.
    pub fn promote(self) -> Result<Epoch> {
        let progress = *self.shared.progress.lock();
        if progress.applied != progress.received {
            return Err(HeartwoodError::NotCaughtUp {
                applied: progress.applied,
                received: progress.received,
            });
        }
        self.stop_apply();
        let new_epoch = self.epoch().next();
        *self.shared.epoch.lock() = new_epoch;

        self.shared.wal.flush_all()?;
        let meta = Meta {
            page_size: self.config.page_size,
            salt: self.salt,
            epoch: new_epoch,
            redo: Lsn::ZERO,
            next_xid: self.shared.txns.next_xid(),
            frozen_watermark: self.shared.txns.frozen_watermark(),
        };
        meta.store(&self.config.dir.join("meta"))?;
        self.shared.wal.shutdown()?;
        info!(epoch = new_epoch.0, end = %progress.applied, "standby.promoted");
        Ok(new_epoch)
    }

    /// Stops streaming and closes the local log.
    pub fn close(self) -> Result<()> {
        self.stop_apply();
        self.shared.wal.flush_all()?;
        self.shared.wal.shutdown()
    }

    fn stop_apply(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.apply.lock().take() {
            let _ = handle.join();
        }
    }
}

fn decode_entry(entry: &FrameEntry) -> Result<ReadRecord> {
    if entry.frame.len() < RECORD_HDR_LEN {
        return Err(HeartwoodError::Corruption("short replicated frame"));
    }
    let record = WalRecord::decode_payload(&entry.frame[RECORD_HDR_LEN..])?;
    Ok(ReadRecord {
        lsn: entry.lsn,
        record,
        frame: entry.frame.clone(),
    })
}

fn apply_batch(shared: &StandbyShared, entries: &[FrameEntry]) -> Result<ReplicaProgress> {
    for entry in entries {
        shared.wal.append_raw(entry.lsn, &entry.frame)?;
    }
    shared.wal.flush_all()?;
    let flushed = shared.wal.durable_lsn();

    let mut applied = Lsn::ZERO;
    {
        let mut vs = shared.core.lock();
        for entry in entries {
            let read = decode_entry(entry)?;
            redo::apply_record(&mut vs, &shared.txns, &read)?;
            applied = read.end_lsn();
        }
    }

    let mut progress = shared.progress.lock();
    progress.received = flushed.max(progress.received);
    progress.flushed = flushed.max(progress.flushed);
    progress.applied = applied.max(progress.applied);
    Ok(*progress)
}

fn run_apply(shared: Arc<StandbyShared>, channel: Box<dyn ReplicaChannel>) {
    let start = Message::Start {
        start_lsn: shared.wal.durable_lsn(),
        epoch: *shared.epoch.lock(),
    };
    if let Err(err) = channel.send(&start) {
        warn!(error = %err, "standby.start.failed");
        return;
    }
    while !shared.stop.load(Ordering::Acquire) {
        let message = match channel.recv(RECV_POLL) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(err) => {
                warn!(error = %err, "standby.stream.closed");
                return;
            }
        };
        // Track the primary's epoch; a promotion elsewhere shows up here.
        {
            let mut epoch = shared.epoch.lock();
            if epoch.0 < message.epoch().0 {
                *epoch = message.epoch();
            }
        }
        let progress = match &message {
            Message::Records { entries, .. } => match apply_batch(&shared, entries) {
                Ok(progress) => {
                    debug!(
                        count = entries.len(),
                        applied = %progress.applied,
                        "standby.batch.applied"
                    );
                    progress
                }
                Err(err) => {
                    warn!(error = %err, "standby.apply.failed");
                    return;
                }
            },
            Message::Heartbeat { .. } => *shared.progress.lock(),
            Message::Start { .. } | Message::Ack { .. } => continue,
        };
        let ack = Message::Ack {
            received: progress.received,
            flushed: progress.flushed,
            applied: progress.applied,
            epoch: *shared.epoch.lock(),
        };
        if let Err(err) = channel.send(&ack) {
            warn!(error = %err, "standby.ack.failed");
            return;
        }
    }
}
