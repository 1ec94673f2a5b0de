//! Background space reclamation.
//!
//! A single worker thread periodically asks the engine to run a reclaim
//! pass: dead tuple versions (deleted before every live snapshot, or left
//! behind by aborted transactions) are reclaimed, and surviving versions
//! older than the freeze threshold get their xmin rewritten to the frozen
//! sentinel so the transaction-id watermark can advance. Passes are
//! throttled by a tuple budget; once the wraparound danger threshold is
//! crossed the worker escalates to unthrottled passes until the watermark
//! catches up. The worker also drives periodic checkpoints.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::Lsn;

/// How hard a reclaim pass is allowed to work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VacuumMode {
    /// Normal operation: stop after the configured tuple budget.
    Throttled,
    /// Wraparound pressure: scan everything, freeze everything eligible.
    Aggressive,
}

/// What woke the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VacuumTrigger {
    /// The periodic timer.
    Interval,
    /// An explicit nudge from the engine or an operator.
    Manual,
    /// The wraparound danger threshold was crossed.
    WraparoundDanger,
}

/// Outcome of one reclaim pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VacuumStats {
    /// Live tuple versions examined.
    pub scanned: usize,
    /// Versions whose slots were reclaimed.
    pub reclaimed: usize,
    /// Versions whose xmin was frozen.
    pub frozen: usize,
    /// Pages newly marked all-frozen.
    pub all_frozen_pages: usize,
    /// Age of the oldest possibly-unfrozen id after the pass.
    pub oldest_unfrozen_age: u32,
}

/// Worker configuration.
#[derive(Clone, Copy, Debug)]
pub struct VacuumConfig {
    /// Time between automatic passes.
    pub interval: Duration,
    /// Tuple budget per throttled pass.
    pub budget: usize,
    /// Number of passes between checkpoints.
    pub checkpoint_every: u32,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            budget: 4096,
            checkpoint_every: 4,
        }
    }
}

/// The worker's view of the engine.
pub trait Reclaimable: Send + Sync {
    /// Runs one reclaim pass.
    fn reclaim_pass(&self, mode: VacuumMode, budget: Option<usize>) -> Result<VacuumStats>;

    /// Flushes the WAL and writes back dirty pages.
    fn checkpoint(&self) -> Result<Lsn>;

    /// True once the wraparound danger threshold is crossed.
    fn wraparound_danger(&self) -> bool;
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    wake: Condvar,
}

struct WorkerState {
    stop: bool,
    pending: Option<VacuumTrigger>,
}

/// Handle to the background reclaim worker.
pub struct VacuumWorker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl VacuumWorker {
    /// Spawns the worker over `target`.
    pub fn start(target: Arc<dyn Reclaimable>, config: VacuumConfig) -> Self {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                stop: false,
                pending: None,
            }),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("heartwood-vacuum".into())
            .spawn(move || run_worker(target, config, thread_shared))
            .ok();
        if handle.is_none() {
            warn!("vacuum.worker.spawn_failed");
        }
        Self {
            shared,
            handle,
        }
    }

    /// Requests an immediate pass.
    pub fn nudge(&self) {
        let mut state = self.shared.state.lock();
        state.pending = Some(VacuumTrigger::Manual);
        self.shared.wake.notify_one();
    }

    /// Stops the worker and joins its thread.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.wake.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VacuumWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(target: Arc<dyn Reclaimable>, config: VacuumConfig, shared: Arc<WorkerShared>) {
    let mut passes_since_checkpoint = 0u32;
    loop {
        let trigger = {
            let mut state = shared.state.lock();
            if state.pending.is_none() && !state.stop {
                shared
                    .wake
                    .wait_for(&mut state, config.interval);
            }
            if state.stop {
                break;
            }
            state.pending.take().unwrap_or(VacuumTrigger::Interval)
        };

        let trigger = if target.wraparound_danger() {
            VacuumTrigger::WraparoundDanger
        } else {
            trigger
        };
        let (mode, budget) = match trigger {
            VacuumTrigger::WraparoundDanger => (VacuumMode::Aggressive, None),
            VacuumTrigger::Interval | VacuumTrigger::Manual => {
                (VacuumMode::Throttled, Some(config.budget))
            }
        };

        match target.reclaim_pass(mode, budget) {
            Ok(stats) => {
                info!(
                    ?trigger,
                    scanned = stats.scanned,
                    reclaimed = stats.reclaimed,
                    frozen = stats.frozen,
                    all_frozen_pages = stats.all_frozen_pages,
                    age = stats.oldest_unfrozen_age,
                    "vacuum.pass.completed"
                );
            }
            Err(err) => {
                warn!(error = %err, "vacuum.pass.failed");
            }
        }

        passes_since_checkpoint += 1;
        if passes_since_checkpoint >= config.checkpoint_every {
            passes_since_checkpoint = 0;
            match target.checkpoint() {
                Ok(redo) => debug!(%redo, "vacuum.checkpoint"),
                Err(err) => warn!(error = %err, "vacuum.checkpoint.failed"),
            }
        }
    }
    debug!("vacuum.worker.stopped");
}
