//! Append/flush side of the write-ahead log.
//!
//! Appends land in an in-memory buffer and are made durable by `flush`,
//! which is triggered by commits, by the buffer-size threshold, and by a
//! periodic background timer so worst-case loss windows and memory growth
//! stay bounded. The log is chopped into fixed-size segment files; segment
//! boundaries affect recycling granularity only. A record never spans a
//! segment: the tail is zero-padded and the reader skips to the next
//! segment when it sees a zero length.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::error::{HeartwoodError, Result};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::Lsn;
use crate::wal::reader::WalReader;
use crate::wal::{frame_record, WalRecord, RECORD_HDR_LEN};

/// WAL manager configuration.
#[derive(Clone, Debug)]
pub struct WalOptions {
    /// Directory holding segment files.
    pub dir: PathBuf,
    /// Fixed size of each segment file in bytes.
    pub segment_size: u64,
    /// Buffered bytes that trigger an inline flush.
    pub flush_threshold: usize,
    /// Interval of the background flush timer.
    pub flush_interval: Duration,
    /// Position to begin scanning from when the log already exists, and the
    /// initial append position when it does not.
    pub recover_from: Lsn,
}

impl WalOptions {
    /// Defaults under `dir`: 16 MiB segments, 1 MiB flush threshold, 200 ms
    /// timer.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: 16 * 1024 * 1024,
            flush_threshold: 1024 * 1024,
            flush_interval: Duration::from_millis(200),
            recover_from: Lsn::ZERO,
        }
    }
}

struct WalState {
    buffer: Vec<u8>,
    buffer_base: Lsn,
    next_lsn: Lsn,
    durable: Lsn,
    poisoned: Option<String>,
}

struct TimerShared {
    stop: Mutex<bool>,
    cv: Condvar,
}

/// Durable, ordered, append-only log of change records.
pub struct WalManager {
    dir: PathBuf,
    segment_size: u64,
    flush_threshold: usize,
    state: Mutex<WalState>,
    durable_cv: Condvar,
    // Serializes flushers so durability advances in order; never held while
    // the state lock is taken for appends.
    flush_lock: Mutex<()>,
    files: Mutex<HashMap<u64, StdFileIo>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    timer_shared: Arc<TimerShared>,
    shutdown: AtomicBool,
}

fn segment_name(index: u64) -> String {
    format!("{index:016x}.wal")
}

impl WalManager {
    /// Opens the log, scanning forward from `recover_from` to find the end
    /// of valid records.
    pub fn open(options: WalOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.dir)?;
        let end = {
            let mut reader =
                WalReader::new(options.dir.clone(), options.segment_size, options.recover_from);
            let mut end = options.recover_from;
            while let Some(read) = reader.next_record()? {
                end = read.end_lsn();
            }
            end
        };
        info!(durable = %end, "wal.open");
        Ok(Self {
            dir: options.dir,
            segment_size: options.segment_size,
            flush_threshold: options.flush_threshold,
            state: Mutex::new(WalState {
                buffer: Vec::new(),
                buffer_base: end,
                next_lsn: end,
                durable: end,
                poisoned: None,
            }),
            durable_cv: Condvar::new(),
            flush_lock: Mutex::new(()),
            files: Mutex::new(HashMap::new()),
            timer: Mutex::new(None),
            timer_shared: Arc::new(TimerShared {
                stop: Mutex::new(false),
                cv: Condvar::new(),
            }),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Spawns the periodic flush timer.
    pub fn start_timer(self: &Arc<Self>, interval: Duration) {
        let wal = Arc::clone(self);
        let shared = Arc::clone(&self.timer_shared);
        let handle = thread::spawn(move || loop {
            {
                let mut stop = shared.stop.lock();
                if *stop {
                    break;
                }
                shared.cv.wait_for(&mut stop, interval);
                if *stop {
                    break;
                }
            }
            if let Err(err) = wal.flush_all() {
                error!(error = %err, "wal.timer.flush_failed");
            }
        });
        *self.timer.lock() = Some(handle);
    }

    /// Stops the timer thread and flushes what remains.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut stop = self.timer_shared.stop.lock();
            *stop = true;
            self.timer_shared.cv.notify_all();
        }
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }
        self.flush_all()
    }

    /// Current append position (the LSN the next record will receive).
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Highest LSN known durable on local storage.
    pub fn durable_lsn(&self) -> Lsn {
        self.state.lock().durable
    }

    fn check_poisoned(state: &WalState) -> Result<()> {
        if let Some(msg) = &state.poisoned {
            return Err(HeartwoodError::DurabilityBarrier(msg.clone()));
        }
        Ok(())
    }

    /// Appends a record, returning its LSN. Suspends the caller only when
    /// the buffer threshold forces an inline flush.
    pub fn append(&self, record: &WalRecord) -> Result<Lsn> {
        let payload = record.encode_payload();
        let frame_len = (RECORD_HDR_LEN + payload.len()) as u64;
        if frame_len > self.segment_size {
            return Err(HeartwoodError::Invalid("wal record exceeds segment size"));
        }
        let (lsn, should_flush) = {
            let mut state = self.state.lock();
            Self::check_poisoned(&state)?;
            let within = state.next_lsn.0 % self.segment_size;
            if within + frame_len > self.segment_size {
                // Zero-pad to the segment boundary; readers skip the tail.
                let pad = (self.segment_size - within) as usize;
                let padded = state.buffer.len() + pad;
                state.buffer.resize(padded, 0);
                state.next_lsn.0 += pad as u64;
            }
            let lsn = state.next_lsn;
            let framed = frame_record(lsn, &payload);
            state.buffer.extend_from_slice(&framed);
            state.next_lsn.0 += framed.len() as u64;
            (lsn, state.buffer.len() >= self.flush_threshold)
        };
        if should_flush {
            self.flush(lsn)?;
        }
        Ok(lsn)
    }

    /// Appends an already-framed record at its original LSN. Used by a
    /// replica applying a primary's stream; gaps (the primary's segment
    /// padding) are zero-filled.
    pub fn append_raw(&self, lsn: Lsn, frame: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_poisoned(&state)?;
        if lsn < state.next_lsn {
            // Duplicate delivery after a reconnect.
            return Ok(());
        }
        let gap = lsn.0 - state.next_lsn.0;
        if gap > self.segment_size {
            return Err(HeartwoodError::Corruption("wal stream gap"));
        }
        let padded = state.buffer.len() + gap as usize;
        state.buffer.resize(padded, 0);
        state.buffer.extend_from_slice(frame);
        state.next_lsn.0 = lsn.0 + frame.len() as u64;
        Ok(())
    }

    fn segment_file(&self, index: u64) -> Result<StdFileIo> {
        let mut files = self.files.lock();
        if let Some(io) = files.get(&index) {
            return Ok(io.clone());
        }
        let io = StdFileIo::open(self.dir.join(segment_name(index)))?;
        files.insert(index, io.clone());
        Ok(io)
    }

    /// Durability barrier: blocks until every record at or below `upto` is
    /// on durable storage. A failed fsync poisons the log; no commit may be
    /// acknowledged past that point.
    pub fn flush(&self, upto: Lsn) -> Result<()> {
        let _flush = self.flush_lock.lock();
        let (base, bytes) = {
            let mut state = self.state.lock();
            Self::check_poisoned(&state)?;
            if state.durable >= upto {
                return Ok(());
            }
            let base = state.buffer_base;
            let bytes = std::mem::take(&mut state.buffer);
            state.buffer_base = state.next_lsn;
            (base, bytes)
        };
        if bytes.is_empty() {
            return Ok(());
        }
        match self.write_and_sync(base, &bytes) {
            Ok(()) => {
                let mut state = self.state.lock();
                state.durable = Lsn(base.0 + bytes.len() as u64);
                debug!(durable = %state.durable, "wal.flush");
                self.durable_cv.notify_all();
                Ok(())
            }
            Err(err) => {
                let msg = err.to_string();
                let mut state = self.state.lock();
                state.poisoned = Some(msg.clone());
                error!(error = %msg, "wal.flush.durability_barrier");
                Err(HeartwoodError::DurabilityBarrier(msg))
            }
        }
    }

    /// Flushes everything appended so far.
    pub fn flush_all(&self) -> Result<()> {
        let upto = self.state.lock().next_lsn;
        self.flush(upto)
    }

    fn write_and_sync(&self, base: Lsn, bytes: &[u8]) -> Result<()> {
        let mut touched = Vec::new();
        let mut off = base.0;
        let mut rest = bytes;
        while !rest.is_empty() {
            let seg = off / self.segment_size;
            let within = off % self.segment_size;
            let room = (self.segment_size - within) as usize;
            let n = rest.len().min(room);
            let io = self.segment_file(seg)?;
            io.write_at(within, &rest[..n])?;
            if !touched.contains(&seg) {
                touched.push(seg);
            }
            off += n as u64;
            rest = &rest[n..];
        }
        for seg in touched {
            self.segment_file(seg)?.sync_all()?;
        }
        Ok(())
    }

    /// Blocks until the durable LSN reaches `lsn` or the wait times out.
    /// Returns the durable LSN either way.
    pub fn wait_durable(&self, lsn: Lsn, timeout: Duration) -> Lsn {
        let mut state = self.state.lock();
        if state.durable < lsn {
            self.durable_cv.wait_for(&mut state, timeout);
        }
        state.durable
    }

    /// A restartable reader positioned at `from`, bounded by the current
    /// durable LSN.
    pub fn read_from(&self, from: Lsn) -> WalReader {
        let durable = self.durable_lsn();
        WalReader::bounded(self.dir.clone(), self.segment_size, from, durable)
    }

    /// Removes whole segments strictly below `keep`, once no replica or
    /// recovery path needs them.
    pub fn recycle_below(&self, keep: Lsn) -> Result<u64> {
        let keep_seg = keep.0 / self.segment_size;
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = Path::new(&name)
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok())
            else {
                continue;
            };
            if stem + 1 <= keep_seg {
                std::fs::remove_file(entry.path())?;
                self.files.lock().remove(&stem);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, keep = %keep, "wal.recycle");
        }
        Ok(removed)
    }
}
