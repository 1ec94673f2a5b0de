//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::repl::ReplicationConfig;
use crate::txn::WraparoundPolicy;
use crate::vacuum::VacuumConfig;

/// Options supplied when opening an [`super::Engine`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Data directory: holds `meta`, `heap.db`, and the `wal/` segments.
    pub dir: PathBuf,
    /// Page size in bytes. Fixed at creation; reopening with a different
    /// value fails.
    pub page_size: u32,
    /// WAL segment size in bytes.
    pub wal_segment_size: u64,
    /// Buffered WAL bytes that trigger an inline group flush.
    pub wal_flush_threshold: usize,
    /// Background WAL flush interval.
    pub wal_flush_interval: Duration,
    /// Transaction-id wraparound thresholds.
    pub wraparound: WraparoundPolicy,
    /// Background reclaim worker settings.
    pub vacuum: VacuumConfig,
    /// Whether to spawn the background reclaim worker.
    pub vacuum_enabled: bool,
    /// Replication and quorum settings.
    pub replication: ReplicationConfig,
}

impl Config {
    /// Production-leaning defaults rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            page_size: 8192,
            wal_segment_size: 16 * 1024 * 1024,
            wal_flush_threshold: 1024 * 1024,
            wal_flush_interval: Duration::from_millis(200),
            wraparound: WraparoundPolicy::default(),
            vacuum: VacuumConfig::default(),
            vacuum_enabled: true,
            replication: ReplicationConfig::default(),
        }
    }

    /// A small-footprint profile: tiny pages and segments, eager flushing,
    /// no background worker. Suited to tests and embedded use.
    pub fn compact(dir: impl Into<PathBuf>) -> Self {
        Self {
            page_size: 1024,
            wal_segment_size: 16 * 1024,
            wal_flush_threshold: 1,
            wal_flush_interval: Duration::from_millis(20),
            vacuum_enabled: false,
            ..Self::new(dir)
        }
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the WAL segment size.
    pub fn wal_segment_size(mut self, bytes: u64) -> Self {
        self.wal_segment_size = bytes;
        self
    }

    /// Sets the wraparound thresholds.
    pub fn wraparound(mut self, policy: WraparoundPolicy) -> Self {
        self.wraparound = policy;
        self
    }

    /// Sets the reclaim worker configuration.
    pub fn vacuum(mut self, vacuum: VacuumConfig) -> Self {
        self.vacuum = vacuum;
        self
    }

    /// Enables or disables the background reclaim worker.
    pub fn vacuum_enabled(mut self, enabled: bool) -> Self {
        self.vacuum_enabled = enabled;
        self
    }

    /// Sets the replication configuration.
    pub fn replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }
}
