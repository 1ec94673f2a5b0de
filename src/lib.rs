//! Heartwood: a WAL-logged, multi-version storage engine with synchronous
//! replication.
//!
//! Rows live as immutable tuple versions on slotted pages; updates write a
//! new version and stamp the old one, and every transaction reads through
//! the snapshot it captured at start. All mutation flows through a
//! segmented write-ahead log, so crash recovery is a replay from the last
//! checkpoint and a replica is just another consumer of the same frames. A
//! background reclaimer returns dead versions' space and freezes old ones
//! ahead of transaction-id wraparound.
//!
//! The two entry points are [`Engine`] (the primary: opens a data
//! directory, recovers, serves transactions) and [`repl::Standby`] (a
//! replica that tails a primary's log and can be promoted).
//!
//! ```no_run
//! use heartwood::{Config, Engine};
//!
//! # fn main() -> heartwood::Result<()> {
//! let engine = Engine::open(Config::new("/var/lib/heartwood"))?;
//! let mut txn = engine.begin()?;
//! engine.insert(&mut txn, b"user:1", b"ada")?;
//! engine.commit(&mut txn)?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod mvcc;
pub mod primitives;
pub mod repl;
pub mod storage;
pub mod txn;
pub mod types;
pub mod vacuum;
pub mod wal;

pub use engine::{Config, Engine, EngineStatus, ReplicaLag, Role};
pub use error::{HeartwoodError, Result};
pub use repl::{Coordinator, ReplicaId, ReplicaProgress, ReplicaState, ReplicationConfig, Standby};
pub use txn::{Transaction, TxnStatus, WraparoundPolicy};
pub use types::{Epoch, Lsn, PageId, TxnId, VersionId};
pub use vacuum::{VacuumConfig, VacuumMode, VacuumStats};
