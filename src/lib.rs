//! Durable, versioned key-value state.
//!
//! Every mutation is appended to a transaction log before it is applied to an
//! immutable in-memory map, so a crash never loses an acknowledged update.
//! Periodic snapshots bound how much of the log a restart has to replay.
//!
//! ```no_run
//! use ashstate::{MapState, StateConfig};
//!
//! # fn main() -> ashstate::Result<()> {
//! let state: MapState<String, u64> = MapState::open(StateConfig::new("./state"))?;
//! state.put("clicks".to_string(), 1)?;
//! state.commit()?;
//! assert_eq!(state.get("clicks"), Some(1));
//! state.compact()?;
//! state.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod encoding;
pub mod error;
pub mod executor;
pub mod flock;
pub mod log;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod tasks;
pub mod transaction;
pub mod version;

pub use cache::PersistentMap;
pub use config::{LogOptions, SchedulerConfig, StateConfig};
pub use error::{Error, Result};
pub use executor::{Executor, TokioExecutor};
pub use log::{CompactionHandle, Lifecycle, TransactionLog};
pub use metrics::LogStats;
pub use registry::Registry;
pub use state::{MapState, MapStateFactory, StateFactory};
pub use storage::{LocalStorage, MemoryStorage, Storage};
pub use tasks::{CompactionPolicy, CompactionTask, MetricsTask};
pub use transaction::{MapTransaction, Snapshot, Transaction};
pub use version::Version;
