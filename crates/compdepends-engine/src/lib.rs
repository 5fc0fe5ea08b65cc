//! compdepends-engine: keeps the computation dependency edge set current.
//!
//! For each application, the engine mirrors the store's TSID, group and
//! computation directories in process-local caches and derives the edges
//! `(ts_key, comp_id)` the execution engine reads:
//!
//! - Expands groups (explicit members, criteria, include / exclude /
//!   intersect sub-groups) with cycle detection
//! - Evaluates each computation into its candidate edge set
//! - Applies change notifications as single-transaction incremental updates
//! - Runs full evaluations that write only the delta
//! - Holds the per-application run lock
//!
//! # Architecture
//!
//! ```text
//! DependsUpdater
//!   ├── TsdbStore (directories, notification queue, edge tables)
//!   ├── TsidCache ── ObjectCache<Tsid>
//!   ├── GroupCache (definitions + expanded lists)
//!   ├── CompCache ── ObjectCache<DbComputation>
//!   └── reconcile::evaluate_computation
//! RunLock (heartbeat row per application)
//! ```

pub mod cache;
pub mod comp_cache;
pub mod error;
pub mod groups;
pub mod lock;
pub mod reconcile;
pub mod tsid_cache;
pub mod updater;

pub use cache::{Cachable, ObjectCache};
pub use comp_cache::CompCache;
pub use error::{EngineError, EngineResult};
pub use groups::GroupCache;
pub use lock::RunLock;
pub use reconcile::{Evaluation, evaluate_computation};
pub use tsid_cache::TsidCache;
pub use updater::{DependsUpdater, PollOutcome, UpdaterSettings};
