//! compdepends-store: the time-series store the dependency engine works against.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the TSID, computation,
//! group and application directories, the change-notification queue, the
//! run-lock rows, and the materialized dependency edge set that the
//! execution engine reads.
//!
//! # Atomicity
//!
//! Every unit of edge maintenance (one [`DependsUpdate`] or one full
//! reconciliation) is applied in a single write transaction, so readers of
//! the edge tables see either the old or the new edge set, never a mix.
//!
//! The `TsdbStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use store::{TsdbStore, epoch_secs};
pub use types::*;
