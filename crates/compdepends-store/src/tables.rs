//! redb table definitions for the time-series store.
//!
//! Object tables use `u64` surrogate keys and `&[u8]` values holding
//! JSON-serialized domain types. The dependency edge set is stored twice,
//! keyed `(ts_key, comp_id)` and `(comp_id, ts_key)`, so that both
//! "edges of a series" and "edges of a computation" are prefix ranges.
//! Both copies are always written in the same transaction.

use redb::TableDefinition;

/// Named key sequences keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Time-series identifiers keyed by `ts_key`.
pub const TSIDS: TableDefinition<u64, &[u8]> = TableDefinition::new("tsids");

/// Computation definitions keyed by `comp_id`.
pub const COMPUTATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("computations");

/// Group definitions keyed by `group_id`.
pub const GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("groups");

/// Dependency edges keyed by `(ts_key, comp_id)`.
pub const DEPENDS_BY_TS: TableDefinition<(u64, u64), ()> = TableDefinition::new("depends_by_ts");

/// Dependency edges keyed by `(comp_id, ts_key)`.
pub const DEPENDS_BY_COMP: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("depends_by_comp");

/// Pending change notifications keyed by queue sequence number.
pub const NOTIFY: TableDefinition<u64, &[u8]> = TableDefinition::new("depends_notify");

/// Loading applications keyed by name.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Run-lock rows keyed by `app_id`.
pub const LOCKS: TableDefinition<u64, &[u8]> = TableDefinition::new("locks");
