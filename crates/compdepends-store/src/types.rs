//! Write-side units of work for the dependency edge set.

use std::collections::BTreeSet;

use compdepends_core::{CompDepends, CompId, DbComputation, GroupId, TsKey};

/// One incremental change to the edge set, applied in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependsUpdate {
    /// Computations whose persisted edges are deleted before `edges` is inserted.
    pub replace_comps: BTreeSet<CompId>,
    /// Edges to insert.
    pub edges: BTreeSet<CompDepends>,
    /// Series whose edges are all deleted.
    pub drop_ts: BTreeSet<TsKey>,
    /// Explicit group memberships to delete.
    pub drop_members: Vec<(GroupId, TsKey)>,
    /// Computation rows rewritten alongside the edges (disablements).
    pub computations: Vec<DbComputation>,
}

impl DependsUpdate {
    pub fn is_empty(&self) -> bool {
        self.replace_comps.is_empty()
            && self.edges.is_empty()
            && self.drop_ts.is_empty()
            && self.drop_members.is_empty()
            && self.computations.is_empty()
    }
}

/// Row counts written by a committed [`DependsUpdate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCounts {
    pub edges_deleted: u64,
    pub edges_inserted: u64,
    pub members_deleted: u64,
    pub computations_written: u64,
}

/// Rows changed by a full reconciliation against a desired edge set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependsDelta {
    pub removed: u64,
    pub added: u64,
}

impl DependsDelta {
    pub fn is_empty(&self) -> bool {
        self.removed == 0 && self.added == 0
    }
}
