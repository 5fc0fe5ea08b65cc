//! TsdbStore: redb-backed persistence for the dependency engine.
//!
//! Provides the directories the engine reads (TSIDs, computations, groups,
//! applications), the notification queue it drains, the run-lock rows it
//! heartbeats, and the edge tables it maintains. Values are JSON-serialized
//! into redb's `&[u8]` columns. Both on-disk and in-memory backends are
//! supported (the latter for testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use compdepends_core::*;

use crate::error::{StoreError, StoreResult};
use crate::tables::*;
use crate::types::{CommitCounts, DependsDelta, DependsUpdate};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

type ObjectTable = TableDefinition<'static, u64, &'static [u8]>;
type EdgeTable<'txn> = Table<'txn, (u64, u64), ()>;

/// Thread-safe time-series store backed by redb.
#[derive(Clone)]
pub struct TsdbStore {
    db: Arc<Database>,
}

impl TsdbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "time-series store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory time-series store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.open_table(TSIDS).map_err(map_err!(Table))?;
        txn.open_table(COMPUTATIONS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(DEPENDS_BY_TS).map_err(map_err!(Table))?;
        txn.open_table(DEPENDS_BY_COMP).map_err(map_err!(Table))?;
        txn.open_table(NOTIFY).map_err(map_err!(Table))?;
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic object access ──────────────────────────────────────

    fn put_object<T: Serialize>(&self, def: ObjectTable, key: u64, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_object<T: DeserializeOwned>(&self, def: ObjectTable, key: u64) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_objects<T: DeserializeOwned>(&self, def: ObjectTable) -> StoreResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    fn delete_object(&self, def: ObjectTable, key: u64) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Sequences ──────────────────────────────────────────────────

    /// Allocate the next key from a named sequence. Keys start at 1.
    pub fn next_key(&self, sequence: &str) -> StoreResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            next = bump_sequence(&mut table, sequence)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    // ── Time-series identifiers ────────────────────────────────────

    /// Insert or update a TSID.
    pub fn put_tsid(&self, tsid: &Tsid) -> StoreResult<()> {
        self.put_object(TSIDS, tsid.key, tsid)?;
        debug!(ts_key = tsid.key, tsid = %tsid.path, "tsid stored");
        Ok(())
    }

    /// Register a new series under a freshly allocated key.
    pub fn create_tsid(&self, path: TsPath) -> StoreResult<Tsid> {
        let tsid = Tsid::new(self.next_key("tsid")?, path);
        self.put_tsid(&tsid)?;
        Ok(tsid)
    }

    pub fn get_tsid(&self, key: TsKey) -> StoreResult<Option<Tsid>> {
        self.get_object(TSIDS, key)
    }

    pub fn list_tsids(&self) -> StoreResult<Vec<Tsid>> {
        self.list_objects(TSIDS)
    }

    /// Delete a TSID. Returns true if it existed.
    pub fn delete_tsid(&self, key: TsKey) -> StoreResult<bool> {
        self.delete_object(TSIDS, key)
    }

    // ── Computations ───────────────────────────────────────────────

    /// Insert or update a computation.
    pub fn put_computation(&self, comp: &DbComputation) -> StoreResult<()> {
        self.put_object(COMPUTATIONS, comp.id, comp)?;
        debug!(comp_id = comp.id, name = %comp.name, enabled = comp.enabled, "computation stored");
        Ok(())
    }

    pub fn get_computation(&self, id: CompId) -> StoreResult<Option<DbComputation>> {
        self.get_object(COMPUTATIONS, id)
    }

    /// List computations, optionally only those of one application.
    pub fn list_computations(&self, app_id: Option<AppId>) -> StoreResult<Vec<DbComputation>> {
        let comps: Vec<DbComputation> = self.list_objects(COMPUTATIONS)?;
        Ok(match app_id {
            Some(app) => comps.into_iter().filter(|c| c.app_id == Some(app)).collect(),
            None => comps,
        })
    }

    pub fn delete_computation(&self, id: CompId) -> StoreResult<bool> {
        self.delete_object(COMPUTATIONS, id)
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Insert or update a group definition.
    pub fn put_group(&self, group: &TsGroup) -> StoreResult<()> {
        self.put_object(GROUPS, group.id, group)?;
        debug!(group_id = group.id, name = %group.name, "group stored");
        Ok(())
    }

    pub fn get_group(&self, id: GroupId) -> StoreResult<Option<TsGroup>> {
        self.get_object(GROUPS, id)
    }

    pub fn list_groups(&self) -> StoreResult<Vec<TsGroup>> {
        self.list_objects(GROUPS)
    }

    pub fn delete_group(&self, id: GroupId) -> StoreResult<bool> {
        self.delete_object(GROUPS, id)
    }

    // ── Applications ───────────────────────────────────────────────

    pub fn put_app(&self, app: &AppInfo) -> StoreResult<()> {
        let value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            table
                .insert(app.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_app_by_name(&self, name: &str) -> StoreResult<Option<AppInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let app: AppInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    // ── Notifications ──────────────────────────────────────────────

    /// Append a notification to the queue. Returns its sequence number.
    pub fn enqueue_notify(&self, notify: &CpDependsNotify) -> StoreResult<u64> {
        let value = serde_json::to_vec(notify).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            seq = bump_sequence(&mut sequences, "notify")?;
            let mut table = txn.open_table(NOTIFY).map_err(map_err!(Table))?;
            table
                .insert(seq, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq, %notify, "notification queued");
        Ok(seq)
    }

    /// Queue an event stamped with the current time.
    pub fn notify(&self, event: DependsEvent) -> StoreResult<u64> {
        self.enqueue_notify(&CpDependsNotify::new(event, epoch_secs()))
    }

    /// Remove and return the oldest pending notification.
    pub fn next_notify(&self) -> StoreResult<Option<CpDependsNotify>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let popped = {
            let mut table = txn.open_table(NOTIFY).map_err(map_err!(Table))?;
            match table.pop_first().map_err(map_err!(Write))? {
                Some((_, value)) => {
                    let notify: CpDependsNotify =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    Some(notify)
                }
                None => None,
            }
        };
        if popped.is_none() {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(None);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(popped)
    }

    pub fn pending_notifies(&self) -> StoreResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NOTIFY).map_err(map_err!(Table))?;
        Ok(table.iter().map_err(map_err!(Read))?.count())
    }

    // ── Dependency edges ───────────────────────────────────────────

    /// The full persisted edge set.
    pub fn list_comp_depends(&self) -> StoreResult<BTreeSet<CompDepends>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPENDS_BY_TS).map_err(map_err!(Table))?;
        let mut edges = BTreeSet::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let (ts_key, comp_id) = key.value();
            edges.insert(CompDepends::new(ts_key, comp_id));
        }
        Ok(edges)
    }

    /// Computations that must run when `ts_key` receives data.
    pub fn comps_for_ts(&self, ts_key: TsKey) -> StoreResult<Vec<CompId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPENDS_BY_TS).map_err(map_err!(Table))?;
        let mut comps = Vec::new();
        for entry in table
            .range((ts_key, 0u64)..=(ts_key, u64::MAX))
            .map_err(map_err!(Read))?
        {
            let (key, _) = entry.map_err(map_err!(Read))?;
            comps.push(key.value().1);
        }
        Ok(comps)
    }

    /// Series that trigger `comp_id`.
    pub fn ts_for_comp(&self, comp_id: CompId) -> StoreResult<Vec<TsKey>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPENDS_BY_COMP).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table
            .range((comp_id, 0u64)..=(comp_id, u64::MAX))
            .map_err(map_err!(Read))?
        {
            let (key, _) = entry.map_err(map_err!(Read))?;
            keys.push(key.value().1);
        }
        Ok(keys)
    }

    /// Apply one incremental unit of work in a single transaction.
    ///
    /// Order inside the transaction: edges of `replace_comps` and `drop_ts`
    /// are deleted, `edges` are inserted, explicit memberships are removed
    /// from their groups, and computation rows are rewritten.
    pub fn commit_update(&self, update: &DependsUpdate) -> StoreResult<CommitCounts> {
        let mut counts = CommitCounts::default();
        if update.is_empty() {
            return Ok(counts);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut by_ts = txn.open_table(DEPENDS_BY_TS).map_err(map_err!(Table))?;
            let mut by_comp = txn.open_table(DEPENDS_BY_COMP).map_err(map_err!(Table))?;
            for comp_id in &update.replace_comps {
                counts.edges_deleted += delete_comp_edges(&mut by_ts, &mut by_comp, *comp_id)?;
            }
            for ts_key in &update.drop_ts {
                counts.edges_deleted += delete_ts_edges(&mut by_ts, &mut by_comp, *ts_key)?;
            }
            for edge in &update.edges {
                if insert_edge(&mut by_ts, &mut by_comp, edge)? {
                    counts.edges_inserted += 1;
                }
            }
        }
        if !update.drop_members.is_empty() {
            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            for (group_id, ts_key) in &update.drop_members {
                let group: Option<TsGroup> = match groups.get(*group_id).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
                let Some(mut group) = group else { continue };
                let before = group.members.len();
                group.members.retain(|m| m != ts_key);
                if group.members.len() != before {
                    let value = serde_json::to_vec(&group).map_err(map_err!(Serialize))?;
                    groups
                        .insert(*group_id, value.as_slice())
                        .map_err(map_err!(Write))?;
                    counts.members_deleted += 1;
                }
            }
        }
        if !update.computations.is_empty() {
            let mut comps = txn.open_table(COMPUTATIONS).map_err(map_err!(Table))?;
            for comp in &update.computations {
                let value = serde_json::to_vec(comp).map_err(map_err!(Serialize))?;
                comps
                    .insert(comp.id, value.as_slice())
                    .map_err(map_err!(Write))?;
                counts.computations_written += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(?counts, "dependency update committed");
        Ok(counts)
    }

    /// Make the persisted edge set equal to `desired`, writing only the delta.
    ///
    /// Persisted edges of the `foreign` computations are never removed;
    /// every other persisted edge missing from `desired` is. The diff is
    /// computed inside the write transaction, so no reader ever observes an
    /// empty or partially reconciled edge table.
    pub fn reconcile_comp_depends(
        &self,
        desired: &BTreeSet<CompDepends>,
        foreign: &BTreeSet<CompId>,
    ) -> StoreResult<DependsDelta> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut delta = DependsDelta::default();
        {
            let mut by_ts = txn.open_table(DEPENDS_BY_TS).map_err(map_err!(Table))?;
            let mut by_comp = txn.open_table(DEPENDS_BY_COMP).map_err(map_err!(Table))?;

            let mut current = BTreeSet::new();
            for entry in by_ts.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let (ts_key, comp_id) = key.value();
                if !foreign.contains(&comp_id) {
                    current.insert(CompDepends::new(ts_key, comp_id));
                }
            }

            for stale in current.difference(desired) {
                by_ts
                    .remove((stale.ts_key, stale.comp_id))
                    .map_err(map_err!(Write))?;
                by_comp
                    .remove((stale.comp_id, stale.ts_key))
                    .map_err(map_err!(Write))?;
                delta.removed += 1;
            }
            for fresh in desired.difference(&current) {
                insert_edge(&mut by_ts, &mut by_comp, fresh)?;
                delta.added += 1;
            }
        }

        if delta.is_empty() {
            txn.abort().map_err(map_err!(Transaction))?;
        } else {
            txn.commit().map_err(map_err!(Transaction))?;
        }
        info!(removed = delta.removed, added = delta.added, "edge set reconciled");
        Ok(delta)
    }

    // ── Run locks ──────────────────────────────────────────────────

    pub fn get_lock(&self, app_id: AppId) -> StoreResult<Option<LockRecord>> {
        self.get_object(LOCKS, app_id)
    }

    /// Take the lock row for `candidate.app_id`.
    ///
    /// Fails with `LockBusy` when another holder heartbeated within
    /// `stale_after_secs` of `now`. The same holder may re-take its own lock.
    pub fn obtain_lock(
        &self,
        candidate: &LockRecord,
        stale_after_secs: u64,
        now: u64,
    ) -> StoreResult<LockRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut record = candidate.clone();
        record.heartbeat = now;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing: Option<LockRecord> =
                match table.get(candidate.app_id).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            if let Some(existing) = existing {
                let fresh = now.saturating_sub(existing.heartbeat) <= stale_after_secs;
                if fresh && !existing.same_holder(candidate) {
                    return Err(StoreError::LockBusy {
                        app: candidate.app_name.clone(),
                        holder: existing.holder(),
                    });
                }
            }
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(candidate.app_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// Refresh the heartbeat and status of a held lock.
    ///
    /// Fails with `LockLost` when the row is gone or owned by someone else.
    pub fn renew_lock(&self, held: &LockRecord, status: &str, now: u64) -> StoreResult<LockRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut record = held.clone();
        record.heartbeat = now;
        record.status = status.to_string();
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing: Option<LockRecord> =
                match table.get(held.app_id).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            match existing {
                Some(existing) if existing.same_holder(held) => {}
                _ => return Err(StoreError::LockLost(held.app_name.clone())),
            }
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(held.app_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// Delete a lock row if `held` still owns it. Returns true if deleted.
    pub fn release_lock(&self, held: &LockRecord) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing: Option<LockRecord> =
                match table.get(held.app_id).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            if !existing.is_some_and(|existing| existing.same_holder(held)) {
                drop(table);
                txn.abort().map_err(map_err!(Transaction))?;
                return Ok(false);
            }
            table.remove(held.app_id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }
}

// ── Transaction helpers ────────────────────────────────────────────

fn bump_sequence(table: &mut Table<'_, &'static str, u64>, name: &str) -> StoreResult<u64> {
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn insert_edge(
    by_ts: &mut EdgeTable<'_>,
    by_comp: &mut EdgeTable<'_>,
    edge: &CompDepends,
) -> StoreResult<bool> {
    let inserted = by_ts
        .insert((edge.ts_key, edge.comp_id), ())
        .map_err(map_err!(Write))?
        .is_none();
    by_comp
        .insert((edge.comp_id, edge.ts_key), ())
        .map_err(map_err!(Write))?;
    Ok(inserted)
}

fn delete_comp_edges(
    by_ts: &mut EdgeTable<'_>,
    by_comp: &mut EdgeTable<'_>,
    comp_id: CompId,
) -> StoreResult<u64> {
    let mut ts_keys = Vec::new();
    for entry in by_comp
        .range((comp_id, 0u64)..=(comp_id, u64::MAX))
        .map_err(map_err!(Read))?
    {
        let (key, _) = entry.map_err(map_err!(Read))?;
        ts_keys.push(key.value().1);
    }
    for ts_key in &ts_keys {
        by_comp.remove((comp_id, *ts_key)).map_err(map_err!(Write))?;
        by_ts.remove((*ts_key, comp_id)).map_err(map_err!(Write))?;
    }
    Ok(ts_keys.len() as u64)
}

fn delete_ts_edges(
    by_ts: &mut EdgeTable<'_>,
    by_comp: &mut EdgeTable<'_>,
    ts_key: TsKey,
) -> StoreResult<u64> {
    let mut comp_ids = Vec::new();
    for entry in by_ts
        .range((ts_key, 0u64)..=(ts_key, u64::MAX))
        .map_err(map_err!(Read))?
    {
        let (key, _) = entry.map_err(map_err!(Read))?;
        comp_ids.push(key.value().1);
    }
    for comp_id in &comp_ids {
        by_ts.remove((ts_key, *comp_id)).map_err(map_err!(Write))?;
        by_comp.remove((*comp_id, ts_key)).map_err(map_err!(Write))?;
    }
    Ok(comp_ids.len() as u64)
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
