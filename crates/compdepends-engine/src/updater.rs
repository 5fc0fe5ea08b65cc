//! Notification processor.
//!
//! `DependsUpdater` owns the TSID, group and computation caches of one
//! application and keeps the persisted edge set in step with them. Each
//! change notification is applied as one incremental [`DependsUpdate`];
//! a full evaluation recomputes every edge into a scratch set and writes
//! only the difference.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use compdepends_core::{
    AppId, CompId, CpDependsNotify, DbComputation, DependsConfig, DependsEvent, GroupId,
    KeyScheme, TsKey, TsPath, Tsid,
};
use compdepends_store::{DependsDelta, DependsUpdate, TsdbStore, epoch_secs};
use tracing::{debug, info, warn};

use crate::comp_cache::CompCache;
use crate::error::EngineResult;
use crate::groups::GroupCache;
use crate::reconcile::{Evaluation, comp_uses_tsid, evaluate_computation, parm_names_series};
use crate::tsid_cache::TsidCache;

/// Tunables of the updater, usually taken from [`DependsConfig`].
#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub key_scheme: KeyScheme,
    pub case_sensitive: bool,
    pub tsid_max_age: Option<Duration>,
    pub comp_max_age: Option<Duration>,
    pub refresh_interval: Duration,
    pub group_dump_dir: Option<PathBuf>,
}

impl UpdaterSettings {
    pub fn from_config(config: &DependsConfig) -> Self {
        Self {
            key_scheme: config.depends.key_scheme,
            case_sensitive: config.cache.name_case_sensitive,
            tsid_max_age: config.cache.tsid_max_age_secs.map(Duration::from_secs),
            comp_max_age: config.cache.comp_max_age_secs.map(Duration::from_secs),
            refresh_interval: Duration::from_secs(config.daemon.refresh_interval_secs),
            group_dump_dir: config.depends.group_dump_dir.clone(),
        }
    }
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self::from_config(&DependsConfig::default())
    }
}

/// What one call to [`DependsUpdater::poll`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The queue was empty.
    Idle,
    /// Same as the previous notification; not processed.
    Duplicate(CpDependsNotify),
    Processed(CpDependsNotify),
}

pub struct DependsUpdater {
    store: TsdbStore,
    app_id: Option<AppId>,
    settings: UpdaterSettings,
    tsids: TsidCache,
    groups: GroupCache,
    comps: CompCache,
    last_notify: Option<CpDependsNotify>,
    last_refresh: Option<Instant>,
    done: u64,
    errs: u64,
}

impl DependsUpdater {
    /// Create an updater for the computations of `app_id` (all
    /// computations when `None`). Caches start empty; call
    /// [`DependsUpdater::refresh_caches`] or [`DependsUpdater::full_eval`].
    pub fn new(store: TsdbStore, app_id: Option<AppId>, settings: UpdaterSettings) -> Self {
        Self {
            store,
            app_id,
            tsids: TsidCache::new(settings.tsid_max_age, settings.case_sensitive),
            groups: GroupCache::new(settings.group_dump_dir.clone()),
            comps: CompCache::new(
                app_id,
                settings.key_scheme,
                settings.comp_max_age,
                settings.case_sensitive,
            ),
            settings,
            last_notify: None,
            last_refresh: None,
            done: 0,
            errs: 0,
        }
    }

    pub fn store(&self) -> &TsdbStore {
        &self.store
    }

    /// Let go of the store handle after a connectivity failure so the
    /// database file can be opened again. Until [`DependsUpdater::reconnect`]
    /// the updater points at an empty in-memory store.
    pub fn disconnect(&mut self) -> EngineResult<()> {
        self.store = TsdbStore::open_in_memory()?;
        self.last_refresh = None;
        warn!("store handle released");
        Ok(())
    }

    /// Swap in a freshly opened store after a connectivity failure.
    /// Cached state is kept; the next [`DependsUpdater::refresh_due`] is true.
    pub fn reconnect(&mut self, store: TsdbStore) {
        self.store = store;
        self.last_refresh = None;
        info!("store reconnected, full refresh pending");
    }

    pub fn tsids(&self) -> &TsidCache {
        &self.tsids
    }

    pub fn groups(&self) -> &GroupCache {
        &self.groups
    }

    pub fn comps(&self) -> &CompCache {
        &self.comps
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn errs(&self) -> u64 {
        self.errs
    }

    /// Lock status string for external monitoring.
    pub fn status(&self) -> String {
        format!("Done={}, Errs={}", self.done, self.errs)
    }

    /// Whether the periodic full refresh is due.
    pub fn refresh_due(&self) -> bool {
        self.last_refresh
            .is_none_or(|at| at.elapsed() >= self.settings.refresh_interval)
    }

    /// Rebuild every cache from the store.
    pub fn refresh_caches(&mut self) -> EngineResult<()> {
        let tsids = self.tsids.refresh(&self.store)?;
        let groups = self.groups.refresh(&self.store)?;
        self.groups.eval_all(&self.tsids);
        let comps = self.comps.refresh(&self.store, &self.tsids)?;
        self.last_refresh = Some(Instant::now());
        self.dump_tsids();
        info!(tsids, groups, comps, "caches refreshed");
        Ok(())
    }

    /// Fetch and process the next notification, if any.
    pub fn poll(&mut self) -> EngineResult<PollOutcome> {
        let Some(notify) = self.store.next_notify()? else {
            return Ok(PollOutcome::Idle);
        };
        if self.last_notify.as_ref() == Some(&notify) {
            info!(%notify, "duplicate notification ignored");
            return Ok(PollOutcome::Duplicate(notify));
        }
        self.last_notify = Some(notify.clone());
        debug!(%notify, "processing notification");
        self.process(notify.event)?;
        Ok(PollOutcome::Processed(notify))
    }

    /// Apply one event and count the outcome.
    ///
    /// Series whose cache entries have aged out are re-read first. Fatal
    /// and connectivity errors are returned to the caller. Any other
    /// failure is logged and counted, and processing continues.
    pub fn process(&mut self, event: DependsEvent) -> EngineResult<()> {
        let result = self.tsids.revalidate(&self.store).and_then(|_| match event {
            DependsEvent::TsCreated { ts_key } => self.ts_created(ts_key),
            DependsEvent::TsDeleted { ts_key } => self.ts_deleted(ts_key),
            DependsEvent::TsModified { ts_key } => self.ts_modified(ts_key),
            DependsEvent::CompModified { comp_id } => self.comp_modified(comp_id),
            DependsEvent::GroupModified { group_id } => self.group_modified(group_id),
            DependsEvent::FullEval => self.full_eval().map(|_| ()),
        });
        match result {
            Ok(()) => {
                self.done += 1;
                Ok(())
            }
            Err(e) if e.is_fatal() || e.is_connectivity() => {
                self.errs += 1;
                Err(e)
            }
            Err(e) => {
                self.errs += 1;
                warn!(event = event.label(), key = ?event.target_key(), error = %e, "notification failed");
                Ok(())
            }
        }
    }

    // ── Event handlers ─────────────────────────────────────────────

    pub fn ts_created(&mut self, ts_key: TsKey) -> EngineResult<()> {
        let Some(tsid) = self.store.get_tsid(ts_key)? else {
            info!(ts_key, "created series no longer exists, treating as deleted");
            return self.ts_deleted(ts_key);
        };
        info!(ts_key, tsid = %tsid.path, "series created");

        let update = self.stage_created(tsid, BTreeSet::new())?;
        let counts = self.store.commit_update(&update)?;
        debug!(ts_key, ?counts, "series creation applied");
        self.dump_tsids();
        Ok(())
    }

    pub fn ts_deleted(&mut self, ts_key: TsKey) -> EngineResult<()> {
        let removed = self.tsids.remove(ts_key);
        info!(ts_key, tsid = ?removed.as_ref().map(Tsid::unique_string), "series deleted");

        let affected = self.groups.drop_from_expansions(ts_key);
        let listed_in = self.groups.remove_member(ts_key);
        self.groups.reexpand(&affected, &self.tsids);

        let mut update = DependsUpdate::default();
        update.drop_ts.insert(ts_key);
        update.drop_members = listed_in.into_iter().map(|g| (g, ts_key)).collect();

        let path = removed.map(|t| t.path);
        let (scheme, case_sensitive) = (self.settings.key_scheme, self.settings.case_sensitive);
        let bound: Vec<CompId> = self
            .comps
            .iter()
            .filter(|c| {
                c.parms
                    .iter()
                    .any(|p| parm_names_series(p, ts_key, path.as_ref(), scheme, case_sensitive))
            })
            .map(|c| c.id)
            .collect();
        for comp_id in bound {
            self.unbind_deleted(comp_id, ts_key, path.as_ref(), &mut update)?;
        }

        let regroup = self.comps.bound_to(&affected);
        merge(&mut update, self.stage(regroup)?);

        let counts = self.store.commit_update(&update)?;
        debug!(ts_key, ?counts, "series deletion applied");
        self.dump_tsids();
        Ok(())
    }

    /// Re-resolve a series whose identity changed: its old edges and group
    /// memberships are dropped and it is matched again as if new. Explicit
    /// group memberships and parameter bindings stay, since the series
    /// itself still exists.
    pub fn ts_modified(&mut self, ts_key: TsKey) -> EngineResult<()> {
        let Some(tsid) = self.store.get_tsid(ts_key)? else {
            info!(ts_key, "modified series no longer exists, treating as deleted");
            return self.ts_deleted(ts_key);
        };
        info!(ts_key, tsid = %tsid.path, "series modified");

        self.tsids.remove(ts_key);
        let previously = self.groups.drop_from_expansions(ts_key);
        let mut update = self.stage_created(tsid, previously)?;
        update.drop_ts.insert(ts_key);

        let counts = self.store.commit_update(&update)?;
        debug!(ts_key, ?counts, "series modification applied");
        self.dump_tsids();
        Ok(())
    }

    pub fn comp_modified(&mut self, comp_id: CompId) -> EngineResult<()> {
        if let Some(row) = self.store.get_computation(comp_id)?
            && self.comps.is_foreign(&row)
        {
            self.comps.remove(comp_id);
            debug!(comp_id, app_id = ?row.app_id, "computation of another application, edges left alone");
            return Ok(());
        }

        let mut update = DependsUpdate::default();
        update.replace_comps.insert(comp_id);

        match self.comps.load(&self.store, comp_id, &self.tsids)? {
            Some(comp) => {
                let orphaned = match comp.group_id {
                    Some(group_id) => !self.ensure_group(group_id)?,
                    None => false,
                };
                if orphaned {
                    self.disable(comp_id, &mut update, "bound group no longer exists")?;
                } else {
                    let eval = self.evaluate(&comp);
                    info!(comp_id, name = %comp.name, edges = eval.edges.len(), "computation modified");
                    update.edges = eval.edges;
                }
            }
            None => {
                info!(comp_id, "computation deleted or disabled, dropping its edges");
            }
        }

        let counts = self.store.commit_update(&update)?;
        debug!(comp_id, ?counts, "computation change applied");
        Ok(())
    }

    pub fn group_modified(&mut self, group_id: GroupId) -> EngineResult<()> {
        match self.store.get_group(group_id)? {
            Some(group) => {
                info!(group_id, name = %group.name, "group modified");
                self.groups.put_def(group);
            }
            None => {
                info!(group_id, "group deleted");
                self.groups.remove_def(group_id);
            }
        }

        let mut affected = self.groups.evaluate_parents(group_id);
        affected.insert(group_id);
        self.groups.reexpand(&affected, &self.tsids);

        let mut update = DependsUpdate::default();
        let mut live = BTreeSet::new();
        let bound: Vec<(CompId, GroupId)> = self
            .comps
            .iter()
            .filter_map(|c| c.group_id.map(|g| (c.id, g)))
            .filter(|(_, g)| affected.contains(g))
            .collect();
        for (comp_id, bound_group) in bound {
            if self.groups.get(bound_group).is_some() {
                live.insert(comp_id);
            } else {
                self.disable(comp_id, &mut update, "bound group no longer exists")?;
            }
        }
        debug!(group_id, groups = affected.len(), comps = live.len(), "re-evaluating group computations");
        merge(&mut update, self.stage(live)?);

        let counts = self.store.commit_update(&update)?;
        debug!(group_id, ?counts, "group change applied");
        Ok(())
    }

    /// Refresh every cache, recompute every edge into a scratch set, and
    /// reconcile the persisted edge set against it.
    ///
    /// Edges of computations stored under another application are left
    /// alone. Every other edge not in the scratch set is removed, including
    /// those of computations whose rows no longer exist.
    pub fn full_eval(&mut self) -> EngineResult<DependsDelta> {
        info!("full evaluation starting");
        self.refresh_caches()?;

        let orphaned: Vec<CompId> = self
            .comps
            .iter()
            .filter(|c| c.group_id.is_some_and(|g| self.groups.get(g).is_none()))
            .map(|c| c.id)
            .collect();
        if !orphaned.is_empty() {
            let mut update = DependsUpdate::default();
            for comp_id in orphaned {
                self.disable(comp_id, &mut update, "bound group no longer exists")?;
            }
            self.store.commit_update(&update)?;
        }

        let mut scratch = BTreeSet::new();
        let mut skipped = 0;
        for comp in self.comps.iter() {
            let eval = self.evaluate(comp);
            skipped += eval.skipped.len();
            scratch.extend(eval.edges);
        }

        let foreign: BTreeSet<CompId> = match self.app_id {
            Some(_) => self
                .store
                .list_computations(None)?
                .into_iter()
                .filter(|c| self.comps.is_foreign(c))
                .map(|c| c.id)
                .collect(),
            None => BTreeSet::new(),
        };
        let delta = self.store.reconcile_comp_depends(&scratch, &foreign)?;
        info!(
            comps = self.comps.len(),
            edges = scratch.len(),
            removed = delta.removed,
            added = delta.added,
            skipped,
            "full evaluation complete"
        );
        Ok(delta)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn evaluate(&self, comp: &DbComputation) -> Evaluation {
        evaluate_computation(comp, &self.tsids, &self.groups, self.settings.key_scheme)
    }

    /// Cached computation, re-read from the store once its entry has aged out.
    fn current_comp(&mut self, comp_id: CompId) -> EngineResult<Option<DbComputation>> {
        if let Some(comp) = self.comps.get(comp_id) {
            return Ok(Some(comp.clone()));
        }
        if self.comps.contains(comp_id) {
            debug!(comp_id, "cached computation aged out, re-reading");
            return self.comps.load(&self.store, comp_id, &self.tsids);
        }
        Ok(None)
    }

    /// Replace the edges of the given computations with freshly evaluated ones.
    fn stage(&mut self, comp_ids: BTreeSet<CompId>) -> EngineResult<DependsUpdate> {
        let mut update = DependsUpdate::default();
        for &comp_id in &comp_ids {
            if let Some(comp) = self.current_comp(comp_id)? {
                update.edges.extend(self.evaluate(&comp).edges);
            }
        }
        update.replace_comps = comp_ids;
        Ok(update)
    }

    /// Admit a series to the caches and stage every computation it could
    /// feed: those bound to a group it joins and those matching it directly.
    fn stage_created(
        &mut self,
        tsid: Tsid,
        also_affected: BTreeSet<GroupId>,
    ) -> EngineResult<DependsUpdate> {
        self.tsids.insert(tsid.clone());
        let mut affected = self.groups.check_membership(&tsid);
        affected.extend(self.groups.with_parents(&also_affected));
        self.groups.reexpand(&affected, &self.tsids);

        let scheme = self.settings.key_scheme;
        let mut touched = self.comps.bound_to(&affected);
        touched.extend(
            self.comps
                .iter()
                .filter(|c| comp_uses_tsid(c, &tsid, &self.tsids, &self.groups, scheme))
                .map(|c| c.id),
        );
        debug!(ts_key = tsid.key, groups = affected.len(), comps = touched.len(), "staging series");
        self.stage(touched)
    }

    /// Detach a deleted series from one computation. A computation that
    /// loses a required input is disabled.
    ///
    /// When the surrogate is the series key the binding is cleared. When
    /// parameters are resolved by name the row keeps its pattern fields and
    /// is only rewritten to disable it.
    fn unbind_deleted(
        &mut self,
        comp_id: CompId,
        ts_key: TsKey,
        path: Option<&TsPath>,
        update: &mut DependsUpdate,
    ) -> EngineResult<()> {
        let Some(mut row) = self.comps.get_fresh(&self.store, comp_id, &self.tsids)? else {
            update.replace_comps.insert(comp_id);
            return Ok(());
        };

        let (scheme, case_sensitive) = (self.settings.key_scheme, self.settings.case_sensitive);
        let mut matched = false;
        let mut lost_required = false;
        for parm in row
            .parms
            .iter_mut()
            .filter(|p| parm_names_series(p, ts_key, path, scheme, case_sensitive))
        {
            matched = true;
            lost_required |= parm.is_input() && parm.is_required();
            if scheme == KeyScheme::SdiIsTsKey {
                parm.sdi = None;
            }
        }
        if !matched {
            debug!(comp_id, ts_key, "binding already removed elsewhere");
            return Ok(());
        }

        let rewrite = lost_required || scheme == KeyScheme::SdiIsTsKey;
        if lost_required {
            row.enabled = false;
            warn!(comp_id, name = %row.name, ts_key, "required input deleted, disabling computation");
        } else {
            info!(comp_id, name = %row.name, ts_key, "optional input deleted");
        }

        update.replace_comps.insert(comp_id);
        if rewrite {
            row.last_modified = epoch_secs();
            self.comps.put(row.clone(), &self.tsids);
        }
        if let Some(comp) = self.comps.get(comp_id) {
            update.edges.extend(self.evaluate(comp).edges);
        }
        if rewrite {
            update.computations.push(row);
        }
        Ok(())
    }

    /// Stage the disablement of a computation and drop it from the cache.
    fn disable(
        &mut self,
        comp_id: CompId,
        update: &mut DependsUpdate,
        reason: &str,
    ) -> EngineResult<()> {
        update.replace_comps.insert(comp_id);
        let row = self.comps.get_fresh(&self.store, comp_id, &self.tsids)?;
        self.comps.remove(comp_id);
        let Some(mut row) = row else {
            return Ok(());
        };
        row.enabled = false;
        row.last_modified = epoch_secs();
        warn!(comp_id, name = %row.name, reason, "disabling computation");
        update.computations.push(row);
        Ok(())
    }

    /// Whether a group exists, loading it when the cache has not seen it yet.
    fn ensure_group(&mut self, group_id: GroupId) -> EngineResult<bool> {
        if self.groups.get(group_id).is_some() {
            return Ok(true);
        }
        let Some(group) = self.store.get_group(group_id)? else {
            return Ok(false);
        };
        debug!(group_id, name = %group.name, "loading group not yet cached");
        self.groups.put_def(group);
        let mut ids = self.groups.evaluate_parents(group_id);
        ids.insert(group_id);
        self.groups.reexpand(&ids, &self.tsids);
        Ok(true)
    }

    fn dump_tsids(&self) {
        if let Some(dir) = &self.settings.group_dump_dir {
            self.tsids.dump(dir);
        }
    }
}

/// Fold a staged update into another.
fn merge(into: &mut DependsUpdate, from: DependsUpdate) {
    into.replace_comps.extend(from.replace_comps);
    into.edges.extend(from.edges);
    into.drop_ts.extend(from.drop_ts);
    into.drop_members.extend(from.drop_members);
    into.computations.extend(from.computations);
}
