//! Computation cache.
//!
//! Holds the enabled computations of one application. When a parameter's
//! surrogate is the series key, cached copies have their explicitly bound
//! inputs expanded with the pattern fields of the bound series, so they
//! match new series by name the way pattern inputs do.

use std::collections::BTreeSet;
use std::time::Duration;

use compdepends_core::{AppId, CompId, DbComputation, GroupId, KeyScheme};
use compdepends_store::TsdbStore;
use tracing::debug;

use crate::cache::ObjectCache;
use crate::error::EngineResult;
use crate::tsid_cache::TsidCache;

pub struct CompCache {
    cache: ObjectCache<DbComputation>,
    app_id: Option<AppId>,
    key_scheme: KeyScheme,
}

impl CompCache {
    pub fn new(
        app_id: Option<AppId>,
        key_scheme: KeyScheme,
        max_age: Option<Duration>,
        case_sensitive: bool,
    ) -> Self {
        Self {
            cache: ObjectCache::new(max_age, case_sensitive),
            app_id,
            key_scheme,
        }
    }

    /// Whether a stored computation belongs to another application.
    pub fn is_foreign(&self, comp: &DbComputation) -> bool {
        self.app_id.is_some_and(|app| comp.app_id != Some(app))
    }

    /// Whether a stored computation belongs in this cache.
    fn admits(&self, comp: &DbComputation) -> bool {
        comp.enabled && !self.is_foreign(comp)
    }

    fn expand(&self, comp: &mut DbComputation, tsids: &TsidCache) {
        if self.key_scheme == KeyScheme::SdiIsTsKey {
            expand_inputs(comp, tsids);
        }
    }

    /// Reload every enabled computation of the application.
    pub fn refresh(&mut self, store: &TsdbStore, tsids: &TsidCache) -> EngineResult<usize> {
        let comps = store.list_computations(self.app_id)?;
        self.cache.clear();
        for mut comp in comps.into_iter().filter(|c| c.enabled) {
            self.expand(&mut comp, tsids);
            self.cache.put(comp);
        }
        debug!(count = self.cache.len(), app_id = ?self.app_id, "computation cache refreshed");
        Ok(self.cache.len())
    }

    /// Re-read one computation. Returns the cached copy when it is enabled
    /// and belongs to the application, otherwise drops it from the cache.
    pub fn load(
        &mut self,
        store: &TsdbStore,
        id: CompId,
        tsids: &TsidCache,
    ) -> EngineResult<Option<DbComputation>> {
        match store.get_computation(id)? {
            Some(mut comp) if self.admits(&comp) => {
                self.expand(&mut comp, tsids);
                self.cache.put(comp.clone());
                Ok(Some(comp))
            }
            _ => {
                self.cache.remove(id);
                Ok(None)
            }
        }
    }

    /// The stored row of a cached computation, confirmed against the store.
    ///
    /// A cached copy whose `last_modified` stamp no longer matches the
    /// stored row was edited elsewhere; it is replaced by the stored row
    /// (or dropped if the row is gone or disabled). Returns the stored row
    /// as written, without expanded inputs, so it can be persisted again.
    pub fn get_fresh(
        &mut self,
        store: &TsdbStore,
        id: CompId,
        tsids: &TsidCache,
    ) -> EngineResult<Option<DbComputation>> {
        let stored = store.get_computation(id)?;
        let stamp = stored.as_ref().map(|c| c.last_modified);
        if self
            .cache
            .get_by_key_checked(id, |cached| Some(cached.last_modified) == stamp)
            .is_some()
        {
            return Ok(stored);
        }

        debug!(comp_id = id, "cached computation is stale, re-reading");
        match stored {
            Some(comp) if self.admits(&comp) => {
                let mut expanded = comp.clone();
                self.expand(&mut expanded, tsids);
                self.cache.put(expanded);
                Ok(Some(comp))
            }
            _ => Ok(None),
        }
    }

    pub fn put(&mut self, mut comp: DbComputation, tsids: &TsidCache) {
        if self.admits(&comp) {
            self.expand(&mut comp, tsids);
            self.cache.put(comp);
        } else {
            self.cache.remove(comp.id);
        }
    }

    pub fn get(&self, id: CompId) -> Option<&DbComputation> {
        self.cache.get_by_key(id)
    }

    /// Presence regardless of entry age.
    pub fn contains(&self, id: CompId) -> bool {
        self.cache.contains_key(id)
    }

    pub fn remove(&mut self, id: CompId) -> Option<DbComputation> {
        self.cache.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DbComputation> {
        self.cache.iter()
    }

    /// Ids of cached computations bound to any of the given groups.
    pub fn bound_to(&self, groups: &BTreeSet<GroupId>) -> BTreeSet<CompId> {
        self.cache
            .iter()
            .filter(|c| c.group_id.is_some_and(|g| groups.contains(&g)))
            .map(|c| c.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Fill in the pattern fields of every explicitly bound input from the
/// series it is bound to. Fields the parameter already names are kept.
pub fn expand_inputs(comp: &mut DbComputation, tsids: &TsidCache) {
    fn fill(field: &mut Option<String>, value: &str) {
        if field.as_deref().is_none_or(str::is_empty) && !value.is_empty() {
            *field = Some(value.to_string());
        }
    }

    for parm in comp.parms.iter_mut().filter(|p| p.is_input()) {
        let Some(tsid) = parm.sdi.and_then(|k| tsids.get(k)) else {
            continue;
        };
        let path = &tsid.path;
        fill(&mut parm.site, &path.site);
        fill(&mut parm.data_type, &path.data_type);
        fill(&mut parm.interval, &path.interval);
        fill(&mut parm.table_selector, &path.table_selector);
        if parm.model_id.is_none() {
            parm.model_id = path.model_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compdepends_core::{CompParm, TsPath};

    fn setup() -> (TsdbStore, TsidCache) {
        let store = TsdbStore::open_in_memory().unwrap();
        store
            .create_tsid(TsPath::new("SiteA", "Stage").with_interval("1Hour"))
            .unwrap();
        let mut tsids = TsidCache::new(None, false);
        tsids.refresh(&store).unwrap();
        (store, tsids)
    }

    #[test]
    fn refresh_keeps_enabled_computations_of_the_application() {
        let (store, tsids) = setup();
        let mut a = DbComputation::new(1, "a");
        a.app_id = Some(5);
        let mut b = DbComputation::new(2, "b");
        b.app_id = Some(5);
        b.enabled = false;
        let mut c = DbComputation::new(3, "c");
        c.app_id = Some(6);
        for comp in [&a, &b, &c] {
            store.put_computation(comp).unwrap();
        }

        let mut cache = CompCache::new(Some(5), KeyScheme::SdiIsTsKey, None, false);
        assert_eq!(cache.refresh(&store, &tsids).unwrap(), 1);
        assert!(cache.get(1).is_some());
        assert!(cache.is_foreign(&c));
        assert!(!cache.is_foreign(&b));
    }

    #[test]
    fn bound_inputs_are_expanded_from_the_series() {
        let (_store, tsids) = setup();
        let mut comp = DbComputation::new(1, "a")
            .with_parm(CompParm::input("in").bound_to(1))
            .with_parm(CompParm::output("out").bound_to(1));
        expand_inputs(&mut comp, &tsids);

        let input = &comp.parms[0];
        assert_eq!(input.site.as_deref(), Some("SiteA"));
        assert_eq!(input.data_type.as_deref(), Some("Stage"));
        assert_eq!(input.interval.as_deref(), Some("1Hour"));
        assert!(input.table_selector.is_none());
        assert!(comp.parms[1].site.is_none());
    }

    #[test]
    fn surrogates_are_not_expanded_when_resolving_by_name() {
        let (store, tsids) = setup();
        let comp = DbComputation::new(1, "a").with_parm(
            CompParm::input("in")
                .bound_to(1)
                .with_site("SiteB")
                .with_data_type("Flow"),
        );
        store.put_computation(&comp).unwrap();

        let mut cache = CompCache::new(None, KeyScheme::ResolveByName, None, false);
        cache.refresh(&store, &tsids).unwrap();
        let cached = &cache.get(1).unwrap().parms[0];
        assert_eq!(cached.site.as_deref(), Some("SiteB"));
        assert!(cached.interval.is_none());
    }

    #[test]
    fn load_drops_disabled_computations() {
        let (store, tsids) = setup();
        let mut comp = DbComputation::new(1, "a");
        store.put_computation(&comp).unwrap();

        let mut cache = CompCache::new(None, KeyScheme::SdiIsTsKey, None, false);
        assert!(cache.load(&store, 1, &tsids).unwrap().is_some());

        comp.enabled = false;
        store.put_computation(&comp).unwrap();
        assert!(cache.load(&store, 1, &tsids).unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn get_fresh_replaces_copies_edited_elsewhere() {
        let (store, tsids) = setup();
        let comp = DbComputation::new(1, "a").with_parm(CompParm::input("in").bound_to(1));
        store.put_computation(&comp).unwrap();
        let mut cache = CompCache::new(None, KeyScheme::SdiIsTsKey, None, false);
        cache.refresh(&store, &tsids).unwrap();

        // Current: the stored row comes back unexpanded.
        let fresh = cache.get_fresh(&store, 1, &tsids).unwrap().unwrap();
        assert!(fresh.parms[0].site.is_none());

        let mut edited = comp.clone();
        edited.last_modified = 50;
        edited.name = "renamed".to_string();
        store.put_computation(&edited).unwrap();

        let fresh = cache.get_fresh(&store, 1, &tsids).unwrap().unwrap();
        assert_eq!(fresh.name, "renamed");
        assert_eq!(cache.get(1).unwrap().last_modified, 50);

        store.delete_computation(1).unwrap();
        assert!(cache.get_fresh(&store, 1, &tsids).unwrap().is_none());
        assert!(cache.get(1).is_none());
    }
}
