//! Group expansion engine.
//!
//! A group's expanded list is its explicit members plus every series its
//! criteria match, then the union of its included sub-groups, minus its
//! excluded sub-groups, intersected with each intersect sub-group.
//!
//! Expansion is a depth-first walk over the sub-group graph. Results are
//! memoized per group id for the duration of one walk, so a group reached
//! along several paths (a diamond) is expanded once and contributes its
//! full membership everywhere. A group reached again while it is still on
//! the walk's path is a cycle: it contributes nothing on that edge and a
//! warning names it. Results cut short by such a cycle are not memoized,
//! so every group in a cycle sees the members of the others.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

use compdepends_core::{Combine, GroupId, TsGroup, TsKey, Tsid};
use compdepends_store::TsdbStore;
use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::tsid_cache::{TsidCache, write_dump};

/// Group definitions and their expanded membership.
pub struct GroupCache {
    defs: HashMap<GroupId, TsGroup>,
    expanded: HashMap<GroupId, BTreeSet<TsKey>>,
    dump_dir: Option<PathBuf>,
}

/// One expansion walk: memo of finished groups plus the groups on the
/// current path.
struct Expansion<'a> {
    defs: &'a HashMap<GroupId, TsGroup>,
    tsids: &'a TsidCache,
    memo: HashMap<GroupId, BTreeSet<TsKey>>,
    path: Vec<GroupId>,
}

impl<'a> Expansion<'a> {
    fn new(defs: &'a HashMap<GroupId, TsGroup>, tsids: &'a TsidCache) -> Self {
        Self {
            defs,
            tsids,
            memo: HashMap::new(),
            path: Vec::new(),
        }
    }

    fn expand(&mut self, group_id: GroupId) -> BTreeSet<TsKey> {
        self.walk(group_id).0
    }

    /// Expand one group. Also returns the shallowest path position at which
    /// a cycle was cut below it, if any.
    fn walk(&mut self, group_id: GroupId) -> (BTreeSet<TsKey>, Option<usize>) {
        if let Some(done) = self.memo.get(&group_id) {
            return (done.clone(), None);
        }
        if let Some(pos) = self.path.iter().position(|g| *g == group_id) {
            warn!(group_id, path = ?self.path, "circular sub-group reference, skipping repeated visit");
            return (BTreeSet::new(), Some(pos));
        }
        let defs = self.defs;
        let Some(group) = defs.get(&group_id) else {
            debug!(group_id, "referenced group not cached, treating as empty");
            return (BTreeSet::new(), None);
        };

        let depth = self.path.len();
        self.path.push(group_id);
        let mut cut = None;

        let mut members: BTreeSet<TsKey> = group
            .members
            .iter()
            .copied()
            .filter(|k| self.tsids.contains(*k))
            .collect();
        if group.has_criteria() {
            members.extend(
                self.tsids
                    .iter()
                    .filter(|t| group.matches_criteria(&t.path))
                    .map(|t| t.key),
            );
        }

        for sub in group.subgroups.iter().filter(|s| s.combine == Combine::Include) {
            let (included, c) = self.walk(sub.group_id);
            cut = shallowest(cut, c);
            members.extend(included);
        }
        for sub in group.subgroups.iter().filter(|s| s.combine == Combine::Exclude) {
            let (excluded, c) = self.walk(sub.group_id);
            cut = shallowest(cut, c);
            members.retain(|k| !excluded.contains(k));
        }
        for sub in group.subgroups.iter().filter(|s| s.combine == Combine::Intersect) {
            let (other, c) = self.walk(sub.group_id);
            cut = shallowest(cut, c);
            members.retain(|k| other.contains(k));
        }

        self.path.pop();
        // Cut short at an ancestor: partial, so it stays out of the memo.
        if cut.is_some_and(|pos| pos < depth) {
            return (members, cut);
        }
        self.memo.insert(group_id, members.clone());
        (members, None)
    }
}

fn shallowest(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

impl GroupCache {
    pub fn new(dump_dir: Option<PathBuf>) -> Self {
        Self {
            defs: HashMap::new(),
            expanded: HashMap::new(),
            dump_dir,
        }
    }

    /// Reload every group definition. Expanded lists are cleared until the
    /// next [`GroupCache::eval_all`].
    pub fn refresh(&mut self, store: &TsdbStore) -> EngineResult<usize> {
        let groups = store.list_groups()?;
        self.defs = groups.into_iter().map(|g| (g.id, g)).collect();
        self.expanded.clear();
        debug!(count = self.defs.len(), "group cache refreshed");
        Ok(self.defs.len())
    }

    pub fn put_def(&mut self, group: TsGroup) {
        self.defs.insert(group.id, group);
    }

    pub fn remove_def(&mut self, group_id: GroupId) -> Option<TsGroup> {
        self.expanded.remove(&group_id);
        self.defs.remove(&group_id)
    }

    pub fn get(&self, group_id: GroupId) -> Option<&TsGroup> {
        self.defs.get(&group_id)
    }

    pub fn expanded(&self, group_id: GroupId) -> Option<&BTreeSet<TsKey>> {
        self.expanded.get(&group_id)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Expand a single group without storing the result.
    pub fn expand(&self, group_id: GroupId, tsids: &TsidCache) -> BTreeSet<TsKey> {
        Expansion::new(&self.defs, tsids).expand(group_id)
    }

    /// Expand every cached group.
    pub fn eval_all(&mut self, tsids: &TsidCache) {
        let ids: BTreeSet<GroupId> = self.defs.keys().copied().collect();
        self.expanded.clear();
        self.reexpand(&ids, tsids);
    }

    /// Re-expand the given groups in one walk and store the results.
    /// Ids with no cached definition are dropped.
    pub fn reexpand(&mut self, group_ids: &BTreeSet<GroupId>, tsids: &TsidCache) {
        let mut walk = Expansion::new(&self.defs, tsids);
        let mut results = Vec::with_capacity(group_ids.len());
        for &id in group_ids {
            if self.defs.contains_key(&id) {
                results.push((id, walk.expand(id)));
            }
        }
        for id in group_ids.iter().filter(|id| !self.defs.contains_key(id)) {
            self.expanded.remove(id);
        }
        for (id, members) in results {
            debug!(group_id = id, members = members.len(), "group expanded");
            self.expanded.insert(id, members);
            self.dump(id, tsids);
        }
    }

    /// Every group that references `group_id` directly or transitively.
    pub fn evaluate_parents(&self, group_id: GroupId) -> BTreeSet<GroupId> {
        let mut parents = BTreeSet::new();
        let mut queue = VecDeque::from([group_id]);
        while let Some(child) = queue.pop_front() {
            for group in self.defs.values().filter(|g| g.references(child)) {
                if parents.insert(group.id) {
                    queue.push_back(group.id);
                }
            }
        }
        parents
    }

    /// The given groups plus all of their parents.
    pub fn with_parents(&self, group_ids: &BTreeSet<GroupId>) -> BTreeSet<GroupId> {
        let mut all = group_ids.clone();
        for &id in group_ids {
            all.extend(self.evaluate_parents(id));
        }
        all
    }

    /// Groups whose membership a new series could change: those listing it
    /// explicitly or whose criteria match it, plus their parents.
    pub fn check_membership(&self, tsid: &Tsid) -> BTreeSet<GroupId> {
        let direct: BTreeSet<GroupId> = self
            .defs
            .values()
            .filter(|g| g.members.contains(&tsid.key) || g.matches_criteria(&tsid.path))
            .map(|g| g.id)
            .collect();
        self.with_parents(&direct)
    }

    /// Remove a series from every expanded list. Returns the groups whose
    /// expanded list contained it.
    pub fn drop_from_expansions(&mut self, key: TsKey) -> BTreeSet<GroupId> {
        let mut affected = BTreeSet::new();
        for (id, members) in self.expanded.iter_mut() {
            if members.remove(&key) {
                affected.insert(*id);
            }
        }
        affected
    }

    /// Remove a series from every explicit member list. Returns the groups
    /// that listed it.
    pub fn remove_member(&mut self, key: TsKey) -> Vec<GroupId> {
        let mut listed = Vec::new();
        for group in self.defs.values_mut() {
            let before = group.members.len();
            group.members.retain(|m| *m != key);
            if group.members.len() != before {
                listed.push(group.id);
            }
        }
        listed.sort_unstable();
        listed
    }

    /// Write `group-<id>.txt` when a dump directory is configured.
    fn dump(&self, group_id: GroupId, tsids: &TsidCache) {
        let (Some(dir), Some(group)) = (&self.dump_dir, self.defs.get(&group_id)) else {
            return;
        };
        let mut lines = vec![format!("Group {} '{}'", group.id, group.name)];
        if let Some(members) = self.expanded.get(&group_id) {
            lines.extend(members.iter().map(|k| match tsids.get(*k) {
                Some(t) => format!("{}\t{}", k, t.unique_string()),
                None => format!("{k}\t?"),
            }));
        }
        write_dump(&dir.join(format!("group-{group_id}.txt")), &lines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compdepends_core::TsPath;

    fn tsids(names: &[(u64, &str)]) -> TsidCache {
        let mut cache = TsidCache::new(None, false);
        for (key, name) in names {
            cache.insert(Tsid::new(*key, TsPath::parse(name).unwrap()));
        }
        cache
    }

    fn cache_of(groups: Vec<TsGroup>) -> GroupCache {
        let mut cache = GroupCache::new(None);
        for g in groups {
            cache.put_def(g);
        }
        cache
    }

    #[test]
    fn include_and_exclude() {
        // G = {a,b,c} + include {b,d} - exclude {c}
        let ts = tsids(&[(1, "A.x"), (2, "B.x"), (3, "C.x"), (4, "D.x")]);
        let groups = cache_of(vec![
            TsGroup::new(1, "G")
                .with_member(1)
                .with_member(2)
                .with_member(3)
                .with_subgroup(2, Combine::Include)
                .with_subgroup(3, Combine::Exclude),
            TsGroup::new(2, "inc").with_member(2).with_member(4),
            TsGroup::new(3, "exc").with_member(3),
        ]);

        assert_eq!(groups.expand(1, &ts), BTreeSet::from([1, 2, 4]));
    }

    #[test]
    fn intersect_narrows_membership() {
        let ts = tsids(&[(1, "A.x"), (2, "B.x"), (3, "C.x")]);
        let groups = cache_of(vec![
            TsGroup::new(1, "G")
                .with_member(1)
                .with_member(2)
                .with_member(3)
                .with_subgroup(2, Combine::Intersect),
            TsGroup::new(2, "narrow").with_member(2).with_member(3),
        ]);
        assert_eq!(groups.expand(1, &ts), BTreeSet::from([2, 3]));
    }

    #[test]
    fn criteria_join_explicit_members() {
        let ts = tsids(&[(1, "SiteA.Stage"), (2, "SiteB.Stage"), (3, "SiteB.Flow")]);
        let mut g = TsGroup::new(1, "stages").with_member(3);
        g.data_types.push("Stage".to_string());
        let groups = cache_of(vec![g]);
        assert_eq!(groups.expand(1, &ts), BTreeSet::from([1, 2, 3]));
    }

    #[test]
    fn unknown_members_are_ignored() {
        let ts = tsids(&[(1, "A.x")]);
        let groups = cache_of(vec![TsGroup::new(1, "G").with_member(1).with_member(99)]);
        assert_eq!(groups.expand(1, &ts), BTreeSet::from([1]));
    }

    #[test]
    fn self_reference_terminates() {
        let ts = tsids(&[(1, "A.x"), (2, "B.x")]);
        let groups = cache_of(vec![
            TsGroup::new(1, "loop").with_member(1).with_subgroup(1, Combine::Include),
            TsGroup::new(2, "a").with_member(2).with_subgroup(3, Combine::Include),
            TsGroup::new(3, "b").with_subgroup(2, Combine::Include),
        ]);
        assert_eq!(groups.expand(1, &ts), BTreeSet::from([1]));
        assert_eq!(groups.expand(2, &ts), BTreeSet::from([2]));
        assert_eq!(groups.expand(3, &ts), BTreeSet::from([2]));
    }

    #[test]
    fn cycle_members_see_each_other_in_one_walk() {
        let ts = tsids(&[(1, "A.x"), (2, "B.x")]);
        let mut groups = cache_of(vec![
            TsGroup::new(1, "a").with_member(1).with_subgroup(2, Combine::Include),
            TsGroup::new(2, "b").with_member(2).with_subgroup(1, Combine::Include),
        ]);
        groups.eval_all(&ts);
        assert_eq!(groups.expanded(1), Some(&BTreeSet::from([1, 2])));
        assert_eq!(groups.expanded(2), Some(&BTreeSet::from([1, 2])));
    }

    #[test]
    fn diamond_contributes_full_membership() {
        // top includes left and right, both include shared.
        let ts = tsids(&[(1, "A.x"), (2, "B.x")]);
        let groups = cache_of(vec![
            TsGroup::new(1, "top")
                .with_subgroup(2, Combine::Include)
                .with_subgroup(3, Combine::Include),
            TsGroup::new(2, "left").with_subgroup(4, Combine::Include),
            TsGroup::new(3, "right")
                .with_member(2)
                .with_subgroup(4, Combine::Include),
            TsGroup::new(4, "shared").with_member(1),
        ]);
        assert_eq!(groups.expand(1, &ts), BTreeSet::from([1, 2]));
        assert_eq!(groups.expand(2, &ts), BTreeSet::from([1]));
    }

    #[test]
    fn parents_are_found_transitively() {
        let groups = cache_of(vec![
            TsGroup::new(1, "grandparent").with_subgroup(2, Combine::Include),
            TsGroup::new(2, "parent").with_subgroup(3, Combine::Exclude),
            TsGroup::new(3, "child"),
            TsGroup::new(4, "unrelated"),
        ]);
        assert_eq!(groups.evaluate_parents(3), BTreeSet::from([1, 2]));
        assert!(groups.evaluate_parents(1).is_empty());
    }

    #[test]
    fn membership_check_covers_criteria_and_parents() {
        let mut stages = TsGroup::new(2, "stages");
        stages.data_types.push("Stage".to_string());
        let groups = cache_of(vec![
            TsGroup::new(1, "parent").with_subgroup(2, Combine::Include),
            stages,
            TsGroup::new(3, "flows").with_member(9),
        ]);
        let new = Tsid::new(5, TsPath::new("SiteC", "Stage"));
        assert_eq!(groups.check_membership(&new), BTreeSet::from([1, 2]));
    }

    #[test]
    fn removing_a_series_updates_lists() {
        let ts = tsids(&[(1, "A.x"), (2, "B.x")]);
        let mut groups = cache_of(vec![
            TsGroup::new(1, "parent").with_subgroup(2, Combine::Include),
            TsGroup::new(2, "child").with_member(1).with_member(2),
        ]);
        groups.eval_all(&ts);

        assert_eq!(groups.drop_from_expansions(1), BTreeSet::from([1, 2]));
        assert_eq!(groups.remove_member(1), vec![2]);
        assert_eq!(groups.expanded(1), Some(&BTreeSet::from([2])));
        assert_eq!(groups.get(2).unwrap().members, vec![2]);
    }

    #[test]
    fn expansion_dumps_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let ts = tsids(&[(1, "SiteA.Stage")]);
        let mut groups = GroupCache::new(Some(dir.path().to_path_buf()));
        groups.put_def(TsGroup::new(7, "Basin").with_member(1));
        groups.eval_all(&ts);

        let text = std::fs::read_to_string(dir.path().join("group-7.txt")).unwrap();
        assert_eq!(text, "Group 7 'Basin'\n1\tSiteA.Stage\n");
    }
}
