//! Dependency reconciler: the edges one computation implies.
//!
//! A computation without a group depends on each of its input series
//! directly. A group computation depends, for every member of its group's
//! expanded list and every input parameter, on the series found by
//! transforming a copy of the member's path with the parameter.

use std::collections::BTreeSet;

use compdepends_core::{
    CompDepends, CompParm, DbComputation, Interval, KeyScheme, TsKey, TsPath, Tsid,
};
use tracing::{debug, warn};

use crate::groups::GroupCache;
use crate::tsid_cache::TsidCache;

/// The candidate edges of one computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub edges: BTreeSet<CompDepends>,
    /// Role names of malformed parameters that were left out.
    pub skipped: Vec<String>,
}

/// Inputs that take part in matching. Malformed pattern parameters are
/// reported and left out so the rest of the computation is still
/// evaluated. A bound parameter's interval comes from its series and is
/// not checked.
fn usable_inputs<'c>(comp: &'c DbComputation, skipped: &mut Vec<String>) -> Vec<&'c CompParm> {
    let mut usable = Vec::new();
    for parm in comp.inputs() {
        if parm.sdi.is_none()
            && let Some(spec) = parm.interval.as_deref().filter(|s| !s.is_empty())
            && let Err(e) = Interval::parse(spec)
        {
            warn!(comp_id = comp.id, role = %parm.role_name, error = %e, "skipping malformed parameter");
            skipped.push(parm.role_name.clone());
            continue;
        }
        usable.push(parm);
    }
    usable
}

/// The series an explicitly specified parameter names.
fn resolve_explicit(parm: &CompParm, tsids: &TsidCache, scheme: KeyScheme) -> Option<TsKey> {
    match scheme {
        KeyScheme::SdiIsTsKey => parm.sdi,
        KeyScheme::ResolveByName => {
            let path = TsPath::from_parm(parm)?;
            tsids.lookup_path(&path).map(|t| t.key)
        }
    }
}

/// Whether an explicitly specified parameter names the series `ts_key`.
/// Matching by name needs the series' path; without it nothing matches.
pub fn parm_names_series(
    parm: &CompParm,
    ts_key: TsKey,
    path: Option<&TsPath>,
    scheme: KeyScheme,
    case_sensitive: bool,
) -> bool {
    match scheme {
        KeyScheme::SdiIsTsKey => parm.sdi == Some(ts_key),
        KeyScheme::ResolveByName => path.is_some_and(|path| {
            TsPath::from_parm(parm).is_some_and(|named| named.same_as(path, case_sensitive))
        }),
    }
}

/// The series a parameter refers to for one group member.
fn resolve_for_member<'t>(parm: &CompParm, member: &Tsid, tsids: &'t TsidCache) -> Option<&'t Tsid> {
    let mut path = member.copy_no_key();
    path.transform(parm);
    tsids.lookup_path(&path)
}

/// Every edge `comp` implies. Side-effect free on the caches.
pub fn evaluate_computation(
    comp: &DbComputation,
    tsids: &TsidCache,
    groups: &GroupCache,
    scheme: KeyScheme,
) -> Evaluation {
    let mut eval = Evaluation::default();
    let inputs = usable_inputs(comp, &mut eval.skipped);

    match comp.group_id {
        None => {
            for parm in inputs {
                if let Some(ts_key) = resolve_explicit(parm, tsids, scheme) {
                    eval.edges.insert(CompDepends::new(ts_key, comp.id));
                }
            }
        }
        Some(group_id) => {
            let Some(members) = groups.expanded(group_id) else {
                debug!(comp_id = comp.id, group_id, "bound group has no expansion");
                return eval;
            };
            for member in members.iter().filter_map(|k| tsids.get(*k)) {
                for parm in &inputs {
                    if let Some(hit) = resolve_for_member(parm, member, tsids) {
                        eval.edges.insert(CompDepends::new(hit.key, comp.id));
                    }
                }
            }
        }
    }

    debug!(comp_id = comp.id, edges = eval.edges.len(), "computation evaluated");
    eval
}

/// Whether `tsid` would be an input of `comp`, without evaluating the
/// whole computation.
pub fn comp_uses_tsid(
    comp: &DbComputation,
    tsid: &Tsid,
    tsids: &TsidCache,
    groups: &GroupCache,
    scheme: KeyScheme,
) -> bool {
    let case_sensitive = tsids.case_sensitive();
    let mut skipped = Vec::new();
    let inputs = usable_inputs(comp, &mut skipped);

    match comp.group_id {
        None => inputs
            .iter()
            .any(|parm| parm_names_series(parm, tsid.key, Some(&tsid.path), scheme, case_sensitive)),
        Some(group_id) => {
            let Some(members) = groups.expanded(group_id) else {
                return false;
            };
            members.iter().filter_map(|k| tsids.get(*k)).any(|member| {
                inputs.iter().any(|parm| {
                    let mut path = member.copy_no_key();
                    path.transform(parm);
                    path.same_as(&tsid.path, case_sensitive)
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compdepends_core::{Combine, TsGroup};

    fn tsids(names: &[(u64, &str)]) -> TsidCache {
        let mut cache = TsidCache::new(None, false);
        for (key, name) in names {
            cache.insert(Tsid::new(*key, TsPath::parse(name).unwrap()));
        }
        cache
    }

    fn edges(pairs: &[(u64, u64)]) -> BTreeSet<CompDepends> {
        pairs.iter().map(|&(t, c)| CompDepends::new(t, c)).collect()
    }

    #[test]
    fn explicit_inputs_are_deduplicated() {
        let ts = tsids(&[(1, "SiteA.Stage")]);
        let groups = GroupCache::new(None);
        let comp = DbComputation::new(10, "c")
            .with_parm(CompParm::input("a").bound_to(1))
            .with_parm(CompParm::input("b").bound_to(1))
            .with_parm(CompParm::output("out").bound_to(2));

        let eval = evaluate_computation(&comp, &ts, &groups, KeyScheme::SdiIsTsKey);
        assert_eq!(eval.edges, edges(&[(1, 10)]));
    }

    #[test]
    fn resolve_by_name_looks_up_pattern_fields() {
        let ts = tsids(&[(1, "SiteA.Stage"), (2, "SiteA.Flow")]);
        let groups = GroupCache::new(None);
        let comp = DbComputation::new(10, "c")
            .with_parm(CompParm::input("a").with_site("sitea").with_data_type("flow"))
            .with_parm(CompParm::input("b").with_site("SiteZ").with_data_type("Stage"));

        let eval = evaluate_computation(&comp, &ts, &groups, KeyScheme::ResolveByName);
        assert_eq!(eval.edges, edges(&[(2, 10)]));
    }

    #[test]
    fn basin_scenario() {
        let ts = tsids(&[(1, "SiteA.Stage"), (2, "SiteB.Stage"), (3, "SiteA.Flow")]);
        let mut groups = GroupCache::new(None);
        groups.put_def(
            TsGroup::new(1, "Basin1")
                .with_member(1)
                .with_subgroup(2, Combine::Include)
                .with_subgroup(3, Combine::Exclude),
        );
        groups.put_def(TsGroup::new(2, "Basin1Sub").with_member(2));
        groups.put_def(TsGroup::new(3, "Flows").with_member(3));
        groups.eval_all(&ts);
        assert_eq!(groups.expanded(1), Some(&BTreeSet::from([1, 2])));

        let comp = DbComputation::new(100, "Comp1")
            .with_group(1)
            .with_parm(CompParm::input("stage").with_data_type("Stage"));
        let eval = evaluate_computation(&comp, &ts, &groups, KeyScheme::SdiIsTsKey);
        assert_eq!(eval.edges, edges(&[(1, 100), (2, 100)]));
    }

    #[test]
    fn group_transform_resolves_other_series() {
        let ts = tsids(&[(1, "SiteA.Stage"), (2, "SiteB.Stage"), (3, "SiteA.Flow")]);
        let mut groups = GroupCache::new(None);
        groups.put_def(TsGroup::new(1, "g").with_member(1).with_member(2));
        groups.eval_all(&ts);

        let comp = DbComputation::new(100, "rating")
            .with_group(1)
            .with_parm(CompParm::input("flow").with_data_type("Flow"));
        let eval = evaluate_computation(&comp, &ts, &groups, KeyScheme::SdiIsTsKey);

        // SiteB.Flow does not exist, so only SiteA contributes.
        assert_eq!(eval.edges, edges(&[(3, 100)]));
        assert_eq!(ts.get(1).unwrap().unique_string(), "SiteA.Stage");
    }

    #[test]
    fn malformed_interval_skips_only_that_parameter() {
        let ts = tsids(&[
            (1, "SiteA.Stage.1Hour"),
            (2, "SiteA.Flow.1Hour"),
            (3, "SiteA.Stage.Hourly"),
        ]);
        let mut groups = GroupCache::new(None);
        groups.put_def(TsGroup::new(1, "g").with_member(1));
        groups.eval_all(&ts);
        let comp = DbComputation::new(10, "c")
            .with_group(1)
            .with_parm(CompParm::input("good").with_data_type("Flow").with_interval("1Hour"))
            .with_parm(CompParm::input("bad").with_interval("Hourly"));

        let eval = evaluate_computation(&comp, &ts, &groups, KeyScheme::SdiIsTsKey);
        assert_eq!(eval.edges, edges(&[(2, 10)]));
        assert_eq!(eval.skipped, vec!["bad".to_string()]);
    }

    #[test]
    fn missing_group_yields_nothing() {
        let ts = tsids(&[(1, "SiteA.Stage")]);
        let groups = GroupCache::new(None);
        let comp = DbComputation::new(10, "c")
            .with_group(42)
            .with_parm(CompParm::input("a"));
        assert!(evaluate_computation(&comp, &ts, &groups, KeyScheme::SdiIsTsKey)
            .edges
            .is_empty());
    }

    #[test]
    fn new_series_matches_through_group_transform() {
        let ts = tsids(&[(1, "SiteA.Stage"), (3, "SiteA.Flow")]);
        let mut groups = GroupCache::new(None);
        groups.put_def(TsGroup::new(1, "g").with_member(1));
        groups.eval_all(&ts);
        let comp = DbComputation::new(100, "rating")
            .with_group(1)
            .with_parm(CompParm::input("flow").with_data_type("Flow"));

        let flow = ts.get(3).unwrap();
        let other = Tsid::new(9, TsPath::new("SiteB", "Flow"));
        assert!(comp_uses_tsid(&comp, flow, &ts, &groups, KeyScheme::SdiIsTsKey));
        assert!(!comp_uses_tsid(&comp, &other, &ts, &groups, KeyScheme::SdiIsTsKey));
    }

    #[test]
    fn new_series_matches_explicit_binding() {
        let ts = tsids(&[(1, "SiteA.Stage")]);
        let groups = GroupCache::new(None);
        let tsid = ts.get(1).unwrap();

        let by_key = DbComputation::new(10, "c").with_parm(CompParm::input("a").bound_to(1));
        assert!(comp_uses_tsid(&by_key, tsid, &ts, &groups, KeyScheme::SdiIsTsKey));

        let by_name = DbComputation::new(11, "d")
            .with_parm(CompParm::input("a").with_site("SITEA").with_data_type("stage"));
        assert!(comp_uses_tsid(&by_name, tsid, &ts, &groups, KeyScheme::ResolveByName));
        assert!(!comp_uses_tsid(&by_name, tsid, &ts, &groups, KeyScheme::SdiIsTsKey));
    }
}
