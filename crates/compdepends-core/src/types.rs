//! Domain types for the computation-dependency engine.
//!
//! These types mirror the rows kept by the time-series store: time-series
//! identifiers, computations with their parameter roles, time-series
//! groups, dependency edges, change notifications, application records and
//! run-lock rows. All of them serialize to JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Surrogate key of a time series.
pub type TsKey = u64;

/// Surrogate key of a computation.
pub type CompId = u64;

/// Surrogate key of a time-series group.
pub type GroupId = u64;

/// Surrogate key of a loading application.
pub type AppId = u64;

// ── Time series ────────────────────────────────────────────────────

/// The descriptive part of a time-series identifier, without its key.
///
/// The unique string is the non-empty prefix of
/// `site.data_type.interval.table_selector.model_id`, so a series with only
/// a site and a data type renders as `SiteA.Stage`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TsPath {
    pub site: String,
    pub data_type: String,
    #[serde(default)]
    pub interval: String,
    #[serde(default)]
    pub table_selector: String,
    #[serde(default)]
    pub model_id: Option<i32>,
}

impl TsPath {
    pub fn new(site: &str, data_type: &str) -> Self {
        Self {
            site: site.to_string(),
            data_type: data_type.to_string(),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: &str) -> Self {
        self.interval = interval.to_string();
        self
    }

    pub fn with_table_selector(mut self, table_selector: &str) -> Self {
        self.table_selector = table_selector.to_string();
        self
    }

    pub fn with_model_id(mut self, model_id: i32) -> Self {
        self.model_id = Some(model_id);
        self
    }

    /// Render the unique string, dropping trailing empty components.
    pub fn unique_string(&self) -> String {
        let model = self.model_id.map(|m| m.to_string()).unwrap_or_default();
        let parts = [
            self.site.as_str(),
            self.data_type.as_str(),
            self.interval.as_str(),
            self.table_selector.as_str(),
            model.as_str(),
        ];
        let used = parts
            .iter()
            .rposition(|p| !p.is_empty())
            .map_or(0, |last| last + 1);
        parts[..used].join(".")
    }

    /// Parse a unique string back into its components.
    pub fn parse(s: &str) -> CoreResult<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() < 2 || parts.len() > 5 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(CoreError::InvalidTsid(s.to_string()));
        }
        let model_id = match parts.get(4).filter(|m| !m.is_empty()) {
            Some(m) => Some(
                m.parse::<i32>()
                    .map_err(|_| CoreError::InvalidTsid(s.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            site: parts[0].to_string(),
            data_type: parts[1].to_string(),
            interval: parts.get(2).unwrap_or(&"").to_string(),
            table_selector: parts.get(3).unwrap_or(&"").to_string(),
            model_id,
        })
    }

    /// Build the path a parameter names on its own, without a group member
    /// to start from. Needs at least a site and a data type.
    pub fn from_parm(parm: &CompParm) -> Option<Self> {
        let site = parm.site.as_deref().filter(|s| !s.is_empty())?;
        let data_type = parm.data_type.as_deref().filter(|s| !s.is_empty())?;
        let mut path = Self::new(site, data_type);
        path.transform(parm);
        Some(path)
    }

    /// Overwrite every component the parameter specifies.
    ///
    /// Group computations call this on a copy of each expanded member to
    /// find the series a parameter refers to for that member.
    pub fn transform(&mut self, parm: &CompParm) {
        fn apply(field: &mut String, value: &Option<String>) {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                *field = v.to_string();
            }
        }
        apply(&mut self.site, &parm.site);
        apply(&mut self.data_type, &parm.data_type);
        apply(&mut self.interval, &parm.interval);
        apply(&mut self.table_selector, &parm.table_selector);
        if parm.model_id.is_some() {
            self.model_id = parm.model_id;
        }
    }

    /// Compare unique strings, ignoring case unless asked not to.
    pub fn same_as(&self, other: &TsPath, case_sensitive: bool) -> bool {
        let (a, b) = (self.unique_string(), other.unique_string());
        if case_sensitive {
            a == b
        } else {
            a.eq_ignore_ascii_case(&b)
        }
    }
}

impl fmt::Display for TsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_string())
    }
}

/// Identity of one stored time series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tsid {
    pub key: TsKey,
    pub path: TsPath,
}

impl Tsid {
    pub fn new(key: TsKey, path: TsPath) -> Self {
        Self { key, path }
    }

    pub fn unique_string(&self) -> String {
        self.path.unique_string()
    }

    /// An owned copy of the descriptive fields, safe to transform.
    pub fn copy_no_key(&self) -> TsPath {
        self.path.clone()
    }
}

impl fmt::Display for Tsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (key={})", self.path, self.key)
    }
}

// ── Computations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParmRole {
    Input,
    Output,
}

/// What a computation does when an input value is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingAction {
    #[default]
    Fail,
    Ignore,
    Prev,
    Next,
    Interp,
    Closest,
}

/// One named parameter of a computation.
///
/// A parameter is either bound to an explicit series (`sdi`) or carries
/// only pattern fields that are resolved against a group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompParm {
    pub role_name: String,
    pub role: ParmRole,
    /// Site-datatype surrogate of an explicitly bound series.
    #[serde(default)]
    pub sdi: Option<TsKey>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub table_selector: Option<String>,
    #[serde(default)]
    pub model_id: Option<i32>,
    #[serde(default)]
    pub missing: MissingAction,
}

impl CompParm {
    pub fn input(role_name: &str) -> Self {
        Self {
            role_name: role_name.to_string(),
            role: ParmRole::Input,
            sdi: None,
            site: None,
            data_type: None,
            interval: None,
            table_selector: None,
            model_id: None,
            missing: MissingAction::Fail,
        }
    }

    pub fn output(role_name: &str) -> Self {
        Self {
            role: ParmRole::Output,
            ..Self::input(role_name)
        }
    }

    pub fn bound_to(mut self, sdi: TsKey) -> Self {
        self.sdi = Some(sdi);
        self
    }

    pub fn with_site(mut self, site: &str) -> Self {
        self.site = Some(site.to_string());
        self
    }

    pub fn with_data_type(mut self, data_type: &str) -> Self {
        self.data_type = Some(data_type.to_string());
        self
    }

    pub fn with_interval(mut self, interval: &str) -> Self {
        self.interval = Some(interval.to_string());
        self
    }

    pub fn with_missing(mut self, missing: MissingAction) -> Self {
        self.missing = missing;
        self
    }

    pub fn is_input(&self) -> bool {
        self.role == ParmRole::Input
    }

    /// Whether losing this parameter's series leaves the computation unable to run.
    pub fn is_required(&self) -> bool {
        self.missing != MissingAction::Ignore
    }
}

/// A stored computation definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbComputation {
    pub id: CompId,
    pub name: String,
    #[serde(default)]
    pub app_id: Option<AppId>,
    pub enabled: bool,
    /// Bound group; absent for computations on explicit series only.
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub parms: Vec<CompParm>,
    /// Unix timestamp (seconds) of the last edit.
    #[serde(default)]
    pub last_modified: u64,
}

impl DbComputation {
    pub fn new(id: CompId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            app_id: None,
            enabled: true,
            group_id: None,
            parms: Vec::new(),
            last_modified: 0,
        }
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_parm(mut self, parm: CompParm) -> Self {
        self.parms.push(parm);
        self
    }

    pub fn inputs(&self) -> impl Iterator<Item = &CompParm> {
        self.parms.iter().filter(|p| p.is_input())
    }
}

// ── Groups ─────────────────────────────────────────────────────────

/// How a sub-group combines with its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    Include,
    Exclude,
    Intersect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgroupRef {
    pub group_id: GroupId,
    pub combine: Combine,
}

/// A stored time-series group definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsGroup {
    pub id: GroupId,
    pub name: String,
    /// Explicitly listed member series.
    #[serde(default)]
    pub members: Vec<TsKey>,
    #[serde(default)]
    pub sites: Vec<String>,
    #[serde(default)]
    pub data_types: Vec<String>,
    #[serde(default)]
    pub intervals: Vec<String>,
    #[serde(default)]
    pub subgroups: Vec<SubgroupRef>,
    #[serde(default)]
    pub last_modified: u64,
}

impl TsGroup {
    pub fn new(id: GroupId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            members: Vec::new(),
            sites: Vec::new(),
            data_types: Vec::new(),
            intervals: Vec::new(),
            subgroups: Vec::new(),
            last_modified: 0,
        }
    }

    pub fn with_member(mut self, key: TsKey) -> Self {
        self.members.push(key);
        self
    }

    pub fn with_subgroup(mut self, group_id: GroupId, combine: Combine) -> Self {
        self.subgroups.push(SubgroupRef { group_id, combine });
        self
    }

    pub fn has_criteria(&self) -> bool {
        !(self.sites.is_empty() && self.data_types.is_empty() && self.intervals.is_empty())
    }

    /// True when every non-empty criteria list names the path's component.
    pub fn matches_criteria(&self, path: &TsPath) -> bool {
        fn listed(list: &[String], value: &str) -> bool {
            list.is_empty() || list.iter().any(|v| v.eq_ignore_ascii_case(value))
        }
        self.has_criteria()
            && listed(&self.sites, &path.site)
            && listed(&self.data_types, &path.data_type)
            && listed(&self.intervals, &path.interval)
    }

    pub fn references(&self, group_id: GroupId) -> bool {
        self.subgroups.iter().any(|s| s.group_id == group_id)
    }
}

// ── Dependencies and notifications ─────────────────────────────────

/// Edge meaning "re-run `comp_id` when `ts_key` receives new data".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompDepends {
    pub ts_key: TsKey,
    pub comp_id: CompId,
}

impl CompDepends {
    pub fn new(ts_key: TsKey, comp_id: CompId) -> Self {
        Self { ts_key, comp_id }
    }
}

/// One kind of change the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependsEvent {
    TsCreated { ts_key: TsKey },
    TsDeleted { ts_key: TsKey },
    TsModified { ts_key: TsKey },
    CompModified { comp_id: CompId },
    GroupModified { group_id: GroupId },
    FullEval,
}

impl DependsEvent {
    pub fn label(&self) -> &'static str {
        match self {
            DependsEvent::TsCreated { .. } => "ts_created",
            DependsEvent::TsDeleted { .. } => "ts_deleted",
            DependsEvent::TsModified { .. } => "ts_modified",
            DependsEvent::CompModified { .. } => "comp_modified",
            DependsEvent::GroupModified { .. } => "group_modified",
            DependsEvent::FullEval => "full_eval",
        }
    }

    pub fn target_key(&self) -> Option<u64> {
        match *self {
            DependsEvent::TsCreated { ts_key }
            | DependsEvent::TsDeleted { ts_key }
            | DependsEvent::TsModified { ts_key } => Some(ts_key),
            DependsEvent::CompModified { comp_id } => Some(comp_id),
            DependsEvent::GroupModified { group_id } => Some(group_id),
            DependsEvent::FullEval => None,
        }
    }
}

/// A queued change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpDependsNotify {
    pub event: DependsEvent,
    /// Unix timestamp (seconds) when the notification was queued.
    pub loaded_at: u64,
}

impl CpDependsNotify {
    pub fn new(event: DependsEvent, loaded_at: u64) -> Self {
        Self { event, loaded_at }
    }
}

impl fmt::Display for CpDependsNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.event.target_key() {
            Some(key) => write!(f, "{} key={} loaded_at={}", self.event.label(), key, self.loaded_at),
            None => write!(f, "{} loaded_at={}", self.event.label(), self.loaded_at),
        }
    }
}

// ── Applications and locks ─────────────────────────────────────────

/// A registered loading application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub id: AppId,
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// The run-lock row of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub app_id: AppId,
    pub app_name: String,
    pub pid: u32,
    pub host: String,
    /// Unix timestamp (seconds) of the last heartbeat.
    pub heartbeat: u64,
    #[serde(default)]
    pub status: String,
}

impl LockRecord {
    pub fn same_holder(&self, other: &LockRecord) -> bool {
        self.pid == other.pid && self.host == other.host
    }

    pub fn holder(&self) -> String {
        format!("{}:{}", self.host, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_string_drops_trailing_empty_components() {
        assert_eq!(TsPath::new("SiteA", "Stage").unique_string(), "SiteA.Stage");
        let full = TsPath::new("SiteA", "Stage")
            .with_interval("1Hour")
            .with_table_selector("Raw")
            .with_model_id(3);
        assert_eq!(full.unique_string(), "SiteA.Stage.1Hour.Raw.3");
        let gap = TsPath::new("SiteA", "Stage").with_table_selector("Raw");
        assert_eq!(gap.unique_string(), "SiteA.Stage..Raw");
    }

    #[test]
    fn parse_reads_back_unique_string() {
        let path = TsPath::parse("SiteA.Stage..Raw").unwrap();
        assert_eq!(path, TsPath::new("SiteA", "Stage").with_table_selector("Raw"));
        assert!(TsPath::parse("SiteA").is_err());
        assert!(TsPath::parse("SiteA.Stage.1Hour.Raw.notanumber").is_err());
    }

    #[test]
    fn transform_overwrites_only_specified_fields() {
        let member = Tsid::new(7, TsPath::new("SiteB", "Stage").with_interval("1Hour"));
        let parm = CompParm::input("flow").with_data_type("Flow");

        let mut copy = member.copy_no_key();
        copy.transform(&parm);

        assert_eq!(copy.unique_string(), "SiteB.Flow.1Hour");
        assert_eq!(member.unique_string(), "SiteB.Stage.1Hour");
    }

    #[test]
    fn from_parm_needs_site_and_data_type() {
        let parm = CompParm::input("in").with_data_type("Stage");
        assert!(TsPath::from_parm(&parm).is_none());

        let parm = parm.with_site("SiteA").with_interval("1Hour");
        let path = TsPath::from_parm(&parm).unwrap();
        assert_eq!(path.unique_string(), "SiteA.Stage.1Hour");
    }

    #[test]
    fn same_as_ignores_case_by_default() {
        let a = TsPath::new("SITEA", "stage");
        let b = TsPath::new("SiteA", "Stage");
        assert!(a.same_as(&b, false));
        assert!(!a.same_as(&b, true));
    }

    #[test]
    fn group_criteria_require_every_listed_component() {
        let mut group = TsGroup::new(1, "stages");
        assert!(!group.matches_criteria(&TsPath::new("SiteA", "Stage")));

        group.data_types.push("stage".to_string());
        assert!(group.matches_criteria(&TsPath::new("SiteA", "Stage")));
        assert!(!group.matches_criteria(&TsPath::new("SiteA", "Flow")));

        group.sites.push("SiteB".to_string());
        assert!(!group.matches_criteria(&TsPath::new("SiteA", "Stage")));
        assert!(group.matches_criteria(&TsPath::new("SiteB", "Stage")));
    }

    #[test]
    fn optional_parameter_is_not_required() {
        assert!(CompParm::input("a").is_required());
        assert!(!CompParm::input("a").with_missing(MissingAction::Ignore).is_required());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&DependsEvent::GroupModified { group_id: 4 }).unwrap();
        assert_eq!(json, r#"{"type":"group_modified","group_id":4}"#);
        let back: DependsEvent = serde_json::from_str(r#"{"type":"full_eval"}"#).unwrap();
        assert_eq!(back, DependsEvent::FullEval);
    }

    #[test]
    fn notify_display_names_event_and_key() {
        let n = CpDependsNotify::new(DependsEvent::TsDeleted { ts_key: 12 }, 1000);
        assert_eq!(n.to_string(), "ts_deleted key=12 loaded_at=1000");
    }
}
