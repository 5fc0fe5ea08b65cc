//! compdepends.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependsConfig {
    pub store: StoreConfig,
    pub daemon: DaemonConfig,
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub depends: DependsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/compdepends"),
            file: "tsdb.redb".to_string(),
        }
    }
}

impl StoreConfig {
    /// Database file for the given office, or the default file.
    pub fn database_path(&self, office: Option<&str>) -> PathBuf {
        match office.filter(|o| !o.is_empty()) {
            Some(office) => self.data_dir.join(format!("{office}.redb")),
            None => self.data_dir.join(&self.file),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub poll_interval_ms: u64,
    pub reconnect_backoff_secs: u64,
    /// Full cache refresh plus full reconciliation period.
    pub refresh_interval_secs: u64,
    pub regression_idle_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            reconnect_backoff_secs: 10,
            refresh_interval_secs: 900,
            regression_idle_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub tsid_max_age_secs: Option<u64>,
    pub comp_max_age_secs: Option<u64>,
    pub name_case_sensitive: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tsid_max_age_secs: None,
            comp_max_age_secs: Some(3600),
            name_case_sensitive: false,
        }
    }
}

/// How an explicit parameter binding maps to a time-series key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyScheme {
    /// The parameter's site-datatype surrogate is the series key itself.
    #[default]
    SdiIsTsKey,
    /// The parameter's pattern fields are looked up by unique name.
    ResolveByName,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependsSettings {
    pub key_scheme: KeyScheme,
    pub group_dump_dir: Option<PathBuf>,
}

impl DependsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: DependsConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = DependsConfig::from_toml("").unwrap();
        assert_eq!(config.daemon.poll_interval_ms, 1000);
        assert_eq!(config.daemon.refresh_interval_secs, 900);
        assert_eq!(config.lock.stale_after_secs, 60);
        assert_eq!(config.depends.key_scheme, KeyScheme::SdiIsTsKey);
        assert!(config.cache.tsid_max_age_secs.is_none());
    }

    #[test]
    fn parses_partial_sections() {
        let toml_str = r#"
[daemon]
poll_interval_ms = 250

[depends]
key_scheme = "resolve-by-name"
group_dump_dir = "/tmp/groups"
"#;
        let config = DependsConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.daemon.poll_interval_ms, 250);
        assert_eq!(config.daemon.reconnect_backoff_secs, 10);
        assert_eq!(config.depends.key_scheme, KeyScheme::ResolveByName);
        assert_eq!(
            config.depends.group_dump_dir,
            Some(PathBuf::from("/tmp/groups"))
        );
    }

    #[test]
    fn office_selects_database_file() {
        let store = StoreConfig {
            data_dir: PathBuf::from("/data"),
            file: "tsdb.redb".to_string(),
        };
        assert_eq!(store.database_path(None), PathBuf::from("/data/tsdb.redb"));
        assert_eq!(
            store.database_path(Some("SWT")),
            PathBuf::from("/data/SWT.redb")
        );
    }

    #[test]
    fn round_trips_through_toml() {
        let config = DependsConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("[daemon]"));
        let back = DependsConfig::from_toml(&text).unwrap();
        assert_eq!(back.store.file, "tsdb.redb");
    }
}
