//! Time-series identifier cache.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use compdepends_core::{TsKey, TsPath, Tsid};
use compdepends_store::TsdbStore;
use tracing::{debug, warn};

use crate::cache::ObjectCache;
use crate::error::EngineResult;

/// Every known TSID, indexed by key and by unique string.
pub struct TsidCache {
    cache: ObjectCache<Tsid>,
    case_sensitive: bool,
}

impl TsidCache {
    pub fn new(max_age: Option<Duration>, case_sensitive: bool) -> Self {
        Self {
            cache: ObjectCache::new(max_age, case_sensitive),
            case_sensitive,
        }
    }

    /// Reload the whole directory from the store.
    pub fn refresh(&mut self, store: &TsdbStore) -> EngineResult<usize> {
        let tsids = store.list_tsids()?;
        self.cache.clear();
        for tsid in tsids {
            self.cache.put(tsid);
        }
        debug!(count = self.cache.len(), "tsid cache refreshed");
        Ok(self.cache.len())
    }

    /// Re-read every entry past its maximum age. Series still in the store
    /// are replaced with the stored copy; the rest are dropped. Returns
    /// the number of entries re-read.
    pub fn revalidate(&mut self, store: &TsdbStore) -> EngineResult<usize> {
        let expired = self.cache.expired_keys();
        for &key in &expired {
            match store.get_tsid(key)? {
                Some(tsid) => self.cache.put(tsid),
                None => {
                    debug!(ts_key = key, "aged-out series no longer stored, dropping");
                    self.cache.remove(key);
                }
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "aged-out series re-read");
        }
        Ok(expired.len())
    }

    pub fn insert(&mut self, tsid: Tsid) {
        self.cache.put(tsid);
    }

    pub fn remove(&mut self, key: TsKey) -> Option<Tsid> {
        self.cache.remove(key)
    }

    pub fn get(&self, key: TsKey) -> Option<&Tsid> {
        self.cache.get_by_key(key)
    }

    /// Whether the key is known, regardless of entry age.
    pub fn contains(&self, key: TsKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn get_by_unique_name(&self, name: &str) -> Option<&Tsid> {
        self.cache.get_by_unique_name(name)
    }

    /// Find the series whose unique string equals the path's.
    pub fn lookup_path(&self, path: &TsPath) -> Option<&Tsid> {
        self.get_by_unique_name(&path.unique_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tsid> {
        self.cache.iter()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Write `tsids.txt` with every cached unique string, sorted.
    pub fn dump(&self, dir: &Path) {
        let mut names: Vec<String> = self
            .cache
            .iter()
            .map(|t| format!("{}\t{}", t.key, t.unique_string()))
            .collect();
        names.sort();
        write_dump(&dir.join("tsids.txt"), &names);
    }
}

/// Write one diagnostic file. Failures are logged and otherwise ignored.
pub(crate) fn write_dump(path: &Path, lines: &[String]) {
    let result = std::fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))
        .and_then(|_| std::fs::File::create(path))
        .and_then(|mut file| {
            for line in lines {
                writeln!(file, "{line}")?;
            }
            file.flush()
        });
    match result {
        Ok(()) => debug!(?path, lines = lines.len(), "dump written"),
        Err(e) => warn!(?path, error = %e, "failed to write dump"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_loads_directory() {
        let store = TsdbStore::open_in_memory().unwrap();
        store.create_tsid(TsPath::new("SiteA", "Stage")).unwrap();
        store.create_tsid(TsPath::new("SiteA", "Flow")).unwrap();

        let mut cache = TsidCache::new(None, false);
        assert_eq!(cache.refresh(&store).unwrap(), 2);
        assert_eq!(cache.lookup_path(&TsPath::new("sitea", "flow")).unwrap().key, 2);
        assert!(cache.contains(1));

        store.delete_tsid(1).unwrap();
        cache.refresh(&store).unwrap();
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn revalidate_rereads_aged_out_series() {
        let store = TsdbStore::open_in_memory().unwrap();
        let kept = store.create_tsid(TsPath::new("SiteA", "Stage")).unwrap().key;
        let gone = store.create_tsid(TsPath::new("SiteB", "Stage")).unwrap().key;

        let mut cache = TsidCache::new(Some(Duration::from_millis(100)), false);
        cache.refresh(&store).unwrap();
        store.delete_tsid(gone).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.get(kept).is_none());

        assert_eq!(cache.revalidate(&store).unwrap(), 2);
        assert_eq!(cache.get(kept).unwrap().unique_string(), "SiteA.Stage");
        assert!(cache.lookup_path(&TsPath::new("SiteA", "Stage")).is_some());
        assert!(!cache.contains(gone));
        assert_eq!(cache.revalidate(&store).unwrap(), 0);
    }

    #[test]
    fn dump_lists_every_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = TsidCache::new(None, false);
        cache.insert(Tsid::new(2, TsPath::new("SiteB", "Stage")));
        cache.insert(Tsid::new(1, TsPath::new("SiteA", "Stage")));

        cache.dump(dir.path());

        let text = std::fs::read_to_string(dir.path().join("tsids.txt")).unwrap();
        assert_eq!(text, "1\tSiteA.Stage\n2\tSiteB.Stage\n");
    }
}
