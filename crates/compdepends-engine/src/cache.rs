//! Generic keyed object cache.
//!
//! Holds domain objects by surrogate key with a secondary index on unique
//! name. Entries may carry a maximum age; an expired entry is treated as
//! absent by lookups until the owner re-reads it (see
//! [`ObjectCache::expired_keys`]).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use compdepends_core::{DbComputation, Tsid};

/// An object that can live in an [`ObjectCache`].
pub trait Cachable {
    fn cache_key(&self) -> u64;
    fn unique_name(&self) -> String;
}

impl Cachable for Tsid {
    fn cache_key(&self) -> u64 {
        self.key
    }

    fn unique_name(&self) -> String {
        self.unique_string()
    }
}

impl Cachable for DbComputation {
    fn cache_key(&self) -> u64 {
        self.id
    }

    fn unique_name(&self) -> String {
        self.name.clone()
    }
}

struct Entry<T> {
    value: T,
    loaded: Instant,
}

pub struct ObjectCache<T: Cachable> {
    by_key: HashMap<u64, Entry<T>>,
    by_name: HashMap<String, u64>,
    max_age: Option<Duration>,
    case_sensitive: bool,
}

impl<T: Cachable> ObjectCache<T> {
    pub fn new(max_age: Option<Duration>, case_sensitive: bool) -> Self {
        Self {
            by_key: HashMap::new(),
            by_name: HashMap::new(),
            max_age,
            case_sensitive,
        }
    }

    fn name_key(&self, name: &str) -> String {
        if self.case_sensitive {
            name.to_string()
        } else {
            name.to_ascii_lowercase()
        }
    }

    fn is_live(&self, entry: &Entry<T>) -> bool {
        self.max_age.is_none_or(|age| entry.loaded.elapsed() < age)
    }

    /// Insert or replace an object, restarting its age.
    pub fn put(&mut self, value: T) {
        let key = value.cache_key();
        if let Some(old) = self.by_key.get(&key) {
            let old_name = self.name_key(&old.value.unique_name());
            self.by_name.remove(&old_name);
        }
        let name = self.name_key(&value.unique_name());
        self.by_name.insert(name, key);
        self.by_key.insert(
            key,
            Entry {
                value,
                loaded: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, key: u64) -> Option<T> {
        let entry = self.by_key.remove(&key)?;
        let name = self.name_key(&entry.value.unique_name());
        if self.by_name.get(&name) == Some(&key) {
            self.by_name.remove(&name);
        }
        Some(entry.value)
    }

    pub fn get_by_key(&self, key: u64) -> Option<&T> {
        self.by_key
            .get(&key)
            .filter(|e| self.is_live(e))
            .map(|e| &e.value)
    }

    pub fn get_by_unique_name(&self, name: &str) -> Option<&T> {
        let key = self.by_name.get(&self.name_key(name))?;
        self.get_by_key(*key)
    }

    /// Look up an object and confirm it against an external source.
    ///
    /// An entry that is expired or that `is_current` rejects is removed and
    /// `None` is returned, so the caller re-reads it.
    pub fn get_by_key_checked<F>(&mut self, key: u64, is_current: F) -> Option<&T>
    where
        F: FnOnce(&T) -> bool,
    {
        let keep = match self.by_key.get(&key) {
            Some(entry) => self.is_live(entry) && is_current(&entry.value),
            None => return None,
        };
        if !keep {
            self.remove(key);
            return None;
        }
        self.by_key.get(&key).map(|e| &e.value)
    }

    /// Presence regardless of age.
    pub fn contains_key(&self, key: u64) -> bool {
        self.by_key.contains_key(&key)
    }

    /// Every cached object regardless of age.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.by_key.values().map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_name.clear();
    }

    /// Keys of every entry past its maximum age.
    pub fn expired_keys(&self) -> Vec<u64> {
        if self.max_age.is_none() {
            return Vec::new();
        }
        self.by_key
            .iter()
            .filter(|(_, e)| !self.is_live(e))
            .map(|(k, _)| *k)
            .collect()
    }
}
