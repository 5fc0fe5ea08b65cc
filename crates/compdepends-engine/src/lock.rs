//! Per-application run lock.
//!
//! At most one daemon holds the lock row of an application. The holder
//! renews its heartbeat (and status string) every cycle; a row whose
//! heartbeat is older than the staleness threshold may be taken over.

use compdepends_core::{AppInfo, LockRecord};
use compdepends_store::{TsdbStore, epoch_secs};
use tracing::{info, warn};

use crate::error::EngineResult;

pub struct RunLock {
    record: LockRecord,
}

impl RunLock {
    /// Take the lock for `app` as this process.
    pub fn acquire(store: &TsdbStore, app: &AppInfo, stale_after_secs: u64) -> EngineResult<Self> {
        Self::acquire_as(
            store,
            app,
            std::process::id(),
            &local_hostname(),
            stale_after_secs,
            epoch_secs(),
        )
    }

    /// Take the lock under an explicit holder identity and clock.
    pub fn acquire_as(
        store: &TsdbStore,
        app: &AppInfo,
        pid: u32,
        host: &str,
        stale_after_secs: u64,
        now: u64,
    ) -> EngineResult<Self> {
        let candidate = LockRecord {
            app_id: app.id,
            app_name: app.name.clone(),
            pid,
            host: host.to_string(),
            heartbeat: now,
            status: "Starting".to_string(),
        };
        let record = store.obtain_lock(&candidate, stale_after_secs, now)?;
        info!(app = %app.name, holder = %record.holder(), "run lock acquired");
        Ok(Self { record })
    }

    /// Heartbeat with a new status string. Fails with `LockLost` if another
    /// process has taken the row.
    pub fn renew(&mut self, store: &TsdbStore, status: &str) -> EngineResult<()> {
        self.renew_at(store, status, epoch_secs())
    }

    pub fn renew_at(&mut self, store: &TsdbStore, status: &str, now: u64) -> EngineResult<()> {
        self.record = store.renew_lock(&self.record, status, now)?;
        Ok(())
    }

    /// Delete the lock row if still held.
    pub fn release(self, store: &TsdbStore) -> EngineResult<bool> {
        let released = store.release_lock(&self.record)?;
        if released {
            info!(app = %self.record.app_name, "run lock released");
        } else {
            warn!(app = %self.record.app_name, "run lock was not held at release");
        }
        Ok(released)
    }
}

/// Host name for lock identity: `HOSTNAME`, then `/etc/hostname`.
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
