//! The daemon's poll loop.
//!
//! One logical thread of control: renew the run lock, run the startup or
//! periodic full refresh when due, fetch and apply the next notification,
//! or sleep for the poll interval when the queue is empty. A store
//! connectivity failure releases the store, backs off, and reconnects
//! with a full refresh forced; lock loss ends the process.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use compdepends_core::DependsConfig;
use compdepends_engine::{
    DependsUpdater, EngineError, EngineResult, PollOutcome, RunLock, UpdaterSettings,
};
use compdepends_store::TsdbStore;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cli::Cli;

/// Run options that come from the command line rather than the config file.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub app: String,
    pub office: Option<String>,
    pub full_eval: bool,
    pub regression_test: bool,
}

impl From<&Cli> for DaemonOptions {
    fn from(cli: &Cli) -> Self {
        Self {
            app: cli.app.clone(),
            office: cli.office.clone(),
            full_eval: cli.full_eval,
            regression_test: cli.regression_test,
        }
    }
}

/// Why the loop ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    RegressionIdle,
}

pub struct Daemon {
    config: DependsConfig,
    options: DaemonOptions,
}

/// State that lives for one lock tenure.
struct Session {
    updater: DependsUpdater,
    lock: RunLock,
    /// Pending startup step: `Some(true)` runs a full evaluation,
    /// `Some(false)` only loads the caches.
    startup: Option<bool>,
    action: &'static str,
    connected: bool,
}

impl Daemon {
    pub fn new(config: DependsConfig, options: DaemonOptions) -> Self {
        Self { config, options }
    }

    pub fn database_path(&self) -> PathBuf {
        self.config.store.database_path(self.options.office.as_deref())
    }

    /// Run until shutdown, regression idle, or a fatal error.
    ///
    /// The run lock is released on a clean exit. A fatal error leaves the
    /// row to go stale.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<Exit> {
        info!(
            app = %self.options.app,
            office = ?self.options.office,
            full_eval = self.options.full_eval,
            regression_test = self.options.regression_test,
            "compdepends daemon starting"
        );

        std::fs::create_dir_all(&self.config.store.data_dir)?;
        let path = self.database_path();
        let Some(store) = self.connect(&path, &mut shutdown).await else {
            return Ok(Exit::Shutdown);
        };

        let app = store
            .get_app_by_name(&self.options.app)?
            .ok_or_else(|| EngineError::AppNotFound(self.options.app.clone()))?;
        info!(app_id = app.id, app = %app.name, "application resolved");

        let lock = RunLock::acquire(&store, &app, self.config.lock.stale_after_secs)?;
        let updater = DependsUpdater::new(
            store,
            Some(app.id),
            UpdaterSettings::from_config(&self.config),
        );
        let mut session = Session {
            updater,
            lock,
            startup: Some(self.options.full_eval),
            action: "Starting",
            connected: true,
        };

        let exit = self.poll_loop(&mut session, &path, &mut shutdown).await?;

        let Session {
            updater,
            lock,
            connected,
            ..
        } = session;
        if connected {
            lock.release(updater.store())?;
        }
        info!(status = %updater.status(), ?exit, "compdepends daemon stopped");
        Ok(exit)
    }

    async fn poll_loop(
        &self,
        session: &mut Session,
        path: &Path,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<Exit> {
        let poll_interval = Duration::from_millis(self.config.daemon.poll_interval_ms);
        let regression_idle = Duration::from_millis(self.config.daemon.regression_idle_ms);
        let mut last_activity = Instant::now();

        loop {
            if *shutdown.borrow() {
                info!("shutdown requested");
                return Ok(Exit::Shutdown);
            }

            match session.cycle() {
                Ok(PollOutcome::Idle) => {
                    if self.options.regression_test && last_activity.elapsed() >= regression_idle {
                        info!(
                            idle_ms = self.config.daemon.regression_idle_ms,
                            "regression test idle, exiting"
                        );
                        return Ok(Exit::RegressionIdle);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => {
                            info!("shutdown signal received");
                            return Ok(Exit::Shutdown);
                        }
                    }
                }
                Ok(outcome) => {
                    debug!(?outcome, status = %session.updater.status(), "cycle complete");
                    last_activity = Instant::now();
                }
                Err(e) if e.is_connectivity() => {
                    error!(action = session.action, error = %e, "store connectivity lost");
                    if !self.recover(session, path, shutdown).await? {
                        return Ok(Exit::Shutdown);
                    }
                }
                Err(e) => {
                    error!(action = session.action, error = %e, "fatal error, exiting");
                    return Err(e.into());
                }
            }
        }
    }

    /// Release the store handle and open the file again. Returns false when
    /// shutdown was requested while waiting to reconnect.
    async fn recover(
        &self,
        session: &mut Session,
        path: &Path,
        shutdown: &mut watch::Receiver<bool>,
    ) -> EngineResult<bool> {
        session.updater.disconnect()?;
        session.connected = false;
        let Some(store) = self.connect(path, shutdown).await else {
            return Ok(false);
        };
        session.updater.reconnect(store);
        session.connected = true;
        Ok(true)
    }

    /// Open the store, retrying after the backoff period until it opens
    /// or shutdown is requested.
    async fn connect(
        &self,
        path: &Path,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<TsdbStore> {
        let backoff = Duration::from_secs(self.config.daemon.reconnect_backoff_secs);
        loop {
            match TsdbStore::open(path) {
                Ok(store) => {
                    info!(?path, "store connected");
                    return Some(store);
                }
                Err(e) => {
                    warn!(?path, error = %e, backoff_secs = backoff.as_secs(), "cannot open store, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {
                            info!("shutdown requested while reconnecting");
                            return None;
                        }
                    }
                }
            }
        }
    }
}

impl Session {
    /// One pass of the loop body, up to and including one notification.
    fn cycle(&mut self) -> EngineResult<PollOutcome> {
        self.action = "Checking lock";
        let status = self.updater.status();
        self.lock.renew(self.updater.store(), &status)?;

        match self.startup.take() {
            Some(true) => {
                self.action = "Full evaluation";
                tolerate(self.action, self.updater.full_eval().map(drop))?;
            }
            Some(false) => {
                self.action = "Refresh caches";
                tolerate(self.action, self.updater.refresh_caches())?;
            }
            None if self.updater.refresh_due() => {
                self.action = "Periodic refresh";
                tolerate(self.action, self.updater.full_eval().map(drop))?;
            }
            None => {}
        }

        self.action = "Getting new data";
        self.updater.poll()
    }
}

/// Log a failed step and carry on, unless the failure is fatal or calls
/// for a reconnect.
fn tolerate(action: &str, result: EngineResult<()>) -> EngineResult<()> {
    match result {
        Err(e) if !e.is_fatal() && !e.is_connectivity() => {
            error!(action, error = %e, "step failed, continuing");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compdepends_core::AppInfo;
    use compdepends_store::StoreError;

    #[test]
    fn tolerate_passes_only_recoverable_failures() {
        assert!(tolerate("x", Ok(())).is_ok());
        assert!(tolerate("x", Err(StoreError::Deserialize("bad".into()).into())).is_ok());
        assert!(tolerate("x", Err(StoreError::Write("disk".into()).into())).is_err());
        assert!(tolerate("x", Err(EngineError::LockLost("app".into()))).is_err());
    }

    #[test]
    fn office_selects_the_database_file() {
        let mut config = DependsConfig::default();
        config.store.data_dir = PathBuf::from("/data");
        let options = DaemonOptions {
            app: "compdepends".into(),
            office: Some("SWT".into()),
            full_eval: false,
            regression_test: false,
        };
        let daemon = Daemon::new(config.clone(), options.clone());
        assert_eq!(daemon.database_path(), PathBuf::from("/data/SWT.redb"));

        let daemon = Daemon::new(config, DaemonOptions { office: None, ..options });
        assert_eq!(daemon.database_path(), PathBuf::from("/data/tsdb.redb"));
    }

    #[tokio::test]
    async fn recover_reopens_the_store_and_forces_a_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DependsConfig::default();
        config.store.data_dir = dir.path().to_path_buf();
        config.daemon.reconnect_backoff_secs = 1;
        let daemon = Daemon::new(
            config.clone(),
            DaemonOptions {
                app: "compdepends".into(),
                office: None,
                full_eval: false,
                regression_test: false,
            },
        );
        let path = daemon.database_path();

        let store = TsdbStore::open(&path).unwrap();
        let app = AppInfo {
            id: 1,
            name: "compdepends".into(),
            comment: String::new(),
            properties: Default::default(),
        };
        store.put_app(&app).unwrap();
        let lock = RunLock::acquire(&store, &app, 60).unwrap();
        let mut updater =
            DependsUpdater::new(store, Some(app.id), UpdaterSettings::from_config(&config));
        updater.refresh_caches().unwrap();
        let mut session = Session {
            updater,
            lock,
            startup: None,
            action: "Getting new data",
            connected: true,
        };

        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        assert!(daemon.recover(&mut session, &path, &mut shutdown_rx).await.unwrap());
        assert!(session.connected);
        assert!(session.updater.refresh_due());

        // The reopened file still holds our lock row.
        assert_eq!(session.cycle().unwrap(), PollOutcome::Idle);
        assert!(!session.updater.refresh_due());
        assert_eq!(session.updater.store().get_lock(1).unwrap().unwrap().pid, std::process::id());
    }

    #[tokio::test]
    async fn recover_gives_up_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DependsConfig::default();
        config.store.data_dir = dir.path().to_path_buf();
        config.daemon.reconnect_backoff_secs = 60;
        let daemon = Daemon::new(
            config.clone(),
            DaemonOptions {
                app: "compdepends".into(),
                office: None,
                full_eval: false,
                regression_test: false,
            },
        );
        // A directory where the database file belongs cannot be opened.
        let path = dir.path().join("blocked.redb");
        std::fs::create_dir_all(&path).unwrap();

        let store = TsdbStore::open_in_memory().unwrap();
        let app = AppInfo {
            id: 1,
            name: "compdepends".into(),
            comment: String::new(),
            properties: Default::default(),
        };
        store.put_app(&app).unwrap();
        let lock = RunLock::acquire(&store, &app, 60).unwrap();
        let mut session = Session {
            updater: DependsUpdater::new(store, Some(app.id), UpdaterSettings::default()),
            lock,
            startup: None,
            action: "Getting new data",
            connected: true,
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown_tx.send(true).unwrap();
        });
        assert!(!daemon.recover(&mut session, &path, &mut shutdown_rx).await.unwrap());
        assert!(!session.connected);
        stop.await.unwrap();
    }
}
