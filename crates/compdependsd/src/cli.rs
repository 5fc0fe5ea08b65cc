//! Command-line surface of the daemon.

use std::path::PathBuf;

use clap::Parser;
use compdepends_core::DependsConfig;

#[derive(Debug, Parser)]
#[command(
    name = "compdependsd",
    about = "Keeps the computation dependency edge set current"
)]
pub struct Cli {
    /// Application name the daemon runs as.
    #[arg(short, long, default_value = "compdepends")]
    pub app: String,

    /// Office (tenant) id; selects the database file.
    #[arg(short, long)]
    pub office: Option<String>,

    /// Run a full evaluation on startup.
    #[arg(short = 'F', long)]
    pub full_eval: bool,

    /// Exit once no notification has arrived for the regression idle period.
    #[arg(short = 'T', long)]
    pub regression_test: bool,

    /// Directory for TSID and expanded group dumps.
    #[arg(short = 'G', long)]
    pub group_dump_dir: Option<PathBuf>,

    /// Configuration file (compdepends.toml).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Data directory holding the database files.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl Cli {
    /// Load the configuration file, if any, and apply the overriding flags.
    pub fn load_config(&self) -> anyhow::Result<DependsConfig> {
        let mut config = match &self.config {
            Some(path) => DependsConfig::from_file(path)?,
            None => DependsConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.store.data_dir = dir.clone();
        }
        if let Some(dir) = &self.group_dump_dir {
            config.depends.group_dump_dir = Some(dir.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["compdependsd"]);
        assert_eq!(cli.app, "compdepends");
        assert!(cli.office.is_none());
        assert!(!cli.full_eval);
        assert!(!cli.regression_test);
    }

    #[test]
    fn short_flags() {
        let cli = Cli::parse_from([
            "compdependsd", "-a", "depends2", "-o", "SWT", "-F", "-T", "-G", "/tmp/dump",
        ]);
        assert_eq!(cli.app, "depends2");
        assert_eq!(cli.office.as_deref(), Some("SWT"));
        assert!(cli.full_eval);
        assert!(cli.regression_test);
        assert_eq!(cli.group_dump_dir, Some(PathBuf::from("/tmp/dump")));
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compdepends.toml");
        std::fs::write(
            &path,
            "[store]\ndata_dir = \"/srv/tsdb\"\n\n[daemon]\npoll_interval_ms = 250\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "compdependsd",
            "--config",
            path.to_str().unwrap(),
            "--data-dir",
            "/data",
            "-G",
            "/dump",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.store.data_dir, PathBuf::from("/data"));
        assert_eq!(config.daemon.poll_interval_ms, 250);
        assert_eq!(config.depends.group_dump_dir, Some(PathBuf::from("/dump")));
    }
}
