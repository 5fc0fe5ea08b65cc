//! compdependsd: the computation-dependency daemon.
//!
//! Assembles the store, the dependency engine and the run lock into a
//! single polling process per application:
//! - Command-line surface and configuration overrides ([`cli`])
//! - Poll loop with reconnect/backoff and regression-test mode ([`daemon`])

pub mod cli;
pub mod daemon;

pub use cli::Cli;
pub use daemon::{Daemon, DaemonOptions, Exit};
