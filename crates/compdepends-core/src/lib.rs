pub mod config;
pub mod error;
pub mod interval;
pub mod types;

pub use config::{DependsConfig, KeyScheme};
pub use error::{CoreError, CoreResult};
pub use interval::Interval;
pub use types::*;
