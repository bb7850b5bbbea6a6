//! KDL configuration parsing for the build farm.
//!
//! This crate handles parsing of:
//! - Manager settings (scan cadence, timeouts, failure thresholds)
//! - The worker roster
//! - Collaborator endpoints (database, librarian, notifications)
//! - Command template interpolation

pub mod error;
pub mod farm;
pub mod template;

pub use error::{ConfigError, ConfigResult};
pub use farm::{
    ApiConfig, FarmConfig, LibrarianConfig, LogFormat, ManagerConfig, NotifyConfig, WorkerConfig,
    load_farm_config, parse_farm_config,
};
pub use template::TemplateContext;
