//! Configuration Management Module
//!
//! Core settings and the on-disk locations of the config and trust files.

pub mod storage;
pub mod types;

pub use storage::{
    config_dir, config_file, known_hosts_file, resolve_known_hosts_path, ConfigStorage,
    StorageError,
};
pub use types::{CoreConfig, CONFIG_VERSION};
