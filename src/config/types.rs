//! Core configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sftp::constants::{DEFAULT_CONCURRENT_TRANSFERS, MAX_CONCURRENT_TRANSFERS};
use crate::ssh::DEFAULT_CONNECT_TIMEOUT_SECS;

/// Current config format version
pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

const DEFAULT_TUNNEL_BIND_HOST: &str = "127.0.0.1";

/// Settings shared by every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// 0 disables keepalive
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    #[serde(default = "default_tunnel_bind_host")]
    pub tunnel_bind_host: String,

    /// Overrides `~/.shellport/known_hosts`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_keepalive_interval_secs() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_SECS
}

fn default_max_concurrent_transfers() -> usize {
    DEFAULT_CONCURRENT_TRANSFERS
}

fn default_tunnel_bind_host() -> String {
    DEFAULT_TUNNEL_BIND_HOST.to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            max_concurrent_transfers: DEFAULT_CONCURRENT_TRANSFERS,
            tunnel_bind_host: default_tunnel_bind_host(),
            known_hosts_path: None,
        }
    }
}

impl CoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `None` when keepalive is disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    /// Clamped to 1..=10
    pub fn max_concurrent_transfers(&self) -> usize {
        self.max_concurrent_transfers.clamp(1, MAX_CONCURRENT_TRANSFERS)
    }
}
