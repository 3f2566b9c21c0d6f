//! Process-wide state
//!
//! Built once at startup from the persisted config: the trust store it
//! names and the connection registry every connect goes through.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::{resolve_known_hosts_path, ConfigStorage, CoreConfig, StorageError};
use crate::ssh::{
    ConnectionRegistry, HostKeyVerifier, KnownHostsStore, SshConfig, SshConnection, SshError,
    TrustDecision,
};

pub struct CoreState {
    storage: ConfigStorage,
    config: RwLock<CoreConfig>,
    known_hosts: Arc<KnownHostsStore>,
    connections: Arc<ConnectionRegistry>,
}

impl CoreState {
    /// Load from `~/.shellport/config.json`
    pub async fn load() -> Result<Self, StorageError> {
        Self::load_from(ConfigStorage::new()?).await
    }

    /// Load settings from `storage` and open the trust store they point at.
    ///
    /// An unreadable trust file starts empty rather than failing startup.
    pub async fn load_from(storage: ConfigStorage) -> Result<Self, StorageError> {
        let config = storage.load().await?;
        let known_hosts_path = resolve_known_hosts_path(&config)?;
        let known_hosts = Arc::new(KnownHostsStore::with_path(known_hosts_path));
        info!(
            "Core state loaded from {:?} ({} known hosts)",
            storage.path(),
            known_hosts.len()
        );

        Ok(Self {
            storage,
            config: RwLock::new(config),
            known_hosts,
            connections: ConnectionRegistry::new(),
        })
    }

    /// Snapshot of the current settings
    pub fn config(&self) -> CoreConfig {
        self.config.read().clone()
    }

    /// Replace the settings and persist them. Live connections keep the
    /// values they were opened with.
    pub async fn update_config(&self, config: CoreConfig) -> Result<(), StorageError> {
        self.storage.save(&config).await?;
        *self.config.write() = config;
        Ok(())
    }

    pub fn known_hosts(&self) -> &Arc<KnownHostsStore> {
        &self.known_hosts
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn verifier(&self, decision: Arc<dyn TrustDecision>) -> HostKeyVerifier {
        HostKeyVerifier::new(self.known_hosts.clone(), decision)
    }

    /// Dial with the loaded settings and register the connection
    pub async fn connect(
        &self,
        id: Option<String>,
        config: SshConfig,
        decision: Arc<dyn TrustDecision>,
    ) -> Result<Arc<SshConnection>, SshError> {
        let core = self.config();
        self.connections
            .connect(id, config, self.verifier(decision), &core)
            .await
    }

    /// Close every registered connection
    pub async fn shutdown(&self) {
        self.connections.close_all().await;
    }
}
