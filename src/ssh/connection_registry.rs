//! SSH Connection Registry
//!
//! Owns the map of live connections. Ids are reserved before any dialing so
//! a duplicate `connect` fails fast, and each registered connection gets a
//! watcher task that drops it from the map once its lifetime token fires.
//!
//! ```text
//! connect(id) ──reserve──> pending ──establish ok──> live ──lifetime fires──> removed + closed
//!                             └──establish err──> released
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::config::SshConfig;
use super::connection::SshConnection;
use super::error::SshError;
use super::trust::HostKeyVerifier;
use crate::config::CoreConfig;

/// What the registry needs from a connection
#[async_trait]
pub trait ManagedConnection: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Cancelled when the connection goes away on its own
    fn lifetime(&self) -> CancellationToken;

    /// Idempotent teardown
    async fn close(&self);
}

#[async_trait]
impl ManagedConnection for SshConnection {
    fn id(&self) -> &str {
        SshConnection::id(self)
    }

    fn lifetime(&self) -> CancellationToken {
        SshConnection::lifetime(self)
    }

    async fn close(&self) {
        SshConnection::close(self).await
    }
}

struct RegistryTable<C> {
    live: HashMap<String, Arc<C>>,
    /// Ids whose connection is still being established
    pending: HashSet<String>,
}

impl<C> RegistryTable<C> {
    fn is_taken(&self, id: &str) -> bool {
        self.live.contains_key(id) || self.pending.contains(id)
    }
}

/// Holds an id in `pending` until dropped, so a cancelled `connect`
/// future does not leave the id reserved
struct Reservation<'a, C: ManagedConnection> {
    registry: &'a ConnectionRegistry<C>,
    id: String,
}

impl<C: ManagedConnection> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        self.registry.table.write().pending.remove(&self.id);
    }
}

pub struct ConnectionRegistry<C: ManagedConnection = SshConnection> {
    table: RwLock<RegistryTable<C>>,
}

impl<C: ManagedConnection> ConnectionRegistry<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(RegistryTable {
                live: HashMap::new(),
                pending: HashSet::new(),
            }),
        })
    }

    /// Reserve `id`, run `establish`, then register the result.
    ///
    /// The reservation is released if `establish` fails or this future is
    /// dropped before it completes.
    pub async fn register_with<F, Fut>(
        self: &Arc<Self>,
        id: &str,
        establish: F,
    ) -> Result<Arc<C>, SshError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<C>, SshError>>,
    {
        let reservation = {
            let mut table = self.table.write();
            if table.is_taken(id) {
                return Err(SshError::AlreadyExists(format!("connection {}", id)));
            }
            table.pending.insert(id.to_string());
            Reservation {
                registry: self.as_ref(),
                id: id.to_string(),
            }
        };

        let connection = match establish().await {
            Ok(connection) => connection,
            Err(e) => {
                debug!("Connection {} failed to establish: {}", id, e);
                return Err(e);
            }
        };

        self.table
            .write()
            .live
            .insert(id.to_string(), connection.clone());
        // Id is now held by `live`
        drop(reservation);
        self.spawn_watcher(&connection);

        info!("Registered connection {}", id);
        Ok(connection)
    }

    /// Register an already established connection
    pub fn register(self: &Arc<Self>, connection: Arc<C>) -> Result<(), SshError> {
        {
            let mut table = self.table.write();
            if table.is_taken(connection.id()) {
                return Err(SshError::AlreadyExists(format!(
                    "connection {}",
                    connection.id()
                )));
            }
            table
                .live
                .insert(connection.id().to_string(), connection.clone());
        }
        self.spawn_watcher(&connection);

        info!("Registered connection {}", connection.id());
        Ok(())
    }

    /// Drop the entry once its lifetime fires, unless it was replaced
    fn spawn_watcher(self: &Arc<Self>, connection: &Arc<C>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let watched: Weak<C> = Arc::downgrade(connection);
        let lifetime = connection.lifetime();
        let id = connection.id().to_string();

        tokio::spawn(async move {
            lifetime.cancelled().await;
            let Some(registry) = registry.upgrade() else {
                return;
            };

            let removed = {
                let mut table = registry.table.write();
                let same = table
                    .live
                    .get(&id)
                    .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), watched.as_ptr()));
                if same {
                    table.live.remove(&id)
                } else {
                    None
                }
            };

            if let Some(connection) = removed {
                info!("Connection {} ended, removing from registry", id);
                connection.close().await;
            }
        });
    }

    pub fn get(&self, id: &str) -> Option<Arc<C>> {
        self.table.read().live.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<C>> {
        let mut connections: Vec<_> = self.table.read().live.values().cloned().collect();
        connections.sort_by(|a, b| a.id().cmp(b.id()));
        connections
    }

    pub fn len(&self) -> usize {
        self.table.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close(&self, id: &str) -> Result<(), SshError> {
        let connection = self.table.write().live.remove(id);
        match connection {
            Some(connection) => {
                connection.close().await;
                Ok(())
            }
            None => Err(SshError::NotFound(format!("connection {}", id))),
        }
    }

    pub async fn close_all(&self) {
        let connections: Vec<_> = self.table.write().live.drain().map(|(_, c)| c).collect();
        if connections.is_empty() {
            return;
        }
        info!("Closing {} connections", connections.len());
        join_all(connections.iter().map(|c| c.close())).await;
    }
}

impl ConnectionRegistry<SshConnection> {
    /// Dial and register a connection. A fresh uuid is used when `id` is
    /// `None`.
    pub async fn connect(
        self: &Arc<Self>,
        id: Option<String>,
        config: SshConfig,
        verifier: HostKeyVerifier,
        core: &CoreConfig,
    ) -> Result<Arc<SshConnection>, SshError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_id = id.clone();
        self.register_with(&id, move || {
            SshConnection::connect(connection_id, config, verifier, core)
        })
        .await
    }
}
