//! Port Forwarding Manager
//!
//! Owns every tunnel of one connection. Tunnels are keyed by
//! `(local_port, remote_host, remote_port)`; both the key and the rule id
//! must be unique. The table lock is never held across a bind or a stop.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::ForwardEventEmitter;
use super::local::{start_local_forward, ForwardDialer, LocalForward, LocalForwardHandle};
use crate::ssh::SshError;

/// Forward statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connection count
    pub connection_count: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent (local -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> local)
    pub bytes_received: u64,
}

/// Status of a port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Active,
    /// Stopped by request
    Stopped,
    /// Accept loop gave up
    Error,
    /// The connection went away underneath it
    Suspended,
}

/// Identity of a tunnel within one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelKey {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl TunnelKey {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// `local_port:remote_host:remote_port`, used when no id is given
    pub fn default_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

/// Snapshot of a tunnel for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRule {
    pub id: String,
    pub bind_address: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub status: ForwardStatus,
    pub stats: ForwardStats,
}

struct ForwardEntry {
    rule: ForwardRule,
    key: TunnelKey,
    handle: LocalForwardHandle,
}

impl ForwardEntry {
    fn snapshot(&self) -> ForwardRule {
        let mut rule = self.rule.clone();
        rule.status = if self.handle.is_running() {
            ForwardStatus::Active
        } else {
            ForwardStatus::Error
        };
        rule.stats = self.handle.stats();
        rule
    }
}

#[derive(Default)]
struct TunnelTable {
    active: HashMap<String, ForwardEntry>,
    /// Claimed by a `forward` call that is still binding
    reserved: HashMap<String, TunnelKey>,
}

impl TunnelTable {
    fn key_in_use(&self, key: &TunnelKey) -> bool {
        self.active.values().any(|e| &e.key == key) || self.reserved.values().any(|k| k == key)
    }

    fn id_in_use(&self, id: &str) -> bool {
        self.active.contains_key(id) || self.reserved.contains_key(id)
    }
}

pub struct ForwardingManager {
    dialer: Arc<dyn ForwardDialer>,
    /// Parent of every tunnel's token; cancelled on connection teardown
    lifetime: CancellationToken,
    bind_host: String,
    event_emitter: ForwardEventEmitter,
    table: RwLock<TunnelTable>,
}

impl ForwardingManager {
    pub fn new(
        dialer: Arc<dyn ForwardDialer>,
        lifetime: CancellationToken,
        bind_host: impl Into<String>,
        event_emitter: ForwardEventEmitter,
    ) -> Self {
        Self {
            dialer,
            lifetime,
            bind_host: bind_host.into(),
            event_emitter,
            table: RwLock::new(TunnelTable::default()),
        }
    }

    pub fn events(&self) -> &ForwardEventEmitter {
        &self.event_emitter
    }

    /// Start forwarding `local_port` to `remote_host:remote_port`.
    ///
    /// A duplicate key or id fails with `AlreadyExists` and leaves nothing
    /// behind; a bind failure releases the reservation. With `local_port`
    /// 0 the OS picks the port, and the key and default id use the bound one.
    pub async fn forward(
        &self,
        id: Option<&str>,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ForwardRule, SshError> {
        let ephemeral = local_port == 0;
        let requested = TunnelKey::new(local_port, remote_host, remote_port);
        // Ephemeral forwards without an explicit id are named after the bind
        let reserved_id = id
            .map(str::to_string)
            .or_else(|| (!ephemeral).then(|| requested.default_id()));

        {
            let mut table = self.table.write();
            if self.lifetime.is_cancelled() {
                return Err(SshError::Disconnected);
            }
            if !ephemeral && table.key_in_use(&requested) {
                return Err(SshError::AlreadyExists(format!(
                    "tunnel on local port {} already exists",
                    local_port
                )));
            }
            if let Some(id) = &reserved_id {
                if table.id_in_use(id) {
                    return Err(SshError::AlreadyExists(format!("tunnel {} already exists", id)));
                }
                table.reserved.insert(id.clone(), requested.clone());
            }
        }

        let config = LocalForward::new(self.bind_host.clone(), local_port, remote_host, remote_port);
        info!(
            "Creating local forward: {} -> {}:{}",
            config.local_addr(),
            remote_host,
            remote_port
        );

        let started = start_local_forward(
            self.dialer.clone(),
            config,
            self.lifetime.child_token(),
            reserved_id.clone(),
            Some(self.event_emitter.clone()),
        )
        .await;

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(id) = &reserved_id {
                    self.table.write().reserved.remove(id);
                }
                return Err(e);
            }
        };

        let key = TunnelKey::new(handle.bound_addr.port(), remote_host, remote_port);
        let id = reserved_id.clone().unwrap_or_else(|| key.default_id());
        let rule = ForwardRule {
            id: id.clone(),
            bind_address: handle.bound_addr.ip().to_string(),
            local_port: handle.bound_addr.port(),
            remote_host: remote_host.to_string(),
            remote_port,
            status: ForwardStatus::Active,
            stats: ForwardStats::default(),
        };

        let rejected = {
            let mut table = self.table.write();
            if let Some(id) = &reserved_id {
                table.reserved.remove(id);
            }
            if self.lifetime.is_cancelled() {
                // Teardown ran while we were binding
                Some((handle, SshError::Disconnected))
            } else if reserved_id.is_none() && table.id_in_use(&id) {
                Some((
                    handle,
                    SshError::AlreadyExists(format!("tunnel {} already exists", id)),
                ))
            } else {
                table.active.insert(
                    id.clone(),
                    ForwardEntry {
                        rule: rule.clone(),
                        key,
                        handle,
                    },
                );
                None
            }
        };

        if let Some((handle, err)) = rejected {
            handle.stop().await;
            return Err(err);
        }

        // Emit event after releasing lock
        self.event_emitter
            .emit_status_changed(&id, ForwardStatus::Active, None);
        info!("Local forward created: {}", id);
        Ok(rule)
    }

    /// Stop a tunnel and forget it
    pub async fn stop(&self, forward_id: &str) -> Result<(), SshError> {
        let entry = self.table.write().active.remove(forward_id);
        let Some(entry) = entry else {
            return Err(SshError::NotFound(format!("tunnel {}", forward_id)));
        };

        entry.handle.stop().await;
        // Final counters, then the status change
        self.event_emitter
            .emit_stats_updated(forward_id, entry.handle.stats());
        self.event_emitter
            .emit_status_changed(forward_id, ForwardStatus::Stopped, None);
        info!("Stopped local forward: {}", forward_id);
        Ok(())
    }

    pub fn list_active(&self) -> Vec<ForwardRule> {
        let mut rules: Vec<ForwardRule> = self
            .table
            .read()
            .active
            .values()
            .map(ForwardEntry::snapshot)
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn get(&self, forward_id: &str) -> Option<ForwardRule> {
        self.table
            .read()
            .active
            .get(forward_id)
            .map(ForwardEntry::snapshot)
    }

    pub fn stats(&self, forward_id: &str) -> Option<ForwardStats> {
        self.table
            .read()
            .active
            .get(forward_id)
            .map(|e| e.handle.stats())
    }

    pub fn count(&self) -> usize {
        self.table.read().active.len()
    }

    /// Stop every tunnel concurrently
    pub async fn stop_all(&self) {
        let entries: Vec<ForwardEntry> = {
            let mut table = self.table.write();
            table.active.drain().map(|(_, entry)| entry).collect()
        };
        if entries.is_empty() {
            return;
        }

        let forward_ids: Vec<String> = entries.iter().map(|e| e.rule.id.clone()).collect();
        info!(
            "Stopping {} forwards for {}",
            entries.len(),
            self.event_emitter.connection_id()
        );
        join_all(entries.iter().map(|e| e.handle.stop())).await;

        if self.lifetime.is_cancelled() {
            self.event_emitter.emit_session_suspended(forward_ids);
        } else {
            for id in &forward_ids {
                self.event_emitter
                    .emit_status_changed(id, ForwardStatus::Stopped, None);
            }
        }
    }
}

impl Drop for ForwardingManager {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        if !table.active.is_empty() {
            warn!(
                "ForwardingManager dropped with {} active forwards",
                table.active.len()
            );
            for entry in table.active.values() {
                // Cancelling drops the listener once the loop observes it
                entry.handle.stop_signal();
            }
        }
    }
}
