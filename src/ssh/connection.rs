//! One authenticated transport and everything riding on it
//!
//! An [`SshConnection`] owns the handle controller, the optional shell, the
//! tunnel table and the transfer queue. Its lifetime token fires when the
//! transport drops, the shell ends, or the session-end detector matches;
//! any of those tears the whole connection down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::SshClient;
use super::config::SshConfig;
use super::error::SshError;
use super::handle_owner::HandleController;
use super::keepalive::Keepalive;
use super::session::{self, PreparedShell, SessionEndDetector, ShellHandle, ShellSink};
use super::trust::HostKeyVerifier;
use crate::config::CoreConfig;
use crate::forwarding::{ForwardEventEmitter, ForwardingManager};
use crate::sftp::{self, FileInfo, ListFilter, RemoteFs, SftpError, SftpSession, TransferQueue};

/// How long `close` waits for transfer workers to unwind
const TRANSFER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Static description of a connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn from_config(id: &str, config: &SshConfig) -> Self {
        Self {
            id: id.to_string(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            connected_at: Utc::now(),
        }
    }
}

pub struct SshConnection {
    info: ConnectionInfo,
    controller: HandleController,
    lifetime: CancellationToken,
    keepalive: Keepalive,
    shell: Mutex<Option<Arc<ShellHandle>>>,
    tunnels: ForwardingManager,
    transfers: TransferQueue,
    sftp: RwLock<Option<Arc<SftpSession>>>,
    closed: AtomicBool,
}

impl SshConnection {
    /// Dial, verify, authenticate, then attach SFTP and keepalive.
    ///
    /// A missing SFTP subsystem is not fatal: file operations and transfers
    /// report `NotReady` instead.
    pub async fn connect(
        id: String,
        mut config: SshConfig,
        verifier: HostKeyVerifier,
        core: &CoreConfig,
    ) -> Result<Arc<Self>, SshError> {
        if config.timeout_secs == 0 {
            config.timeout_secs = core.connect_timeout_secs;
        }
        let info = ConnectionInfo::from_config(&id, &config);
        let controller = SshClient::new(config, verifier).connect(&id).await?;

        let connection = Self::from_controller(info, controller, core);

        match SftpSession::open(&connection.controller, &id).await {
            Ok(session) => connection.attach_sftp(session),
            Err(e) => warn!("SFTP unavailable for {}: {}", id, e),
        }

        if let Some(interval) = core.keepalive_interval() {
            connection.start_keepalive(interval);
        }

        info!("Connection {} established", id);
        Ok(connection)
    }

    /// Wrap an already established transport
    pub(crate) fn from_controller(
        info: ConnectionInfo,
        controller: HandleController,
        core: &CoreConfig,
    ) -> Arc<Self> {
        let lifetime = CancellationToken::new();
        bridge_disconnect(&controller, lifetime.clone());

        let tunnels = ForwardingManager::new(
            Arc::new(controller.clone()),
            lifetime.clone(),
            core.tunnel_bind_host.clone(),
            ForwardEventEmitter::new(info.id.clone()),
        );

        let connection = Arc::new(Self {
            tunnels,
            transfers: TransferQueue::new(core.max_concurrent_transfers()),
            info,
            controller,
            lifetime,
            keepalive: Keepalive::new(),
            shell: Mutex::new(None),
            sftp: RwLock::new(None),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&connection);
        let lifetime = connection.lifetime.clone();
        tokio::spawn(async move {
            lifetime.cancelled().await;
            if let Some(connection) = weak.upgrade() {
                connection.close().await;
            }
        });

        connection
    }

    pub fn attach_sftp(&self, session: SftpSession) {
        let session = Arc::new(session);
        let fs: Arc<dyn RemoteFs> = session.clone();
        *self.sftp.write() = Some(session);
        self.transfers.attach(fs);
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Fires once when the connection is torn down, for any reason
    pub fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn controller(&self) -> &HandleController {
        &self.controller
    }

    pub fn tunnels(&self) -> &ForwardingManager {
        &self.tunnels
    }

    pub fn transfers(&self) -> &TransferQueue {
        &self.transfers
    }

    fn ensure_open(&self) -> Result<(), SshError> {
        if self.is_closed() || self.lifetime.is_cancelled() {
            return Err(SshError::Disconnected);
        }
        Ok(())
    }

    // ========================================================================
    // Shell
    // ========================================================================

    pub async fn open_shell(&self, cols: u32, rows: u32) -> Result<PreparedShell, SshError> {
        self.ensure_open()?;
        session::open_shell(&self.controller, cols, rows).await
    }

    /// Start a prepared shell. Its end, or a positive detection, tears the
    /// connection down.
    pub async fn start_shell(
        &self,
        prepared: PreparedShell,
        sink: Arc<dyn ShellSink>,
        detector: Option<Arc<dyn SessionEndDetector>>,
    ) -> Result<(), SshError> {
        self.ensure_open()?;
        if self.is_shell_running() {
            return Err(SshError::AlreadyExists("shell".to_string()));
        }

        let handle = prepared
            .start(self.info.id.clone(), sink, detector, self.lifetime.clone())
            .await?;

        let mut shell = self.shell.lock();
        if shell.as_ref().is_some_and(|s| s.is_running()) {
            handle.close();
            return Err(SshError::AlreadyExists("shell".to_string()));
        }
        *shell = Some(Arc::new(handle));
        Ok(())
    }

    pub fn is_shell_running(&self) -> bool {
        self.shell.lock().as_ref().is_some_and(|s| s.is_running())
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        let shell = self.shell.lock().clone();
        match shell {
            Some(shell) => shell.write(data).await,
            None => Err(SshError::SessionError("No shell is running".to_string())),
        }
    }

    pub fn resize(&self, rows: u32, cols: u32) {
        if let Some(shell) = self.shell.lock().as_ref() {
            shell.resize(rows, cols);
        }
    }

    pub async fn run_command(&self, command: &str) -> Result<String, SshError> {
        self.ensure_open()?;
        session::run_command(&self.controller, command).await
    }

    // ========================================================================
    // Keepalive
    // ========================================================================

    pub fn start_keepalive(&self, interval: Duration) {
        self.keepalive
            .start(Arc::new(self.controller.clone()), interval, self.info.id.clone());
    }

    pub fn stop_keepalive(&self) {
        self.keepalive.stop();
    }

    pub fn is_keepalive_running(&self) -> bool {
        self.keepalive.is_running()
    }

    // ========================================================================
    // Remote files
    // ========================================================================

    fn sftp(&self) -> Result<Arc<SftpSession>, SftpError> {
        self.sftp.read().clone().ok_or(SftpError::NotReady)
    }

    pub async fn list_directory(
        &self,
        path: &str,
        filter: Option<&ListFilter>,
    ) -> Result<Vec<FileInfo>, SftpError> {
        let fs = self.sftp()?;
        sftp::ops::list_directory(fs.as_ref(), path, filter).await
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        self.sftp()?.stat(path).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.sftp()?.rename(from, to).await
    }

    pub async fn remove(&self, path: &str) -> Result<(), SftpError> {
        let fs = self.sftp()?;
        sftp::ops::remove(fs.as_ref(), path).await
    }

    pub async fn remove_directory_recursive(&self, path: &str) -> Result<u64, SftpError> {
        let fs = self.sftp()?;
        sftp::ops::remove_directory_recursive(fs.as_ref(), path).await
    }

    pub async fn remove_path(&self, path: &str) -> Result<u64, SftpError> {
        let fs = self.sftp()?;
        sftp::ops::remove_path(fs.as_ref(), path).await
    }

    pub async fn create_directory(&self, path: &str, recursive: bool) -> Result<(), SftpError> {
        let fs = self.sftp()?;
        sftp::ops::create_directory(fs.as_ref(), path, recursive).await
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear everything down. Idempotent; the transport is disconnected once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing connection {}", self.info.id);

        self.keepalive.stop();
        self.tunnels.stop_all().await;

        self.transfers.shutdown();
        if !self.transfers.wait_idle(TRANSFER_DRAIN_TIMEOUT).await {
            warn!(
                "Transfer workers for {} still running after {:?}",
                self.info.id, TRANSFER_DRAIN_TIMEOUT
            );
        }

        let shell = self.shell.lock().take();
        if let Some(shell) = shell {
            shell.close();
        }

        let session = self.sftp.write().take();
        self.transfers.detach();
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                debug!("SFTP close for {} failed: {}", self.info.id, e);
            }
        }

        self.lifetime.cancel();
        self.controller.disconnect().await;
        info!("Connection {} closed", self.info.id);
    }
}

/// Cancel `lifetime` when the handle owner reports the transport gone
fn bridge_disconnect(controller: &HandleController, lifetime: CancellationToken) {
    let mut disconnect_rx = controller.subscribe_disconnect();
    // Owner may have exited before we subscribed
    if !controller.is_connected() {
        lifetime.cancel();
        return;
    }
    tokio::spawn(async move {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                debug!("Transport closed, cancelling connection lifetime");
                lifetime.cancel();
            }
            _ = lifetime.cancelled() => {}
        }
    });
}
