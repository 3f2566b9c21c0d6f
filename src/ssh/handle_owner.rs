//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the SSH Handle.
//!
//! Only one task owns the `Handle<ClientHandler>`. Shell, tunnels, SFTP and
//! keepalive talk to it through a cloneable [`HandleController`] that sends
//! commands over an mpsc channel and receives replies on oneshots.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Deadlocks from holding locks across `.await`
//! - Protocol violations from concurrent Handle access

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How long a keepalive probe may wait for the server's reply
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time, or a soft protocol error
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (shell, exec, sftp subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Send `keepalive@openssh.com`
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning only copies the senders. Anything holding a controller has full
/// control of the transport, so it must stay inside the process.
#[derive(Clone, Debug)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task exits
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Build a controller around a bare command sender (tests drive the receiver)
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Returns a receiver that gets `()` when the transport closes
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Ask the owner task to disconnect. No-op if it already exited.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller. `connection_id` is only
/// used for logging.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    connection_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let notify_tx = disconnect_tx.clone();

    tokio::spawn(async move {
        let handle = handle;
        info!("Handle owner task started for {}", connection_id);

        loop {
            // Exit once the transport is gone even if nobody sends Disconnect
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = wait_closed(&handle) => {
                    info!("Transport closed for {}", connection_id);
                    break;
                }
            };

            match cmd {
                Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped here and the server closes it
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                Some(HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                Some(HandleCommand::Ping { reply_tx }) => {
                    debug!("Keepalive probe for {}", connection_id);
                    let result = match tokio::time::timeout(PING_TIMEOUT, handle.send_keepalive(true)).await {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(russh::Error::Disconnect)) | Ok(Err(russh::Error::SendError)) => {
                            warn!("Keepalive found {} disconnected", connection_id);
                            PingResult::IoError
                        }
                        Ok(Err(e)) => {
                            warn!("Keepalive error for {}: {}", connection_id, e);
                            PingResult::Timeout
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for {} ({:?})", connection_id, PING_TIMEOUT);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for {}", connection_id);
                    break;
                }

                None => {
                    info!("All controllers dropped for {}", connection_id);
                    break;
                }
            }
        }

        // Notify subscribers; send fails only when nobody listens
        let _ = notify_tx.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", connection_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Resolves when the russh session task has stopped
async fn wait_closed(handle: &Handle<ClientHandler>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    while !handle.is_closed() {
        ticker.tick().await;
    }
}

/// Drain all pending commands, answering each with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
