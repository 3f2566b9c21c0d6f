//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: forward 127.0.0.1:8888 -> jupyter-host:8888

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::ForwardEventEmitter;
use super::manager::{ForwardStats, ForwardStatus, TunnelKey};
use crate::ssh::{HandleController, SshError};

/// Idle timeout for forwarded connections (5 minutes)
const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Delay before retrying after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consecutive accept failures after which the tunnel gives up
const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 16;

/// How long `stop` waits for the accept loop to release the listener
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Byte stream for the remote leg of a forwarded connection
pub trait ForwardStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ForwardStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens the remote leg for an accepted local connection
#[async_trait]
pub trait ForwardDialer: Send + Sync {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, SshError>;
}

/// Remote legs ride `direct-tcpip` channels of the SSH transport
#[async_trait]
impl ForwardDialer for HandleController {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, SshError> {
        let channel = self
            .open_direct_tcpip(
                host,
                port as u32,
                &originator.ip().to_string(),
                originator.port() as u32,
            )
            .await?;
        Ok(Box::new(Box::pin(channel.into_stream())))
    }
}

/// Local port forwarding configuration
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Address to bind, usually 127.0.0.1
    pub bind_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl LocalForward {
    pub fn new(
        bind_host: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            bind_host: bind_host.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.local_port)
    }
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    pub config: LocalForward,
    /// Actual bound address
    pub bound_addr: SocketAddr,
    token: CancellationToken,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<ForwardStats>>,
}

impl LocalForwardHandle {
    /// Stop accepting and release the listener. Idempotent.
    ///
    /// Waits for the accept loop to exit so the port can be bound again,
    /// but not for in-flight relay pairs; those drain on their own.
    pub async fn stop(&self) {
        self.token.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            info!("Stopping local port forward on {}", self.bound_addr);
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                warn!("Accept loop on {} did not exit in {:?}", self.bound_addr, STOP_TIMEOUT);
            }
        }
    }

    /// Cancel without waiting for the accept loop
    pub fn stop_signal(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

/// Bind the local listener and spawn the accept loop.
///
/// The loop runs until `token` is cancelled, or until accept fails
/// `MAX_CONSECUTIVE_ACCEPT_ERRORS` times in a row, in which case the
/// forward ends in `Error` status. Without `forward_id` the forward is
/// named after the bound port.
pub async fn start_local_forward(
    dialer: Arc<dyn ForwardDialer>,
    config: LocalForward,
    token: CancellationToken,
    forward_id: Option<String>,
    event_emitter: Option<ForwardEventEmitter>,
) -> Result<LocalForwardHandle, SshError> {
    let local_addr = config.local_addr();
    let listener = TcpListener::bind(&local_addr).await.map_err(|e| {
        let reason = match e.kind() {
            std::io::ErrorKind::AddrInUse => {
                "port already in use by another application".to_string()
            }
            std::io::ErrorKind::PermissionDenied => {
                "permission denied (ports below 1024 require elevated privileges)".to_string()
            }
            std::io::ErrorKind::AddrNotAvailable => "address not available on this system".to_string(),
            _ => e.to_string(),
        };
        SshError::ListenFailed {
            addr: local_addr.clone(),
            reason,
        }
    })?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ListenFailed {
            addr: local_addr.clone(),
            reason: e.to_string(),
        })?;

    let forward_id = forward_id.unwrap_or_else(|| {
        TunnelKey::new(bound_addr.port(), config.remote_host.clone(), config.remote_port).default_id()
    });

    info!(
        "Started local port forward {}: {} -> {}:{}",
        forward_id, bound_addr, config.remote_host, config.remote_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(RwLock::new(ForwardStats::default()));

    let task = tokio::spawn(accept_loop(
        listener,
        dialer,
        config.remote_host.clone(),
        config.remote_port,
        token.clone(),
        running.clone(),
        stats.clone(),
        forward_id,
        event_emitter,
    ));

    Ok(LocalForwardHandle {
        config,
        bound_addr,
        token,
        running,
        task: Mutex::new(Some(task)),
        stats,
    })
}

enum ExitReason {
    StopRequested,
    AcceptFailed(String),
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    dialer: Arc<dyn ForwardDialer>,
    remote_host: String,
    remote_port: u16,
    token: CancellationToken,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<ForwardStats>>,
    forward_id: String,
    event_emitter: Option<ForwardEventEmitter>,
) {
    let mut consecutive_errors = 0u32;

    let exit_reason = loop {
        tokio::select! {
            _ = token.cancelled() => {
                break ExitReason::StopRequested;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        consecutive_errors = 0;

                        // Disable Nagle's algorithm for low-latency forwarding
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("Accepted connection from {} for forward {}", peer_addr, forward_id);
                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }

                        let dialer = dialer.clone();
                        let remote_host = remote_host.clone();
                        let stats = stats.clone();
                        tokio::spawn(async move {
                            let result = handle_forward_connection(
                                dialer.as_ref(),
                                stream,
                                peer_addr,
                                &remote_host,
                                remote_port,
                                &stats,
                            )
                            .await;

                            {
                                let mut s = stats.write();
                                s.active_connections = s.active_connections.saturating_sub(1);
                            }

                            if let Err(e) = result {
                                warn!("Forward connection to {}:{} failed: {}", remote_host, remote_port, e);
                            }
                        });
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                            error!(
                                "Forward {} giving up after {} consecutive accept errors: {}",
                                forward_id, consecutive_errors, e
                            );
                            break ExitReason::AcceptFailed(e.to_string());
                        }
                        warn!("Accept error on forward {} ({}): {}", forward_id, consecutive_errors, e);

                        tokio::select! {
                            _ = token.cancelled() => break ExitReason::StopRequested,
                            _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
    };

    // Release the port before reporting anything
    drop(listener);
    running.store(false, Ordering::SeqCst);

    match exit_reason {
        ExitReason::StopRequested => {
            // The manager reports user stops and teardown itself
            debug!("Accept loop for forward {} stopped", forward_id);
        }
        ExitReason::AcceptFailed(reason) => {
            if let Some(emitter) = &event_emitter {
                emitter.emit_status_changed(&forward_id, ForwardStatus::Error, Some(reason));
            }
        }
    }

    info!("Local port forward task {} exited", forward_id);
}

/// Relay one accepted connection. When either leg ends, both are dropped.
async fn handle_forward_connection(
    dialer: &dyn ForwardDialer,
    mut local_stream: TcpStream,
    peer_addr: SocketAddr,
    remote_host: &str,
    remote_port: u16,
    stats: &RwLock<ForwardStats>,
) -> Result<(), SshError> {
    // On failure the local socket is dropped (closed) on return
    let remote_stream = dialer.dial(remote_host, remote_port, peer_addr).await?;

    debug!("Opened remote leg to {}:{}", remote_host, remote_port);

    let (mut local_read, mut local_write) = local_stream.split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote_stream);

    let local_to_remote = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, local_read.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if let Err(e) = remote_write.write_all(&buf[..n]).await {
                        debug!("Remote write error: {}", e);
                        break;
                    }
                    stats.write().bytes_sent += n as u64;
                }
                Ok(Err(e)) => {
                    debug!("Local read error: {}", e);
                    break;
                }
                Err(_) => {
                    debug!("Local read idle timeout ({}s)", FORWARD_IDLE_TIMEOUT.as_secs());
                    break;
                }
            }
        }
        let _ = remote_write.shutdown().await;
    };

    let remote_to_local = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, remote_read.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if let Err(e) = local_write.write_all(&buf[..n]).await {
                        debug!("Local write error: {}", e);
                        break;
                    }
                    stats.write().bytes_received += n as u64;
                }
                Ok(Err(e)) => {
                    debug!("Remote read error: {}", e);
                    break;
                }
                Err(_) => {
                    debug!("Remote read idle timeout ({}s)", FORWARD_IDLE_TIMEOUT.as_secs());
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = local_to_remote => {}
        _ = remote_to_local => {}
    }

    debug!("Forward connection from {} closed", peer_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::testing::{free_port, spawn_echo_server, FailingDialer, TcpDialer};

    fn forward_to(port: u16, target: SocketAddr) -> LocalForward {
        LocalForward::new("127.0.0.1", port, target.ip().to_string(), target.port())
    }

    #[tokio::test]
    async fn test_echo_through_forward() {
        let echo = spawn_echo_server().await;
        let port = free_port();
        let handle = start_local_forward(
            Arc::new(TcpDialer),
            forward_to(port, echo),
            CancellationToken::new(),
            Some("fwd-echo".into()),
            None,
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hello tunnel").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello tunnel");

        drop(client);
        for _ in 0..200 {
            if handle.stats().active_connections == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;
        assert!(!handle.is_running());

        let stats = handle.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.bytes_sent, 12);
        assert_eq!(stats.bytes_received, 12);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_local_socket() {
        let port = free_port();
        let handle = start_local_forward(
            Arc::new(FailingDialer),
            LocalForward::new("127.0.0.1", port, "unreachable", 1),
            CancellationToken::new(),
            Some("fwd-fail".into()),
            None,
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("local socket should be closed promptly");
        assert!(matches!(read, Ok(0) | Err(_)));

        // The tunnel itself stays up
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let port = free_port();
        let handle = start_local_forward(
            Arc::new(FailingDialer),
            LocalForward::new("127.0.0.1", port, "unused", 1),
            CancellationToken::new(),
            Some("fwd-stop".into()),
            None,
        )
        .await
        .unwrap();

        handle.stop().await;
        handle.stop().await;

        let rebound = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_loop() {
        let port = free_port();
        let parent = CancellationToken::new();
        let handle = start_local_forward(
            Arc::new(FailingDialer),
            LocalForward::new("127.0.0.1", port, "unused", 1),
            parent.child_token(),
            Some("fwd-parent".into()),
            None,
        )
        .await
        .unwrap();

        parent.cancel();
        for _ in 0..100 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_listen_error() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let result = start_local_forward(
            Arc::new(FailingDialer),
            LocalForward::new("127.0.0.1", port, "unused", 1),
            CancellationToken::new(),
            Some("fwd-busy".into()),
            None,
        )
        .await;

        assert!(matches!(result, Err(SshError::ListenFailed { .. })));
    }
}
