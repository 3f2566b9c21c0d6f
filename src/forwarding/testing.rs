//! Test doubles for the forwarding layer

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::local::{ForwardDialer, ForwardStream};
use crate::ssh::SshError;

/// Dials the target directly over TCP instead of through SSH
pub(crate) struct TcpDialer;

#[async_trait]
impl ForwardDialer for TcpDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, SshError> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}

/// Every dial is refused, like a server rejecting direct-tcpip
pub(crate) struct FailingDialer;

#[async_trait]
impl ForwardDialer for FailingDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, SshError> {
        Err(SshError::ChannelError(format!(
            "direct-tcpip to {}:{} refused",
            host, port
        )))
    }
}

pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A port that was free a moment ago
pub(crate) fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
