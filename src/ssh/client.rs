//! SSH Client implementation using russh

use std::sync::Arc;

use parking_lot::Mutex;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::trust::HostKeyVerifier;

/// Servers rarely need more than one round; a few more covers banners
const MAX_KBI_ROUNDS: usize = 4;

pub struct SshClient {
    config: SshConfig,
    verifier: HostKeyVerifier,
}

impl SshClient {
    pub fn new(config: SshConfig, verifier: HostKeyVerifier) -> Self {
        Self { config, verifier }
    }

    /// Dial, verify the host key, authenticate, and hand the transport to
    /// its owner task.
    ///
    /// The timeout covers resolution, dial and handshake including the
    /// trust decision. Failures are reported once; there is no retry.
    pub async fn connect(self, connection_id: &str) -> Result<HandleController, SshError> {
        let addr = self.config.address();
        info!("Connecting to SSH server at {}", addr);

        let ssh_config = client::Config {
            // Liveness is handled by the keepalive loop
            inactivity_timeout: None,
            ..Default::default()
        };

        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.verifier.clone(),
            rejection.clone(),
        );

        let timeout = self.config.timeout();
        let connected = tokio::time::timeout(timeout, async {
            let socket_addr = tokio::net::lookup_host(&addr)
                .await
                .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
                .next()
                .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;
            client::connect(Arc::new(ssh_config), socket_addr, handler).await
        })
        .await;

        let mut handle = match connected {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                // A trust rejection surfaces from russh as a generic error
                if let Some(trust_err) = rejection.lock().take() {
                    return Err(trust_err);
                }
                return Err(match e {
                    SshError::ProtocolError(msg) => SshError::ConnectionFailed(msg),
                    other => other,
                });
            }
            Err(_) => {
                return Err(SshError::Timeout(format!(
                    "Connection to {} timed out after {}s",
                    addr,
                    timeout.as_secs()
                )))
            }
        };

        debug!("SSH handshake completed with {}", addr);

        let authenticated = match self.authenticate(&mut handle).await {
            Ok(ok) => ok,
            Err(e) => {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                    .await;
                return Err(e);
            }
        };

        if !authenticated {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);
        Ok(spawn_handle_owner_task(handle, connection_id.to_string()))
    }

    async fn authenticate(&self, handle: &mut client::Handle<ClientHandler>) -> Result<bool, SshError> {
        let username = &self.config.username;
        match &self.config.auth {
            AuthMethod::Password { password } => {
                let result = handle
                    .authenticate_password(username, password)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
                if result.success() {
                    return Ok(true);
                }
                debug!("Password rejected, trying keyboard-interactive");
                authenticate_kbi_with_password(handle, username, password).await
            }
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                let result = handle
                    .authenticate_publickey(username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
                Ok(result.success())
            }
        }
    }
}

/// Keyboard-interactive fallback for servers that refuse plain password
/// auth: every prompt is answered with the password.
async fn authenticate_kbi_with_password(
    handle: &mut client::Handle<ClientHandler>,
    username: &str,
    password: &str,
) -> Result<bool, SshError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

    for _ in 0..MAX_KBI_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                debug!("Keyboard-interactive round with {} prompts", prompts.len());
                let answers = vec![password.to_string(); prompts.len()];
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            }
        }
    }

    warn!("Keyboard-interactive gave up after {} rounds", MAX_KBI_ROUNDS);
    Ok(false)
}

/// Client handler for russh callbacks
///
/// Host key verification runs inside `check_server_key`, before the
/// handshake completes. A rejection is parked in `rejection` so the caller
/// can report the trust error itself instead of russh's generic failure.
pub struct ClientHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
    rejection: Arc<Mutex<Option<SshError>>>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        verifier: HostKeyVerifier,
        rejection: Arc<Mutex<Option<SshError>>>,
    ) -> Self {
        Self {
            host,
            port,
            verifier,
            rejection,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self
            .verifier
            .verify(&self.host, self.port, server_public_key)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                *self.rejection.lock() = Some(e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::{Algorithm, PrivateKey};
    use russh::server::{self, Auth, Response};
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    use crate::ssh::known_hosts::KnownHostsStore;
    use crate::ssh::trust::HostKeyPrompt;

    const SECRET: &str = "hunter2";

    /// Refuses `password` and only accepts `SECRET` through keyboard-interactive
    #[derive(Clone)]
    struct KbiOnlyServer {
        password_attempts: Arc<AtomicUsize>,
    }

    impl server::Handler for KbiOnlyServer {
        type Error = russh::Error;

        async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
            self.password_attempts.fetch_add(1, Ordering::SeqCst);
            Ok(Auth::reject())
        }

        async fn auth_keyboard_interactive<'a>(
            &'a mut self,
            _user: &str,
            _submethods: &str,
            response: Option<Response<'a>>,
        ) -> Result<Auth, Self::Error> {
            let Some(mut response) = response else {
                return Ok(Auth::Partial {
                    name: Cow::Borrowed(""),
                    instructions: Cow::Borrowed(""),
                    prompts: Cow::Owned(vec![(Cow::Borrowed("Password: "), false)]),
                });
            };
            match response.next() {
                Some(answer) if &answer[..] == SECRET.as_bytes() => Ok(Auth::Accept),
                _ => Ok(Auth::reject()),
            }
        }
    }

    /// Serve every accepted socket on 127.0.0.1 with a fresh host key
    async fn spawn_server(handler: KbiOnlyServer) -> u16 {
        let mut config = server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            ..Default::default()
        };
        config
            .keys
            .push(PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap());
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let config = config.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, socket, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });
        port
    }

    fn kbi_only_server() -> (KbiOnlyServer, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let server = KbiOnlyServer {
            password_attempts: attempts.clone(),
        };
        (server, attempts)
    }

    #[tokio::test]
    async fn test_rejected_host_key_surfaces_trust_error() {
        let (server, attempts) = kbi_only_server();
        let port = spawn_server(server).await;

        let dir = tempdir().unwrap();
        let store = Arc::new(KnownHostsStore::with_path(dir.path().join("known_hosts")));
        let verifier = HostKeyVerifier::new(store.clone(), Arc::new(|_: &HostKeyPrompt| false));
        let config = SshConfig::new("127.0.0.1", port, "tester", AuthMethod::password(SECRET));

        let err = SshClient::new(config, verifier)
            .connect("conn-reject")
            .await
            .unwrap_err();

        assert!(matches!(err, SshError::HostKeyRejected { .. }), "got {:?}", err);
        assert!(err.is_trust_error());
        assert!(store.is_empty());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_password_falls_back_to_keyboard_interactive() {
        let (server, attempts) = kbi_only_server();
        let port = spawn_server(server).await;

        let dir = tempdir().unwrap();
        let store = Arc::new(KnownHostsStore::with_path(dir.path().join("known_hosts")));
        let verifier = HostKeyVerifier::new(store.clone(), Arc::new(|_: &HostKeyPrompt| true));
        let config = SshConfig::new("127.0.0.1", port, "tester", AuthMethod::password(SECRET));

        let controller = SshClient::new(config, verifier)
            .connect("conn-kbi")
            .await
            .unwrap();

        assert!(controller.is_connected());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn test_wrong_secret_fails_both_methods() {
        let (server, attempts) = kbi_only_server();
        let port = spawn_server(server).await;

        let dir = tempdir().unwrap();
        let store = Arc::new(KnownHostsStore::with_path(dir.path().join("known_hosts")));
        let verifier = HostKeyVerifier::new(store, Arc::new(|_: &HostKeyPrompt| true));
        let config = SshConfig::new("127.0.0.1", port, "tester", AuthMethod::password("wrong"));

        let err = SshClient::new(config, verifier)
            .connect("conn-wrong")
            .await
            .unwrap_err();

        assert!(matches!(err, SshError::AuthenticationFailed(_)), "got {:?}", err);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
