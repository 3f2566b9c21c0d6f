//! Host key trust decisions
//!
//! The handshake hands every presented host key to [`HostKeyVerifier`].
//! A `Match` passes straight through; `New` and `Changed` suspend on the
//! embedder's [`TrustDecision`] and fail closed on rejection.
//!
//! ```text
//! check_server_key ──▶ KnownHostsStore::check
//!                          │ Match ──────────────▶ accept
//!                          │ New / Changed
//!                          ▼
//!                     TrustDecision::decide ── false ──▶ HostKeyRejected / HostKeyChanged
//!                          │ true
//!                          ▼
//!                     KnownHostsStore::record ─────────▶ accept
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::PublicKey;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::known_hosts::{HostKeyStatus, KnownHostsStore};

/// Default time a channel-backed prompt waits for an answer
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// What the embedder is asked to approve
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyPrompt {
    pub host: String,
    pub key_type: String,
    pub fingerprint: String,
    /// Either `New` or `Changed`
    pub status: HostKeyStatus,
}

/// Approves or rejects an unknown or changed host key.
#[async_trait]
pub trait TrustDecision: Send + Sync {
    async fn decide(&self, prompt: &HostKeyPrompt) -> bool;
}

#[async_trait]
impl<F> TrustDecision for F
where
    F: Fn(&HostKeyPrompt) -> bool + Send + Sync,
{
    async fn decide(&self, prompt: &HostKeyPrompt) -> bool {
        self(prompt)
    }
}

/// A prompt waiting for an answer from the front end
#[derive(Debug)]
pub struct TrustRequest {
    prompt: HostKeyPrompt,
    reply: oneshot::Sender<bool>,
}

impl TrustRequest {
    pub fn prompt(&self) -> &HostKeyPrompt {
        &self.prompt
    }

    pub fn respond(self, accept: bool) {
        // Receiver gone means the handshake already timed out
        let _ = self.reply.send(accept);
    }
}

/// Forwards prompts over a channel so a UI can answer them asynchronously.
///
/// No answer, a dropped request, or a timeout all count as rejection.
pub struct ChannelTrustDecision {
    requests: mpsc::Sender<TrustRequest>,
    timeout: Duration,
}

impl ChannelTrustDecision {
    pub fn new(timeout: Duration) -> (Self, mpsc::Receiver<TrustRequest>) {
        let (requests, rx) = mpsc::channel(8);
        (Self { requests, timeout }, rx)
    }
}

#[async_trait]
impl TrustDecision for ChannelTrustDecision {
    async fn decide(&self, prompt: &HostKeyPrompt) -> bool {
        let (reply, rx) = oneshot::channel();
        let request = TrustRequest {
            prompt: prompt.clone(),
            reply,
        };

        if self.requests.send(request).await.is_err() {
            warn!("No trust prompt listener for {}, rejecting", prompt.host);
            return false;
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(accept)) => accept,
            Ok(Err(_)) => {
                warn!("Trust prompt for {} dropped without answer", prompt.host);
                false
            }
            Err(_) => {
                warn!(
                    "Trust prompt for {} timed out after {:?}",
                    prompt.host, self.timeout
                );
                false
            }
        }
    }
}

/// Runs the trust-on-first-use policy for one connect attempt
#[derive(Clone)]
pub struct HostKeyVerifier {
    store: Arc<KnownHostsStore>,
    decision: Arc<dyn TrustDecision>,
}

impl HostKeyVerifier {
    pub fn new(store: Arc<KnownHostsStore>, decision: Arc<dyn TrustDecision>) -> Self {
        Self { store, decision }
    }

    pub async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let host_id = KnownHostsStore::host_key_id(host, port);
        let fingerprint = KnownHostsStore::fingerprint(key);
        self.verify_fingerprint(&host_id, key.algorithm().as_str(), &fingerprint)
            .await
    }

    pub async fn verify_fingerprint(
        &self,
        host_id: &str,
        key_type: &str,
        fingerprint: &str,
    ) -> Result<(), SshError> {
        let status = self.store.check(host_id, fingerprint);
        if status == HostKeyStatus::Match {
            debug!("Host key verified for {}", host_id);
            return Ok(());
        }

        let prompt = HostKeyPrompt {
            host: host_id.to_string(),
            key_type: key_type.to_string(),
            fingerprint: fingerprint.to_string(),
            status,
        };

        if !self.decision.decide(&prompt).await {
            warn!("Host key for {} rejected ({:?})", host_id, status);
            return Err(match status {
                HostKeyStatus::Changed => SshError::HostKeyChanged {
                    host: prompt.host,
                    fingerprint: prompt.fingerprint,
                },
                _ => SshError::HostKeyRejected {
                    host: prompt.host,
                    fingerprint: prompt.fingerprint,
                },
            });
        }

        info!("Host key for {} accepted ({:?})", host_id, status);
        if let Err(e) = self.store.record(host_id, fingerprint) {
            // Connection still proceeds; the next connect will prompt again
            warn!("Failed to save host key for {}: {}", host_id, e);
        }
        Ok(())
    }
}
