//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The trust decision rejected a host key seen for the first time
    #[error("Host key for {host} rejected ({fingerprint})")]
    HostKeyRejected { host: String, fingerprint: String },

    /// The presented host key differs from the recorded one and was not accepted
    #[error("HOST KEY CHANGED for {host} ({fingerprint}), possible man-in-the-middle attack")]
    HostKeyChanged { host: String, fingerprint: String },

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Command exited with status {exit_status}")]
    CommandFailed { exit_status: u32, output: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to listen on {addr}: {reason}")]
    ListenFailed { addr: String, reason: String },

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Host identity failures must reach the caller as-is so they can be
    /// rendered apart from ordinary network errors.
    pub fn is_trust_error(&self) -> bool {
        matches!(
            self,
            SshError::HostKeyRejected { .. } | SshError::HostKeyChanged { .. }
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

// Serialized as the display string for embedding front ends
impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
