//! SFTP error types

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("SFTP is not ready on this connection")]
    NotReady,

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotReady(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Transfer error: {0}")]
    TransferError(String),

    #[error("Transfer cancelled")]
    TransferCancelled,

    #[error("Transfer not found: {0}")]
    TransferNotFound(u64),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SftpError {
    /// Map a local filesystem error for `path` onto the path variants
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SftpError::FileNotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
            std::io::ErrorKind::AlreadyExists => SftpError::AlreadyExists(path.to_string()),
            _ => SftpError::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SftpError::FileNotFound(_) | SftpError::DirectoryNotFound(_)
        )
    }
}

impl From<russh_sftp::client::error::Error> for SftpError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        SftpError::ProtocolError(err.to_string())
    }
}

impl Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_maps_kinds() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            SftpError::from_io(err, "/tmp/x"),
            SftpError::FileNotFound(p) if p == "/tmp/x"
        ));

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            SftpError::from_io(err, "/root"),
            SftpError::PermissionDenied(_)
        ));
    }

    #[test]
    fn test_serialize_as_string() {
        let json = serde_json::to_string(&SftpError::TransferNotFound(7)).unwrap();
        assert_eq!(json, "\"Transfer not found: 7\"");
    }
}
