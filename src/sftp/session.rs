//! SFTP Session
//!
//! Opens the `sftp` subsystem on a session channel of an existing SSH
//! connection and exposes it as a [`RemoteFs`].

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::FileAttributes;
use tracing::{debug, info};

use super::error::SftpError;
use super::fs::{RemoteFs, RemoteRead, RemoteWrite};
use super::path_utils::{join_remote_path, remote_file_name};
use super::types::{FileInfo, FileType};
use crate::ssh::HandleController;

pub struct SftpSession {
    sftp: RusshSftpSession,
    label: String,
}

impl SftpSession {
    /// Open a channel through the handle owner and start the subsystem on it
    pub async fn open(controller: &HandleController, label: &str) -> Result<Self, SftpError> {
        info!("Opening SFTP subsystem for {}", label);

        let channel = controller
            .open_session_channel()
            .await
            .map_err(|e| SftpError::ChannelError(e.to_string()))?;

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotReady(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotReady(e.to_string()))?;

        info!("SFTP subsystem opened for {}", label);
        Ok(Self {
            sftp,
            label: label.to_string(),
        })
    }

    pub async fn close(&self) -> Result<(), SftpError> {
        debug!("Closing SFTP session for {}", self.label);
        self.sftp.close().await.map_err(SftpError::from)
    }

    /// Expand a leading `~` against the login directory
    async fn resolve_path(&self, path: &str) -> Result<String, SftpError> {
        if path != "~" && !path.starts_with("~/") {
            return Ok(path.to_string());
        }
        let home = self
            .sftp
            .canonicalize(".")
            .await
            .map_err(|e| SftpError::ProtocolError(e.to_string()))?;
        match path.strip_prefix("~/") {
            Some(rest) => Ok(join_remote_path(&home, rest)),
            None => Ok(home),
        }
    }
}

fn file_info(name: String, path: String, metadata: &FileAttributes) -> FileInfo {
    let file_type = if metadata.is_dir() {
        FileType::Directory
    } else if metadata.is_symlink() {
        FileType::Symlink
    } else if metadata.is_regular() {
        FileType::File
    } else {
        FileType::Unknown
    };

    FileInfo {
        name,
        path,
        file_type,
        size: metadata.size.unwrap_or(0),
        modified: metadata.mtime.map(|t| t as i64).unwrap_or(0),
        permissions: metadata
            .permissions
            .map(|p| format!("{:o}", p & 0o777))
            .unwrap_or_else(|| "000".to_string()),
    }
}

/// Map SFTP errors to our error type
fn map_sftp_error(err: SftpErrorInner, path: &str) -> SftpError {
    let err_str = err.to_string();
    if err_str.contains("No such file") || err_str.contains("not found") {
        SftpError::FileNotFound(path.to_string())
    } else if err_str.contains("Permission denied") {
        SftpError::PermissionDenied(path.to_string())
    } else {
        SftpError::ProtocolError(err_str)
    }
}

#[async_trait]
impl RemoteFs for SftpSession {
    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        let path = self.resolve_path(path).await?;
        let metadata = self
            .sftp
            .metadata(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))?;
        Ok(file_info(remote_file_name(&path).to_string(), path.clone(), &metadata))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo, SftpError> {
        let path = self.resolve_path(path).await?;
        let metadata = self
            .sftp
            .symlink_metadata(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))?;
        Ok(file_info(remote_file_name(&path).to_string(), path.clone(), &metadata))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        let path = self.resolve_path(path).await?;
        let read_dir = self
            .sftp
            .read_dir(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            // Skip . and ..
            if name == "." || name == ".." {
                continue;
            }
            let full_path = join_remote_path(&path, &name);
            entries.push(file_info(name, full_path, &entry.metadata()));
        }
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn RemoteRead>, SftpError> {
        let path = self.resolve_path(path).await?;
        let file = self
            .sftp
            .open(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<Box<dyn RemoteWrite>, SftpError> {
        let path = self.resolve_path(path).await?;
        let file = self
            .sftp
            .create(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))?;
        Ok(Box::new(file))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        let path = self.resolve_path(path).await?;
        self.sftp
            .remove_file(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        let path = self.resolve_path(path).await?;
        self.sftp
            .remove_dir(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        let path = self.resolve_path(path).await?;
        self.sftp
            .create_dir(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let from = self.resolve_path(from).await?;
        let to = self.resolve_path(to).await?;
        info!("Renaming {} to {}", from, to);
        self.sftp
            .rename(from.as_str(), to.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &from))
    }
}
