//! Remote filesystem seam
//!
//! The transfer queue and the one-shot file operations talk to the remote
//! side only through [`RemoteFs`], so they run unchanged against a real
//! SFTP session or a local directory in tests.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::SftpError;
use super::types::FileInfo;

pub trait RemoteRead: AsyncRead + Send + Unpin {}

impl<T> RemoteRead for T where T: AsyncRead + Send + Unpin {}

pub trait RemoteWrite: AsyncWrite + Send + Unpin {}

impl<T> RemoteWrite for T where T: AsyncWrite + Send + Unpin {}

#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError>;

    /// Like `stat`, but a final symlink is reported as `Symlink` rather
    /// than followed
    async fn lstat(&self, path: &str) -> Result<FileInfo, SftpError>;

    /// Raw directory entries, `.` and `..` excluded, in server order
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError>;

    async fn open_read(&self, path: &str) -> Result<Box<dyn RemoteRead>, SftpError>;

    /// Create or truncate `path` for writing
    async fn create(&self, path: &str) -> Result<Box<dyn RemoteWrite>, SftpError>;

    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;
}
