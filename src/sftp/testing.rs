//! A [`RemoteFs`] backed by a local directory, with injectable faults

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;

use super::error::SftpError;
use super::fs::{RemoteFs, RemoteRead, RemoteWrite};
use super::path_utils::{join_remote_path, remote_file_name};
use super::types::constants::TRANSFER_CHUNK_SIZE;
use super::types::{FileInfo, FileType};

pub(crate) struct DirRemoteFs {
    root: PathBuf,
    /// Delay before each chunk a reader yields
    read_delay: Option<Duration>,
    failing_reads: Mutex<HashMap<String, usize>>,
    failing_writes: Mutex<HashMap<String, usize>>,
}

impl DirRemoteFs {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_delay: None,
            failing_reads: Mutex::new(HashMap::new()),
            failing_writes: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Reads of `path` fail after `after` bytes
    pub(crate) fn fail_read_after(&self, path: &str, after: usize) {
        self.failing_reads.lock().insert(path.to_string(), after);
    }

    /// Writes to `path` fail after `after` bytes
    pub(crate) fn fail_write_after(&self, path: &str, after: usize) {
        self.failing_writes.lock().insert(path.to_string(), after);
    }

    fn local(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn file_info(name: String, path: String, meta: &std::fs::Metadata) -> FileInfo {
    let file_type = if meta.is_dir() {
        FileType::Directory
    } else if meta.is_symlink() {
        FileType::Symlink
    } else if meta.is_file() {
        FileType::File
    } else {
        FileType::Unknown
    };

    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        format!("{:o}", meta.permissions().mode() & 0o777)
    };
    #[cfg(not(unix))]
    let permissions = "000".to_string();

    FileInfo {
        name,
        path,
        file_type,
        size: meta.len(),
        modified: meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        permissions,
    }
}

#[async_trait]
impl RemoteFs for DirRemoteFs {
    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        let meta = tokio::fs::metadata(self.local(path))
            .await
            .map_err(|e| SftpError::from_io(e, path))?;
        Ok(file_info(remote_file_name(path).to_string(), path.to_string(), &meta))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo, SftpError> {
        let meta = tokio::fs::symlink_metadata(self.local(path))
            .await
            .map_err(|e| SftpError::from_io(e, path))?;
        Ok(file_info(remote_file_name(path).to_string(), path.to_string(), &meta))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        let mut dir = tokio::fs::read_dir(self.local(path))
            .await
            .map_err(|e| SftpError::from_io(e, path))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().await?;
            let full = join_remote_path(path, &name);
            entries.push(file_info(name, full, &meta));
        }
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn RemoteRead>, SftpError> {
        let local = self.local(path);
        let fail_after = self.failing_reads.lock().get(path).copied();

        if let Some(limit) = fail_after {
            let data = tokio::fs::read(&local)
                .await
                .map_err(|e| SftpError::from_io(e, path))?;
            let head = Bytes::copy_from_slice(&data[..limit.min(data.len())]);
            let chunks: Vec<io::Result<Bytes>> = vec![
                Ok(head),
                Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "injected read failure",
                )),
            ];
            return Ok(Box::new(StreamReader::new(futures_util::stream::iter(
                chunks,
            ))));
        }

        if let Some(delay) = self.read_delay {
            let data = tokio::fs::read(&local)
                .await
                .map_err(|e| SftpError::from_io(e, path))?;
            let (mut tx, rx) = tokio::io::duplex(TRANSFER_CHUNK_SIZE * 2);
            tokio::spawn(async move {
                for chunk in data.chunks(TRANSFER_CHUNK_SIZE) {
                    tokio::time::sleep(delay).await;
                    if tx.write_all(chunk).await.is_err() {
                        // Reader went away
                        return;
                    }
                }
            });
            return Ok(Box::new(rx));
        }

        let file = tokio::fs::File::open(&local)
            .await
            .map_err(|e| SftpError::from_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<Box<dyn RemoteWrite>, SftpError> {
        let file = tokio::fs::File::create(self.local(path))
            .await
            .map_err(|e| SftpError::from_io(e, path))?;
        let fail_after = self.failing_writes.lock().get(path).copied();

        let writer: Box<dyn RemoteWrite> = match fail_after {
            Some(remaining) => Box::new(FailingWriter {
                inner: file,
                remaining,
            }),
            None => Box::new(file),
        };
        Ok(writer)
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        tokio::fs::remove_file(self.local(path))
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        tokio::fs::remove_dir(self.local(path))
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        tokio::fs::create_dir(self.local(path))
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        tokio::fs::rename(self.local(from), self.local(to))
            .await
            .map_err(|e| SftpError::from_io(e, from))
    }
}

/// Passes writes through until `remaining` bytes, then errors
struct FailingWriter {
    inner: tokio::fs::File,
    remaining: usize,
}

impl AsyncWrite for FailingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected write failure",
            )));
        }
        let n = buf.len().min(this.remaining);
        match Pin::new(&mut this.inner).poll_write(cx, &buf[..n]) {
            Poll::Ready(Ok(written)) => {
                this.remaining -= written;
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
