//! Transfer control and the chunked copy loop
//!
//! Cancellation is cooperative: the copy loop checks the control before
//! every chunk, so a cancelled transfer unwinds within one chunk.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::error::SftpError;
use super::types::constants::TRANSFER_CHUNK_SIZE;

/// One-shot cancellation signal for a single transfer
#[derive(Debug, Default)]
pub struct TransferControl {
    cancelled: AtomicBool,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually set the flag
    pub fn cancel(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub fn check_transfer_control(control: &TransferControl) -> Result<(), SftpError> {
    if control.is_cancelled() {
        return Err(SftpError::TransferCancelled);
    }
    Ok(())
}

/// Copy `reader` into `writer` in fixed chunks until EOF.
///
/// `on_chunk` gets the running byte total after each chunk is written.
/// The writer is not shut down here.
pub async fn copy_chunks<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    control: &TransferControl,
    mut on_chunk: F,
) -> Result<u64, SftpError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut transferred = 0u64;

    loop {
        check_transfer_control(control)?;

        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| SftpError::TransferError(format!("read failed: {}", e)))?;
        if n == 0 {
            break;
        }

        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| SftpError::TransferError(format!("write failed: {}", e)))?;

        transferred += n as u64;
        on_chunk(transferred);
    }

    debug!("Copy finished: {} bytes", transferred);
    Ok(transferred)
}
