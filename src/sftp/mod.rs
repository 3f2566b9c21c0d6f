//! SFTP file management module
//!
//! Remote file operations and a managed transfer queue, both riding the
//! SFTP subsystem of one SSH connection.

pub mod error;
pub mod fs;
pub mod ops;
pub mod path_utils;
pub mod progress;
pub mod queue;
pub mod session;
pub mod transfer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::SftpError;
pub use fs::{RemoteFs, RemoteRead, RemoteWrite};
pub use progress::{estimate_eta, format_size, format_speed, progress_percent, transfer_speed, Eta};
pub use queue::{
    QueueStats, TransferDirection, TransferEvent, TransferItem, TransferQueue, TransferStatus,
};
pub use session::SftpSession;
pub use transfer::{check_transfer_control, copy_chunks, TransferControl};
pub use types::*;
