//! SFTP data types

use serde::{Deserialize, Serialize};

/// File entry information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Last modified time (Unix timestamp)
    pub modified: i64,
    /// File permissions (octal string, e.g., "755")
    pub permissions: String,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }

    /// Extension used for type ordering, lowercased; empty when there is none
    pub fn extension(&self) -> String {
        match self.name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Sort order for directory listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Name,
    NameDesc,
    Size,
    SizeDesc,
    Modified,
    ModifiedDesc,
    Type,
    TypeDesc,
}

/// Filter for directory listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    /// Show hidden files (starting with .)
    #[serde(default)]
    pub show_hidden: bool,
    /// File name pattern to match (glob-style)
    pub pattern: Option<String>,
    #[serde(default)]
    pub sort: SortOrder,
}

/// Constants for SFTP operations
pub mod constants {
    /// Copy chunk size for queued transfers (32 KiB)
    pub const TRANSFER_CHUNK_SIZE: usize = 32 * 1024;

    /// Default concurrent transfers per connection
    pub const DEFAULT_CONCURRENT_TRANSFERS: usize = 2;

    /// Upper bound for `set_max_concurrent`
    pub const MAX_CONCURRENT_TRANSFERS: usize = 10;
}
