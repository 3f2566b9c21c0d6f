//! One-shot remote file operations built on [`RemoteFs`]

use tracing::{debug, info};

use super::error::SftpError;
use super::fs::RemoteFs;
use super::path_utils::remote_ancestors;
use super::types::{FileInfo, FileType, ListFilter, SortOrder};

/// List `path`, applying `filter`. Directories always sort first.
pub async fn list_directory(
    fs: &dyn RemoteFs,
    path: &str,
    filter: Option<&ListFilter>,
) -> Result<Vec<FileInfo>, SftpError> {
    let mut entries = fs.read_dir(path).await?;
    entries.retain(|e| e.name != "." && e.name != "..");

    if let Some(f) = filter {
        if !f.show_hidden {
            entries.retain(|e| !e.is_hidden());
        }
        if let Some(pattern) = &f.pattern {
            let glob_pattern = glob::Pattern::new(pattern)
                .map_err(|e| SftpError::InvalidPath(format!("bad pattern {}: {}", pattern, e)))?;
            entries.retain(|e| glob_pattern.matches(&e.name));
        }
    }

    let order = filter.map(|f| f.sort).unwrap_or_default();
    sort_entries(&mut entries, order);

    debug!("Listed {} entries in {}", entries.len(), path);
    Ok(entries)
}

fn sort_entries(entries: &mut [FileInfo], order: SortOrder) {
    entries.sort_by(|a, b| {
        // Directories always first
        if a.is_dir() != b.is_dir() {
            return b.is_dir().cmp(&a.is_dir());
        }

        let by_name = || a.name.to_lowercase().cmp(&b.name.to_lowercase());
        let by_type = || a.extension().cmp(&b.extension()).then_with(by_name);

        match order {
            SortOrder::Name => by_name(),
            SortOrder::NameDesc => by_name().reverse(),
            SortOrder::Size => a.size.cmp(&b.size).then_with(by_name),
            SortOrder::SizeDesc => b.size.cmp(&a.size).then_with(by_name),
            SortOrder::Modified => a.modified.cmp(&b.modified).then_with(by_name),
            SortOrder::ModifiedDesc => b.modified.cmp(&a.modified).then_with(by_name),
            SortOrder::Type => by_type(),
            SortOrder::TypeDesc => by_type().reverse(),
        }
    });
}

/// Delete a file, a symlink or an empty directory
pub async fn remove(fs: &dyn RemoteFs, path: &str) -> Result<(), SftpError> {
    let info = fs.lstat(path).await?;
    info!("Deleting: {}", path);
    if info.is_dir() {
        fs.remove_dir(path).await
    } else {
        fs.remove_file(path).await
    }
}

/// Delete a directory tree, children first. Returns the number of entries
/// removed, `path` included.
///
/// A symlink is never followed, so `path` naming a link to a directory is
/// `DirectoryNotFound`.
pub async fn remove_directory_recursive(fs: &dyn RemoteFs, path: &str) -> Result<u64, SftpError> {
    let info = fs.lstat(path).await?;
    if !info.is_dir() {
        return Err(SftpError::DirectoryNotFound(path.to_string()));
    }
    info!("Recursively deleting: {}", path);
    remove_tree(fs, path).await
}

async fn remove_tree(fs: &dyn RemoteFs, path: &str) -> Result<u64, SftpError> {
    let mut removed = 0u64;
    for entry in fs.read_dir(path).await? {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        if entry.file_type == FileType::Directory {
            // Boxed to keep the recursive future sized
            removed += Box::pin(remove_tree(fs, &entry.path)).await?;
        } else {
            fs.remove_file(&entry.path).await?;
            removed += 1;
        }
    }
    fs.remove_dir(path).await?;
    Ok(removed + 1)
}

/// Remove `path`, recursively when it is a directory. A symlink is removed
/// itself, never its target.
pub async fn remove_path(fs: &dyn RemoteFs, path: &str) -> Result<u64, SftpError> {
    let info = fs.lstat(path).await?;
    if info.is_dir() {
        remove_tree(fs, path).await
    } else {
        fs.remove_file(path).await?;
        Ok(1)
    }
}

/// Create `path`. With `recursive`, each missing ancestor is created in
/// order and directories that already exist are accepted.
pub async fn create_directory(fs: &dyn RemoteFs, path: &str, recursive: bool) -> Result<(), SftpError> {
    if !recursive {
        info!("Creating directory: {}", path);
        return fs.create_dir(path).await;
    }

    let ancestors = remote_ancestors(path);
    if ancestors.is_empty() {
        return Err(SftpError::InvalidPath(path.to_string()));
    }

    for dir in ancestors {
        match fs.stat(&dir).await {
            Ok(info) if info.is_dir() => continue,
            Ok(_) => return Err(SftpError::AlreadyExists(dir)),
            Err(e) if e.is_not_found() => {
                debug!("Creating missing directory: {}", dir);
                fs.create_dir(&dir).await?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::testing::DirRemoteFs;

    fn names(entries: &[FileInfo]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    async fn fixture() -> (tempfile::TempDir, DirRemoteFs) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("zeta")).unwrap();
        std::fs::create_dir(root.join("Alpha")).unwrap();
        std::fs::write(root.join("b.log"), vec![0u8; 300]).unwrap();
        std::fs::write(root.join("a.txt"), vec![0u8; 20]).unwrap();
        std::fs::write(root.join("c.log"), vec![0u8; 100]).unwrap();
        std::fs::write(root.join(".hidden"), b"x").unwrap();
        let fs = DirRemoteFs::new(root);
        (dir, fs)
    }

    #[tokio::test]
    async fn test_list_directories_first_and_hidden() {
        let (_dir, fs) = fixture().await;

        let listed = list_directory(&fs, "/", Some(&ListFilter::default()))
            .await
            .unwrap();
        assert_eq!(names(&listed), vec!["Alpha", "zeta", "a.txt", "b.log", "c.log"]);

        let filter = ListFilter {
            show_hidden: true,
            ..Default::default()
        };
        let listed = list_directory(&fs, "/", Some(&filter)).await.unwrap();
        assert!(names(&listed).contains(&".hidden"));
    }

    #[tokio::test]
    async fn test_list_pattern_and_sort() {
        let (_dir, fs) = fixture().await;

        let filter = ListFilter {
            show_hidden: false,
            pattern: Some("*.log".to_string()),
            sort: SortOrder::SizeDesc,
        };
        let listed = list_directory(&fs, "/", Some(&filter)).await.unwrap();
        assert_eq!(names(&listed), vec!["b.log", "c.log"]);

        let filter = ListFilter {
            sort: SortOrder::TypeDesc,
            ..Default::default()
        };
        let listed = list_directory(&fs, "/", Some(&filter)).await.unwrap();
        assert_eq!(names(&listed), vec!["zeta", "Alpha", "a.txt", "c.log", "b.log"]);
    }

    #[tokio::test]
    async fn test_bad_pattern_is_invalid_path() {
        let (_dir, fs) = fixture().await;
        let filter = ListFilter {
            pattern: Some("[".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            list_directory(&fs, "/", Some(&filter)).await,
            Err(SftpError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_create_directory_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DirRemoteFs::new(dir.path());
        std::fs::create_dir(dir.path().join("a")).unwrap();

        create_directory(&fs, "/a/b/c", true).await.unwrap();
        assert!(dir.path().join("a/b/c").is_dir());

        // Existing tree is fine
        create_directory(&fs, "/a/b/c", true).await.unwrap();

        // Without recursion the parent must exist
        assert!(create_directory(&fs, "/x/y", false).await.is_err());

        std::fs::write(dir.path().join("a/file"), b"").unwrap();
        assert!(matches!(
            create_directory(&fs, "/a/file/sub", true).await,
            Err(SftpError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_recursive_and_remove_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("tree/sub/deeper")).unwrap();
        std::fs::write(root.join("tree/one"), b"1").unwrap();
        std::fs::write(root.join("tree/sub/two"), b"2").unwrap();
        std::fs::write(root.join("single"), b"3").unwrap();
        let fs = DirRemoteFs::new(root);

        let removed = remove_directory_recursive(&fs, "/tree").await.unwrap();
        assert_eq!(removed, 5);
        assert!(!root.join("tree").exists());

        assert!(matches!(
            remove_directory_recursive(&fs, "/single").await,
            Err(SftpError::DirectoryNotFound(_))
        ));
        assert_eq!(remove_path(&fs, "/single").await.unwrap(), 1);
        assert!(!root.join("single").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_symlink_keeps_target() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("precious")).unwrap();
        std::fs::write(root.join("precious/data"), b"keep").unwrap();
        std::os::unix::fs::symlink(root.join("precious"), root.join("link")).unwrap();
        std::os::unix::fs::symlink(root.join("precious"), root.join("link2")).unwrap();
        std::os::unix::fs::symlink(root.join("precious"), root.join("link3")).unwrap();
        let fs = DirRemoteFs::new(root);

        assert!(matches!(
            remove_directory_recursive(&fs, "/link").await,
            Err(SftpError::DirectoryNotFound(_))
        ));
        assert!(root.join("precious/data").exists());

        assert_eq!(remove_path(&fs, "/link").await.unwrap(), 1);
        assert!(std::fs::symlink_metadata(root.join("link")).is_err());
        assert!(root.join("precious/data").exists());

        remove(&fs, "/link2").await.unwrap();
        assert!(std::fs::symlink_metadata(root.join("link2")).is_err());

        // Inside a tree, the link goes and its target stays
        std::fs::create_dir(root.join("tree")).unwrap();
        std::fs::rename(root.join("link3"), root.join("tree/link3")).unwrap();
        assert_eq!(remove_directory_recursive(&fs, "/tree").await.unwrap(), 2);
        assert!(root.join("precious/data").exists());
    }

    #[tokio::test]
    async fn test_remove_refuses_non_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("full")).unwrap();
        std::fs::write(dir.path().join("full/f"), b"").unwrap();
        let fs = DirRemoteFs::new(dir.path());

        assert!(remove(&fs, "/full").await.is_err());
        std::fs::remove_file(dir.path().join("full/f")).unwrap();
        remove(&fs, "/full").await.unwrap();
        assert!(!dir.path().join("full").exists());
    }
}
