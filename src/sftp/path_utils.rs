//! Path utilities for SFTP operations
//!
//! Remote SFTP paths always use `/` as separator, whatever the local or
//! remote OS.

use std::path::Path;

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Last component of a remote path, ignoring trailing slashes
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) => name,
        None => trimmed,
    }
}

/// Parent of a remote path; `None` for the root and single relative names
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) if !trimmed.is_empty() => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

/// Every prefix of `path` that names a directory, shallowest first.
///
/// `/a/b/c` gives `/a`, `/a/b`, `/a/b/c`; `a/b` gives `a`, `a/b`.
pub fn remote_ancestors(path: &str) -> Vec<String> {
    let absolute = is_absolute_remote_path(path);
    let mut current = String::new();
    let mut out = Vec::new();

    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if current.is_empty() {
            if absolute {
                current.push('/');
            }
            current.push_str(part);
        } else {
            current = join_remote_path(&current, part);
        }
        out.push(current.clone());
    }
    out
}

/// File name of a local path, lossily converted
pub fn local_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_absolute_remote_path() {
        assert!(is_absolute_remote_path("/home/user"));
        assert!(is_absolute_remote_path("/"));
        assert!(!is_absolute_remote_path("relative/path"));
        assert!(!is_absolute_remote_path("C:\\Windows")); // Not a remote absolute path
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/", "home"), "/home");
    }

    #[test]
    fn test_file_name_and_parent() {
        assert_eq!(remote_file_name("/var/log/syslog"), "syslog");
        assert_eq!(remote_file_name("/var/log/"), "log");
        assert_eq!(remote_file_name("notes.txt"), "notes.txt");

        assert_eq!(remote_parent("/var/log/syslog"), Some("/var/log"));
        assert_eq!(remote_parent("/var"), Some("/"));
        assert_eq!(remote_parent("/"), None);
        assert_eq!(remote_parent("notes.txt"), None);
    }

    #[test]
    fn test_remote_ancestors() {
        assert_eq!(remote_ancestors("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert_eq!(remote_ancestors("/a//b/"), vec!["/a", "/a/b"]);
        assert_eq!(remote_ancestors("a/./b"), vec!["a", "a/b"]);
        assert!(remote_ancestors("/").is_empty());
    }

    #[test]
    fn test_local_file_name() {
        assert_eq!(local_file_name(Path::new("/tmp/data.bin")), "data.bin");
    }
}
