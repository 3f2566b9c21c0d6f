//! Trust-on-first-use host key store
//!
//! One record per host, persisted as `host fingerprint` lines. The file is
//! read fully at startup and rewritten atomically on every change.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD_NO_PAD as BASE64_NO_PAD, Engine};
use parking_lot::{Mutex, RwLock};
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

const FILE_HEADER: &str = "# shellport known hosts\n# <host> <fingerprint>\n";

/// Outcome of comparing a presented fingerprint with the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyStatus {
    /// No fingerprint stored for this host
    New,
    /// Stored fingerprint equals the presented one
    Match,
    /// Stored fingerprint differs (possible impersonation)
    Changed,
}

pub struct KnownHostsStore {
    hosts: RwLock<BTreeMap<String, String>>,
    path: PathBuf,
    /// Serializes file rewrites so the last writer persists the latest map
    persist_lock: Mutex<()>,
}

impl KnownHostsStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SshError> {
        let path = path.into();
        let hosts = Self::load(&path)?;
        info!("Loaded {} known host entries from {:?}", hosts.len(), path);
        Ok(Self {
            hosts: RwLock::new(hosts),
            path,
            persist_lock: Mutex::new(()),
        })
    }

    /// Like [`open`](Self::open) but starts empty when the file can't be read
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let hosts = Self::load(&path).unwrap_or_else(|e| {
            warn!("Failed to load known hosts from {:?}: {}", path, e);
            BTreeMap::new()
        });
        Self {
            hosts: RwLock::new(hosts),
            path,
            persist_lock: Mutex::new(()),
        }
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>, SshError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(SshError::IoError(e)),
        };

        let mut hosts = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((host, rest)) = line.split_once(char::is_whitespace) else {
                debug!("Skipping malformed known hosts line: {}", line);
                continue;
            };
            let Some(fingerprint) = rest.split_whitespace().next() else {
                continue;
            };
            hosts.insert(host.to_string(), fingerprint.to_string());
        }
        Ok(hosts)
    }

    /// Lookup key for host:port. Port 22 uses the bare host name.
    pub fn host_key_id(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    /// Fingerprint of a raw public key blob, `SHA256:` + unpadded base64
    pub fn fingerprint_bytes(key_bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key_bytes);
        format!("SHA256:{}", BASE64_NO_PAD.encode(hasher.finalize()))
    }

    pub fn check(&self, host: &str, fingerprint: &str) -> HostKeyStatus {
        match self.hosts.read().get(host) {
            None => HostKeyStatus::New,
            Some(stored) if stored == fingerprint => HostKeyStatus::Match,
            Some(stored) => {
                warn!(
                    "HOST KEY CHANGED for {}! Expected {}, got {}",
                    host, stored, fingerprint
                );
                HostKeyStatus::Changed
            }
        }
    }

    /// Store `fingerprint` for `host`, replacing any previous record, and
    /// rewrite the file.
    pub fn record(&self, host: &str, fingerprint: &str) -> Result<(), SshError> {
        self.hosts
            .write()
            .insert(host.to_string(), fingerprint.to_string());
        self.persist()?;
        info!("Recorded host key for {} ({})", host, fingerprint);
        Ok(())
    }

    /// Forget a host (for key rotation). Returns whether it was known.
    pub fn remove(&self, host: &str) -> Result<bool, SshError> {
        let removed = self.hosts.write().remove(host).is_some();
        if removed {
            self.persist()?;
            info!("Removed host key for {}", host);
        }
        Ok(removed)
    }

    pub fn get(&self, host: &str) -> Option<String> {
        self.hosts.read().get(host).cloned()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to temp file first, then rename (atomic write)
    fn persist(&self) -> Result<(), SshError> {
        let _guard = self.persist_lock.lock();

        let mut contents = String::from(FILE_HEADER);
        for (host, fingerprint) in self.hosts.read().iter() {
            contents.push_str(host);
            contents.push(' ');
            contents.push_str(fingerprint);
            contents.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GITHUB_ED25519: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    #[test]
    fn test_host_key_id() {
        assert_eq!(KnownHostsStore::host_key_id("GitHub.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::host_key_id("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = russh::keys::parse_public_key_base64(GITHUB_ED25519).unwrap();
        let first = KnownHostsStore::fingerprint(&key);
        let second = KnownHostsStore::fingerprint(&key);
        assert_eq!(first, second);
        assert_eq!(first, "SHA256:+DiY3wvvV6TuJJhbpZisF/zLDA0zPMSvHdkr4UvCOqU");
    }

    #[test]
    fn test_new_then_match_after_record() {
        let dir = tempdir().unwrap();
        let store = KnownHostsStore::with_path(dir.path().join("known_hosts"));

        assert_eq!(store.check("example.com", "SHA256:aaa"), HostKeyStatus::New);
        store.record("example.com", "SHA256:aaa").unwrap();
        assert_eq!(store.check("example.com", "SHA256:aaa"), HostKeyStatus::Match);
        assert_eq!(store.check("example.com", "SHA256:aaa"), HostKeyStatus::Match);
    }

    #[test]
    fn test_changed_until_overwritten() {
        let dir = tempdir().unwrap();
        let store = KnownHostsStore::with_path(dir.path().join("known_hosts"));
        store.record("example.com", "SHA256:aaa").unwrap();

        assert_eq!(
            store.check("example.com", "SHA256:bbb"),
            HostKeyStatus::Changed
        );
        // Not auto-healed by repeated checks
        assert_eq!(
            store.check("example.com", "SHA256:bbb"),
            HostKeyStatus::Changed
        );

        store.record("example.com", "SHA256:bbb").unwrap();
        assert_eq!(store.check("example.com", "SHA256:bbb"), HostKeyStatus::Match);
        assert_eq!(
            store.check("example.com", "SHA256:aaa"),
            HostKeyStatus::Changed
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("known_hosts");
        {
            let store = KnownHostsStore::with_path(&path);
            store.record("a.example", "SHA256:one").unwrap();
            store.record("[b.example]:2222", "SHA256:two").unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with('#'));
        assert!(contents.contains("a.example SHA256:one\n"));
        assert!(!path.with_extension("tmp").exists());

        let reloaded = KnownHostsStore::open(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("[b.example]:2222").as_deref(), Some("SHA256:two"));
    }

    #[test]
    fn test_load_skips_comments_and_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            "# comment\n\nlonely-host\nhost.one SHA256:xyz trailing\n  # indented comment\n",
        )
        .unwrap();

        let store = KnownHostsStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.check("host.one", "SHA256:xyz"), HostKeyStatus::Match);
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let store = KnownHostsStore::with_path(&path);
        store.record("gone.example", "SHA256:q").unwrap();

        assert!(store.remove("gone.example").unwrap());
        assert!(!store.remove("gone.example").unwrap());
        assert_eq!(store.check("gone.example", "SHA256:q"), HostKeyStatus::New);
        assert!(KnownHostsStore::open(&path).unwrap().is_empty());
    }
}
