//! Durable string key-value backends.
//!
//! Everything the vault persists (identity index, sealed blobs, settings and
//! scoped entries) goes through `KeyValueStore`. There are no transactions:
//! callers read-modify-write and the last writer wins.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, error};

use crate::error::{Result, VaultError};

/// Default quota, matching what a browser origin typically gets.
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

fn used_bytes(map: &BTreeMap<String, String>) -> u64 {
    map.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
}

/// Reject a write that would push the store past `quota` (0 = unlimited).
fn check_quota(map: &BTreeMap<String, String>, key: &str, value: &str, quota: u64) -> Result<()> {
    if quota == 0 {
        return Ok(());
    }
    let existing = map.get(key).map(|v| (key.len() + v.len()) as u64).unwrap_or(0);
    let projected = used_bytes(map) - existing + (key.len() + value.len()) as u64;
    if projected > quota {
        return Err(VaultError::StorageUnavailable(format!(
            "quota exceeded ({projected} > {quota} bytes)"
        )));
    }
    Ok(())
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, String>>,
    quota_bytes: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            quota_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.write();
        check_quota(&map, key, value, self.quota_bytes)?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .map
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ── File-backed ──────────────────────────────────────────────────────────────

/// Single JSON document on disk, cached in memory and rewritten atomically
/// (temp file + rename) on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    map: RwLock<BTreeMap<String, String>>,
    quota_bytes: u64,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P, quota_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let map = Self::read_map(&path)?;
        debug!(path = %path.display(), entries = map.len(), "file store opened");
        Ok(Self {
            path,
            map: RwLock::new(map),
            quota_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the document, picking up writes from other processes.
    pub fn reload(&self) -> Result<()> {
        let map = Self::read_map(&self.path)?;
        *self.map.write() = map;
        Ok(())
    }

    /// A document that does not parse is moved aside to
    /// `<name>.corrupt-<millis>` so the next write cannot overwrite it.
    fn read_map(path: &Path) -> Result<BTreeMap<String, String>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => Ok(map),
            Err(e) => {
                let aside = Self::quarantine_path(path);
                fs::rename(path, &aside)?;
                error!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "store document unreadable, moved aside"
                );
                Ok(BTreeMap::new())
            }
        }
    }

    fn quarantine_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let stamp = chrono::Utc::now().timestamp_millis();
        path.with_file_name(format!("{name}.corrupt-{stamp}"))
    }

    fn persist(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec(map)?)?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| VaultError::StorageUnavailable(format!("persist store: {}", e.error)))?;
        Ok(())
    }

    /// Apply `mutate` to the cached map and write it out; the cache is rolled
    /// back if the write fails.
    fn write_through<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> Result<()>,
    {
        let mut map = self.map.write();
        let mut next = map.clone();
        mutate(&mut next)?;
        self.persist(&next)?;
        *map = next;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let quota = self.quota_bytes;
        self.write_through(|map| {
            check_quota(map, key, value, quota)?;
            map.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        if !self.map.read().contains_key(key) {
            return Ok(());
        }
        self.write_through(|map| {
            map.remove(key);
            Ok(())
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .map
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
