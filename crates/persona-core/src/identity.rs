//! Durable, non-secret catalogue of identities.
//!
//! The index is one JSON array under a single key; every mutation is a full
//! read-modify-write of that array. Sealed vault blobs and the small durable
//! settings (active identity, lock timeout) live next to it in the same
//! key-value store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::validate_lock_timeout;
use crate::crypto::{KdfAlgorithm, KdfParams, PBKDF2_ITERATIONS};
use crate::encoding::base64_bytes;
use crate::error::Result;
use crate::storage::KeyValueStore;

pub const INDEX_KEY: &str = "persona.identities";
pub const VAULT_KEY_PREFIX: &str = "persona.vault.";
pub const ACTIVE_IDENTITY_KEY: &str = "persona.active_identity";
pub const LOCK_TIMEOUT_KEY: &str = "persona.lock_timeout_minutes";
pub const SCOPED_KEY_PREFIX: &str = "persona.scoped.";
pub const UNSCOPED_KEY_PREFIX: &str = "persona.unscoped.";

/// Prefix under which every scoped entry of `id` lives.
pub fn scoped_prefix(id: &str) -> String {
    format!("{SCOPED_KEY_PREFIX}{id}.")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub id: String,
    pub handle: String,
    pub icon: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub doc_count: u32,
    /// Generated once at creation; never rewritten.
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub pin_verifier: Vec<u8>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub attempt_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub kdf: KdfAlgorithm,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_kdf_iterations() -> u32 {
    PBKDF2_ITERATIONS
}

impl IdentityRecord {
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            algorithm: self.kdf,
            iterations: self.kdf_iterations,
        }
    }
}

/// Partial update merged by `update_fields`. `salt` is deliberately absent.
#[derive(Debug, Clone, Default)]
pub struct IdentityPatch {
    pub handle: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub doc_count: Option<u32>,
    pub pin_verifier: Option<Vec<u8>>,
    pub attempt_count: Option<u32>,
    pub attempt_reset_at: Option<Option<DateTime<Utc>>>,
}

impl IdentityPatch {
    fn apply(self, record: &mut IdentityRecord) {
        if let Some(handle) = self.handle {
            record.handle = handle;
        }
        if let Some(icon) = self.icon {
            record.icon = icon;
        }
        if let Some(color) = self.color {
            record.color = color;
        }
        if let Some(doc_count) = self.doc_count {
            record.doc_count = doc_count;
        }
        if let Some(verifier) = self.pin_verifier {
            record.pin_verifier = verifier;
        }
        if let Some(count) = self.attempt_count {
            record.attempt_count = count;
        }
        if let Some(reset_at) = self.attempt_reset_at {
            record.attempt_reset_at = reset_at;
        }
    }
}

/// Identity index plus the per-identity vault blobs and durable settings.
#[derive(Clone)]
pub struct IdentityStore {
    kv: Arc<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    /// All identities in creation order. Absent or unreadable storage yields
    /// an empty list.
    pub fn list(&self) -> Vec<IdentityRecord> {
        let raw = match self.kv.get(INDEX_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "identity index unavailable");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "identity index corrupt, treating as empty");
                Vec::new()
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<IdentityRecord> {
        self.list().into_iter().find(|r| r.id == id)
    }

    /// Overwrite the whole index. Not atomic against concurrent readers in
    /// other processes; the last writer wins.
    pub fn save_all(&self, records: &[IdentityRecord]) -> Result<()> {
        let raw = serde_json::to_string(records)?;
        self.kv.set(INDEX_KEY, &raw)
    }

    pub fn insert(&self, record: IdentityRecord) -> Result<()> {
        let mut records = self.list();
        records.retain(|r| r.id != record.id);
        records.push(record);
        self.save_all(&records)
    }

    /// Merge `patch` into the record for `id`. Returns false for unknown ids.
    pub fn update_fields(&self, id: &str, patch: IdentityPatch) -> Result<bool> {
        let mut records = self.list();
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        patch.apply(record);
        self.save_all(&records)?;
        debug!(identity_id = %id, "identity record updated");
        Ok(true)
    }

    /// Drop `id` from the index. Returns false if it was not present.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut records = self.list();
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.save_all(&records)?;
        Ok(true)
    }

    /// Destroy `id`: the index entry first, then its blob and scoped entries.
    ///
    /// Only the index removal is reported to the caller. Blob and scoped
    /// cleanup failures are logged and not retried.
    pub fn purge(&self, id: &str) -> Result<bool> {
        let removed = self.remove(id)?;
        if let Err(e) = self.remove_blob(id) {
            error!(identity_id = %id, error = %e, "failed to remove vault blob");
        }
        match self.kv.keys_with_prefix(&scoped_prefix(id)) {
            Ok(keys) => {
                for key in keys {
                    if let Err(e) = self.kv.remove(&key) {
                        error!(identity_id = %id, error = %e, "failed to remove scoped entry");
                    }
                }
            }
            Err(e) => error!(identity_id = %id, error = %e, "failed to enumerate scoped entries"),
        }
        if self.active_identity().as_deref() == Some(id) {
            if let Err(e) = self.set_active_identity(None) {
                warn!(identity_id = %id, error = %e, "failed to clear active identity");
            }
        }
        info!(identity_id = %id, "identity purged");
        Ok(removed)
    }

    // ── Vault blobs ──────────────────────────────────────────────────────────

    pub fn blob(&self, id: &str) -> Result<Option<String>> {
        self.kv.get(&format!("{VAULT_KEY_PREFIX}{id}"))
    }

    pub fn put_blob(&self, id: &str, blob: &str) -> Result<()> {
        self.kv.set(&format!("{VAULT_KEY_PREFIX}{id}"), blob)
    }

    pub fn remove_blob(&self, id: &str) -> Result<()> {
        self.kv.remove(&format!("{VAULT_KEY_PREFIX}{id}"))
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    pub fn active_identity(&self) -> Option<String> {
        self.kv.get(ACTIVE_IDENTITY_KEY).ok().flatten()
    }

    pub fn set_active_identity(&self, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) => self.kv.set(ACTIVE_IDENTITY_KEY, id),
            None => self.kv.remove(ACTIVE_IDENTITY_KEY),
        }
    }

    /// Stored lock timeout, or `fallback` when unset or unreadable.
    pub fn lock_timeout(&self, fallback: u32) -> u32 {
        self.kv
            .get(LOCK_TIMEOUT_KEY)
            .ok()
            .flatten()
            .and_then(|raw| raw.parse::<u32>().ok())
            .filter(|m| validate_lock_timeout(*m).is_ok())
            .unwrap_or(fallback)
    }

    pub fn set_lock_timeout(&self, minutes: u32) -> Result<()> {
        validate_lock_timeout(minutes)?;
        self.kv.set(LOCK_TIMEOUT_KEY, &minutes.to_string())
    }
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new(Arc::new(crate::storage::MemoryStore::new()))
    }
}
