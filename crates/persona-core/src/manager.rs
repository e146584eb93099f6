//! `IdentityManager` ties the store, limiter, vault codec, session and scoped
//! namespace together. It is the surface applications call.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::crypto::{generate_identity_id, generate_salt, verifier_for_key, DerivedKey};
use crate::error::{Result, VaultError};
use crate::identity::{IdentityPatch, IdentityRecord, IdentityStore};
use crate::limiter::{derive_key_off_thread, validate_pin, AttemptLimiter};
use crate::paths::STORE_FILE;
use crate::scoped::ScopedNamespace;
use crate::session::{ActiveKey, SessionInfo, SessionManager, SessionStore, VolatileSessionStore};
use crate::storage::{FileStore, KeyValueStore};
use crate::vault::{self, Profile, VaultPayload};

#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub handle: String,
    pub icon: String,
    pub color: String,
}

/// Metadata-only profile edit. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub handle: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug)]
pub struct UnlockedIdentity {
    pub record: IdentityRecord,
    pub payload: VaultPayload,
    pub session: SessionInfo,
    /// A metadata write that failed during unlock. The session is live.
    pub persist_error: Option<VaultError>,
}

pub struct IdentityManager {
    config: CoreConfig,
    store: IdentityStore,
    limiter: Arc<AttemptLimiter>,
    sessions: Arc<SessionManager>,
    scoped: ScopedNamespace,
    clock: Arc<dyn Clock>,
}

impl IdentityManager {
    /// File-backed manager rooted at `data_dir`, with the system clock and a
    /// process-local session.
    pub fn open<P: AsRef<Path>>(data_dir: P, config: CoreConfig) -> Result<Self> {
        let path = data_dir.as_ref().join(STORE_FILE);
        let kv = Arc::new(FileStore::open(&path, config.storage_quota_bytes)?);
        Self::with_parts(
            kv,
            Box::new(VolatileSessionStore::new()),
            Arc::new(SystemClock),
            config,
        )
    }

    pub fn with_parts(
        kv: Arc<dyn KeyValueStore>,
        session_store: Box<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let store = IdentityStore::new(kv.clone());
        let limiter = Arc::new(AttemptLimiter::new(store.clone(), clock.clone(), &config));
        let sessions = Arc::new(SessionManager::new(
            session_store,
            limiter.clone(),
            store.clone(),
            clock.clone(),
            config.default_lock_timeout_minutes,
            config.sliding_expiry,
        ));
        let scoped = ScopedNamespace::new(kv, sessions.clone());
        Ok(Self {
            config,
            store,
            limiter,
            sessions,
            scoped,
            clock,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn scoped(&self) -> &ScopedNamespace {
        &self.scoped
    }

    // ── Catalogue ────────────────────────────────────────────────────────────

    /// Create an identity protected by `pin`. The new identity is not
    /// unlocked.
    pub async fn create(&self, new: NewIdentity, pin: &str) -> Result<IdentityRecord> {
        validate_pin(pin)?;
        let handle = validate_handle(&new.handle)?;

        let id = generate_identity_id();
        let salt = generate_salt().to_vec();
        let params = self.config.kdf_params();
        let key = derive_key_off_thread(pin, salt.clone(), params).await?;

        let payload = VaultPayload::generate(Profile {
            handle: handle.clone(),
            icon: new.icon.clone(),
            color: new.color.clone(),
        });
        let blob = vault::seal(&payload, &key)?;

        let record = IdentityRecord {
            id: id.clone(),
            handle,
            icon: new.icon,
            color: new.color,
            created_at: self.clock.now(),
            doc_count: 0,
            salt,
            pin_verifier: verifier_for_key(&key).to_vec(),
            attempt_count: 0,
            attempt_reset_at: None,
            kdf: params.algorithm,
            kdf_iterations: params.iterations,
        };

        self.store.put_blob(&id, &blob)?;
        if let Err(e) = self.store.insert(record.clone()) {
            if let Err(cleanup) = self.store.remove_blob(&id) {
                warn!(identity_id = %id, error = %cleanup, "failed to remove orphaned vault blob");
            }
            return Err(e);
        }
        info!(identity_id = %id, public_key = %payload.public_key_hex(), "identity created");
        Ok(record)
    }

    pub fn list(&self) -> Vec<IdentityRecord> {
        self.store.list()
    }

    pub fn get(&self, id: &str) -> Result<IdentityRecord> {
        self.store
            .get(id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))
    }

    pub fn remaining_attempts(&self, id: &str) -> Result<u32> {
        self.limiter.remaining_attempts(id)
    }

    pub fn update_profile(&self, id: &str, update: ProfileUpdate) -> Result<IdentityRecord> {
        let handle = update.handle.as_deref().map(validate_handle).transpose()?;
        let patch = IdentityPatch {
            handle,
            icon: update.icon,
            color: update.color,
            ..Default::default()
        };
        if !self.store.update_fields(id, patch)? {
            return Err(VaultError::NotFound(id.to_string()));
        }
        self.get(id)
    }

    pub fn set_doc_count(&self, id: &str, count: u32) -> Result<()> {
        let patch = IdentityPatch {
            doc_count: Some(count),
            ..Default::default()
        };
        if !self.store.update_fields(id, patch)? {
            return Err(VaultError::NotFound(id.to_string()));
        }
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Verify `pin`, open the vault and start a session for `id`.
    pub async fn unlock(&self, id: &str, pin: &str) -> Result<UnlockedIdentity> {
        let unlocked = match self.sessions.unlock(id, pin).await {
            Ok(unlocked) => unlocked,
            Err(e) => return Err(self.after_failure(id, e)),
        };
        let payload = match self.open_blob(id, &unlocked.key) {
            Ok(payload) => payload,
            Err(e) => {
                self.sessions.lock();
                return Err(e);
            }
        };

        let mut persist_error = unlocked.persist_error;
        if let Err(e) = self.store.set_active_identity(Some(id)) {
            warn!(identity_id = %id, error = %e, "failed to persist active identity");
            persist_error.get_or_insert(e);
        }
        let record = self.get(id)?;
        Ok(UnlockedIdentity {
            record,
            payload,
            session: unlocked.info,
            persist_error,
        })
    }

    pub fn current_key(&self) -> Option<ActiveKey> {
        self.sessions.current_key()
    }

    pub fn is_unlocked(&self) -> bool {
        self.sessions.session_info().is_some()
    }

    pub fn refresh(&self) -> bool {
        self.sessions.refresh()
    }

    pub fn lock(&self) {
        self.sessions.lock();
    }

    /// Decrypt the vault of the live session.
    pub fn open_vault(&self) -> Result<VaultPayload> {
        let active = self.sessions.current_key().ok_or(VaultError::NoSession)?;
        self.open_blob(&active.identity_id, &active.key)
    }

    // ── PIN and lifecycle ────────────────────────────────────────────────────

    /// Re-seal the vault under `new_pin`. A wrong `old_pin` counts towards
    /// lockout like any other attempt.
    pub async fn change_pin(&self, id: &str, old_pin: &str, new_pin: &str) -> Result<()> {
        validate_pin(new_pin)?;
        let _guard = self.limiter.acquire(id).await;
        let verified = match self.limiter.verify_locked(id, old_pin).await {
            Ok(verified) => verified,
            Err(e) => return Err(self.after_failure(id, e)),
        };
        let payload = self.open_blob(id, &verified.key)?;
        let record = self.get(id)?;

        let new_key = derive_key_off_thread(new_pin, record.salt.clone(), record.kdf_params()).await?;
        let new_blob = vault::seal(&payload, &new_key)?;
        let old_blob = self.store.blob(id)?.ok_or(VaultError::CorruptVault)?;

        self.store.put_blob(id, &new_blob)?;
        let patch = IdentityPatch {
            pin_verifier: Some(verifier_for_key(&new_key).to_vec()),
            ..Default::default()
        };
        if let Err(e) = self.store.update_fields(id, patch) {
            if let Err(restore) = self.store.put_blob(id, &old_blob) {
                warn!(identity_id = %id, error = %restore, "failed to restore vault after pin change error");
            }
            return Err(e);
        }

        self.sessions.rekey(id, new_key);
        info!(identity_id = %id, "pin changed");
        Ok(())
    }

    /// Remove `id` and everything stored for it.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.limiter.acquire(id).await;
        if !self.store.purge(id)? {
            return Err(VaultError::NotFound(id.to_string()));
        }
        self.limiter.release(id);
        self.discard_session_state(id);
        info!(identity_id = %id, "identity deleted");
        Ok(())
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    pub fn lock_timeout(&self) -> u32 {
        self.store.lock_timeout(self.config.default_lock_timeout_minutes)
    }

    /// Applies to sessions started after the change.
    pub fn set_lock_timeout(&self, minutes: u32) -> Result<()> {
        self.store.set_lock_timeout(minutes)
    }

    pub fn active_identity_id(&self) -> Option<String> {
        self.store.active_identity()
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn open_blob(&self, id: &str, key: &DerivedKey) -> Result<VaultPayload> {
        let blob = self.store.blob(id)?.ok_or(VaultError::CorruptVault)?;
        vault::open(&blob, key).map_err(|e| {
            warn!(identity_id = %id, "vault failed to open with a verified key");
            e
        })
    }

    fn after_failure(&self, id: &str, error: VaultError) -> VaultError {
        if error == VaultError::Destroyed {
            self.discard_session_state(id);
        }
        error
    }

    fn discard_session_state(&self, id: &str) {
        self.sessions.lock_identity(id);
        self.scoped.forget(id);
    }
}

fn validate_handle(handle: &str) -> Result<String> {
    let trimmed = handle.trim();
    if trimmed.is_empty() {
        return Err(VaultError::InvalidHandle);
    }
    Ok(trimmed.to_string())
}
