//! Ephemeral possession of a decrypted vault key.
//!
//! At most one session exists per `SessionManager`. It never touches durable
//! storage. Expiry is checked lazily on read: there is no background timer,
//! and a caller that copied the key before expiry keeps its copy.
//!
//! Backends:
//! - `VolatileSessionStore`: primary; a cloneable process-local handle that
//!   keeps the record sealed under a random per-store wrapping key
//! - `MemorySessionStore`: pure in-memory fallback holding the typed record
//! - `FallbackSessionStore`: routes to the fallback once the primary fails
//!
//! Timeout and clear semantics live in `SessionManager`, so a backend failure
//! can never switch expiry off.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::clock::Clock;
use crate::crypto::{random_array, DerivedKey, DERIVED_KEY_LEN};
use crate::encoding::fixed_bytes;
use crate::error::{Result, VaultError};
use crate::identity::IdentityStore;
use crate::limiter::AttemptLimiter;
use crate::vault::{open_bytes, seal_bytes};

const SESSION_AAD: &[u8] = b"persona-session-v1";

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Session {
    pub identity_id: String,
    key: DerivedKey,
    pub unlocked_at: DateTime<Utc>,
    pub timeout_minutes: u32,
}

impl Session {
    pub fn new(identity_id: String, key: DerivedKey, unlocked_at: DateTime<Utc>, timeout_minutes: u32) -> Self {
        Self {
            identity_id,
            key,
            unlocked_at,
            timeout_minutes,
        }
    }

    pub fn key(&self) -> &DerivedKey {
        &self.key
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.unlocked_at + Duration::minutes(i64::from(self.timeout_minutes))
    }

    /// Valid while `now - unlocked_at < timeout`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.unlocked_at >= Duration::minutes(i64::from(self.timeout_minutes))
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            identity_id: self.identity_id.clone(),
            unlocked_at: self.unlocked_at,
            timeout_minutes: self.timeout_minutes,
            expires_at: self.expires_at(),
        }
    }

    /// Scrub the key bytes in place.
    pub fn erase(&mut self) {
        self.key.erase();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity_id", &self.identity_id)
            .field("unlocked_at", &self.unlocked_at)
            .field("timeout_minutes", &self.timeout_minutes)
            .finish_non_exhaustive()
    }
}

/// Non-secret view of the live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub identity_id: String,
    pub unlocked_at: DateTime<Utc>,
    pub timeout_minutes: u32,
    pub expires_at: DateTime<Utc>,
}

/// What `current_key` hands out.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub identity_id: String,
    pub key: DerivedKey,
}

// ── Backends ─────────────────────────────────────────────────────────────────

pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<Session>>;
    fn save(&self, session: &Session) -> Result<()>;
    /// Remove the session, scrubbing any key bytes the backend holds.
    fn clear(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Session>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, session: &Session) -> Result<()> {
        let mut slot = self.slot.lock();
        if let Some(mut old) = slot.take() {
            old.erase();
        }
        *slot = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if let Some(mut old) = self.slot.lock().take() {
            old.erase();
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SessionRecord {
    identity_id: String,
    #[serde(with = "fixed_bytes")]
    key: [u8; DERIVED_KEY_LEN],
    #[zeroize(skip)]
    unlocked_at: DateTime<Utc>,
    timeout_minutes: u32,
}

/// Process-local session slot shared by every clone of the handle.
///
/// The record is held as an XChaCha20-Poly1305 blob under a wrapping key that
/// never leaves this process; the raw key only exists in the clear inside the
/// `Session` values returned from `load`.
#[derive(Clone)]
pub struct VolatileSessionStore {
    sealed: Arc<Mutex<Option<String>>>,
    wrap_key: Arc<Zeroizing<[u8; 32]>>,
}

impl VolatileSessionStore {
    pub fn new() -> Self {
        Self {
            sealed: Arc::new(Mutex::new(None)),
            wrap_key: Arc::new(Zeroizing::new(random_array())),
        }
    }
}

impl Default for VolatileSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for VolatileSessionStore {
    fn load(&self) -> Result<Option<Session>> {
        let sealed = self.sealed.lock();
        let Some(blob) = sealed.as_deref() else {
            return Ok(None);
        };
        let plaintext = open_bytes(blob, &self.wrap_key, SESSION_AAD)
            .map_err(|_| VaultError::StorageUnavailable("session record unreadable".into()))?;
        let record: SessionRecord = serde_json::from_slice(&plaintext)
            .map_err(|_| VaultError::StorageUnavailable("session record unreadable".into()))?;
        Ok(Some(Session::new(
            record.identity_id.clone(),
            DerivedKey::from_bytes(record.key),
            record.unlocked_at,
            record.timeout_minutes,
        )))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let record = SessionRecord {
            identity_id: session.identity_id.clone(),
            key: *session.key().as_bytes(),
            unlocked_at: session.unlocked_at,
            timeout_minutes: session.timeout_minutes,
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&record)?);
        let blob = seal_bytes(&plaintext, &self.wrap_key, SESSION_AAD)?;
        *self.sealed.lock() = Some(blob);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.sealed.lock().take();
        Ok(())
    }
}

/// Uses `primary` until it fails once, then the in-memory fallback for the
/// rest of the process.
pub struct FallbackSessionStore {
    primary: Box<dyn SessionStore>,
    fallback: MemorySessionStore,
    degraded: AtomicBool,
}

impl FallbackSessionStore {
    pub fn new(primary: Box<dyn SessionStore>) -> Self {
        Self {
            primary,
            fallback: MemorySessionStore::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn degrade(&self, op: &str, error: &VaultError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(op, error = %error, "session store unavailable, falling back to memory");
        }
        // Whatever the primary still holds is no longer authoritative.
        if let Err(e) = self.primary.clear() {
            debug!(error = %e, "could not clear degraded session store");
        }
    }
}

impl SessionStore for FallbackSessionStore {
    fn load(&self) -> Result<Option<Session>> {
        if !self.is_degraded() {
            match self.primary.load() {
                Ok(session) => return Ok(session),
                Err(e) => self.degrade("load", &e),
            }
        }
        self.fallback.load()
    }

    fn save(&self, session: &Session) -> Result<()> {
        if !self.is_degraded() {
            match self.primary.save(session) {
                Ok(()) => return Ok(()),
                Err(e) => self.degrade("save", &e),
            }
        }
        self.fallback.save(session)
    }

    fn clear(&self) -> Result<()> {
        if let Err(e) = self.primary.clear() {
            if !self.is_degraded() {
                self.degrade("clear", &e);
            }
        }
        self.fallback.clear()
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Result of a successful `SessionManager::unlock`.
#[derive(Debug)]
pub struct Unlocked {
    pub info: SessionInfo,
    pub key: DerivedKey,
    /// Counter reset that could not be persisted; the session is live anyway.
    pub persist_error: Option<VaultError>,
}

pub struct SessionManager {
    store: FallbackSessionStore,
    limiter: Arc<AttemptLimiter>,
    identities: IdentityStore,
    clock: Arc<dyn Clock>,
    default_timeout_minutes: u32,
    sliding_expiry: bool,
}

impl SessionManager {
    pub fn new(
        primary: Box<dyn SessionStore>,
        limiter: Arc<AttemptLimiter>,
        identities: IdentityStore,
        clock: Arc<dyn Clock>,
        default_timeout_minutes: u32,
        sliding_expiry: bool,
    ) -> Self {
        Self {
            store: FallbackSessionStore::new(primary),
            limiter,
            identities,
            clock,
            default_timeout_minutes,
            sliding_expiry,
        }
    }

    pub fn limiter(&self) -> &Arc<AttemptLimiter> {
        &self.limiter
    }

    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    /// Derive, verify through the attempt limiter, and start a session.
    ///
    /// Wrong PIN and lockout outcomes from the limiter propagate unchanged.
    pub async fn unlock(&self, id: &str, pin: &str) -> Result<Unlocked> {
        let verified = self.limiter.verify(id, pin).await?;
        let info = self.start(id, verified.key.clone())?;
        Ok(Unlocked {
            info,
            key: verified.key,
            persist_error: verified.persist_error,
        })
    }

    /// Install a session for `id` with an already verified key, replacing
    /// (and scrubbing) any previous one.
    pub fn start(&self, id: &str, key: DerivedKey) -> Result<SessionInfo> {
        let timeout = self.identities.lock_timeout(self.default_timeout_minutes);
        let session = Session::new(id.to_string(), key, self.clock.now(), timeout);
        self.store.clear()?;
        self.store.save(&session)?;
        info!(identity_id = %id, timeout_minutes = timeout, "session started");
        Ok(session.info())
    }

    /// Live, unexpired session, clearing it as a side effect once expired.
    fn live_session(&self) -> Option<Session> {
        let session = match self.store.load() {
            Ok(session) => session?,
            Err(e) => {
                warn!(error = %e, "session unreadable, treating as locked");
                return None;
            }
        };
        if session.is_expired(self.clock.now()) {
            info!(identity_id = %session.identity_id, "session expired");
            self.clear_quietly();
            return None;
        }
        Some(session)
    }

    /// The key of the live session, if any.
    pub fn current_key(&self) -> Option<ActiveKey> {
        let mut session = self.live_session()?;
        if self.sliding_expiry {
            session.unlocked_at = self.clock.now();
            if let Err(e) = self.store.save(&session) {
                warn!(error = %e, "failed to slide session expiry");
            }
        }
        Some(ActiveKey {
            identity_id: session.identity_id.clone(),
            key: session.key().clone(),
        })
    }

    pub fn current_identity(&self) -> Option<String> {
        self.live_session().map(|s| s.identity_id.clone())
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.live_session().map(|s| s.info())
    }

    /// Slide `unlocked_at` to now. Returns false when there is nothing live
    /// to refresh.
    pub fn refresh(&self) -> bool {
        let Some(mut session) = self.live_session() else {
            return false;
        };
        session.unlocked_at = self.clock.now();
        match self.store.save(&session) {
            Ok(()) => {
                debug!(identity_id = %session.identity_id, "session refreshed");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to refresh session");
                false
            }
        }
    }

    /// Replace the key of a live session for `id` (after a PIN change).
    pub fn rekey(&self, id: &str, key: DerivedKey) {
        if let Some(mut session) = self.live_session().filter(|s| s.identity_id == id) {
            session.key = key;
            if let Err(e) = self.store.save(&session) {
                warn!(identity_id = %id, error = %e, "failed to re-key session");
            }
        }
    }

    /// Explicit logout. Key bytes are scrubbed by the backend.
    pub fn lock(&self) {
        if let Ok(Some(session)) = self.store.load() {
            info!(identity_id = %session.identity_id, "session locked");
        }
        self.clear_quietly();
    }

    /// Lock only if the live session belongs to `id`.
    pub fn lock_identity(&self, id: &str) {
        if let Ok(Some(session)) = self.store.load() {
            if session.identity_id == id {
                self.lock();
            }
        }
    }

    fn clear_quietly(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear session");
        }
    }
}
