//! Brute-force lockout for PIN verification.
//!
//! Per identity: `attempt_count == 0` is clean, `0 < attempt_count < max` is
//! attempting, and reaching `max` destroys the identity. The first failure in
//! a clean window opens a window of `attempt_window`; later failures do not
//! extend it. Once the window has elapsed the count starts over.
//!
//! Every attempt is written to storage before the PIN is checked, so a store
//! that rejects writes refuses verification instead of allowing uncounted
//! guesses. The charge → derive → refund sequence suspends during key
//! derivation; every mutation for one identity runs under a per-identity
//! single-flight guard.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::crypto::{constant_time_eq, derive_key, verifier_for_key, DerivedKey, KdfParams};
use crate::error::{Result, VaultError};
use crate::identity::{IdentityPatch, IdentityRecord, IdentityStore};

pub const PIN_MIN_LEN: usize = 6;
pub const PIN_MAX_LEN: usize = 12;

/// Reject anything that is not 6 to 12 ASCII digits.
pub fn validate_pin(pin: &str) -> Result<()> {
    let ok = (PIN_MIN_LEN..=PIN_MAX_LEN).contains(&pin.len())
        && pin.bytes().all(|b| b.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(VaultError::InvalidPin {
            min: PIN_MIN_LEN,
            max: PIN_MAX_LEN,
        })
    }
}

/// Run the KDF on the blocking pool. The caller can abandon the future, but
/// the derivation itself runs to completion.
pub async fn derive_key_off_thread(
    pin: &str,
    salt: Vec<u8>,
    params: KdfParams,
) -> Result<DerivedKey> {
    let pin = Zeroizing::new(pin.to_owned());
    tokio::task::spawn_blocking(move || derive_key(&pin, &salt, &params))
        .await
        .map_err(|e| VaultError::Crypto(format!("key derivation task: {e}")))?
}

/// Successful verification.
#[derive(Debug)]
pub struct Verified {
    pub key: DerivedKey,
    /// Set when the counter reset could not be persisted. The key is still
    /// valid; the failure is surfaced so the application can report it.
    pub persist_error: Option<VaultError>,
}

pub struct AttemptLimiter {
    store: IdentityStore,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    window: Duration,
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AttemptLimiter {
    pub fn new(store: IdentityStore, clock: Arc<dyn Clock>, config: &CoreConfig) -> Self {
        Self {
            store,
            clock,
            max_attempts: config.max_attempts,
            window: config.attempt_window(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Acquire the single-flight guard for `id`. Held across every
    /// load-mutate-save of that identity's counters.
    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.in_flight.lock();
            map.entry(id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    fn window_elapsed(record: &IdentityRecord, now: DateTime<Utc>) -> bool {
        matches!(record.attempt_reset_at, Some(reset_at) if now >= reset_at)
    }

    /// Attempts counted against `record` at `now`. A record at the threshold
    /// stays there whatever the window says.
    fn effective_count(&self, record: &IdentityRecord, now: DateTime<Utc>) -> u32 {
        if record.attempt_count >= self.max_attempts {
            record.attempt_count
        } else if Self::window_elapsed(record, now) {
            0
        } else {
            record.attempt_count
        }
    }

    /// Attempts left before destruction. Never mutates state.
    pub fn remaining_attempts(&self, id: &str) -> Result<u32> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;
        let used = self.effective_count(&record, self.clock.now());
        Ok(self.max_attempts.saturating_sub(used))
    }

    /// Check `pin` for `id`, updating the counters.
    pub async fn verify(&self, id: &str, pin: &str) -> Result<Verified> {
        let _guard = self.acquire(id).await;
        self.verify_locked(id, pin).await
    }

    /// `verify` for callers that already hold the guard from `acquire`.
    ///
    /// The attempt is charged durably before the key is derived and refunded
    /// on a match. If the charge cannot be written the PIN is not checked.
    pub async fn verify_locked(&self, id: &str, pin: &str) -> Result<Verified> {
        validate_pin(pin)?;
        let record = self
            .store
            .get(id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;

        let now = self.clock.now();
        let used = self.effective_count(&record, now);
        if used >= self.max_attempts {
            return Err(self.destroy(id)?);
        }

        let charged = used + 1;
        let reset_at = match record.attempt_reset_at {
            Some(reset_at) if !Self::window_elapsed(&record, now) => reset_at,
            _ => now + self.window,
        };
        let charge = IdentityPatch {
            attempt_count: Some(charged),
            attempt_reset_at: Some(Some(reset_at)),
            ..Default::default()
        };
        if let Err(e) = self.store.update_fields(id, charge) {
            warn!(identity_id = %id, error = %e, "cannot record attempt, refusing verification");
            return Err(e);
        }

        let key = derive_key_off_thread(pin, record.salt.clone(), record.kdf_params()).await?;
        if constant_time_eq(&verifier_for_key(&key), &record.pin_verifier) {
            let reset = IdentityPatch {
                attempt_count: Some(0),
                attempt_reset_at: Some(None),
                ..Default::default()
            };
            let persist_error = match self.store.update_fields(id, reset) {
                Ok(_) => None,
                Err(e) => {
                    warn!(identity_id = %id, error = %e, "failed to persist attempt reset");
                    Some(e)
                }
            };
            debug!(identity_id = %id, "pin verified");
            return Ok(Verified { key, persist_error });
        }

        if charged >= self.max_attempts {
            return Err(self.destroy(id)?);
        }
        let remaining = self.max_attempts - charged;
        warn!(identity_id = %id, remaining, "wrong pin");
        Err(VaultError::WrongPin { remaining })
    }

    /// Lockout: remove the identity and hand back the error to return.
    ///
    /// Fails only if the index entry could not be removed; the record then
    /// stays at the threshold and every later verification retries here.
    fn destroy(&self, id: &str) -> Result<VaultError> {
        error!(identity_id = %id, max_attempts = self.max_attempts, "pin attempts exhausted, destroying identity");
        let pinned = IdentityPatch {
            attempt_count: Some(self.max_attempts),
            attempt_reset_at: Some(None),
            ..Default::default()
        };
        if let Err(e) = self.store.update_fields(id, pinned) {
            warn!(identity_id = %id, error = %e, "failed to record exhausted attempts");
        }
        if let Err(e) = self.store.purge(id) {
            error!(identity_id = %id, error = %e, "failed to remove identity after lockout");
            return Err(e);
        }
        self.release(id);
        Ok(VaultError::Destroyed)
    }

    /// Drop the single-flight slot of an identity that no longer exists.
    pub fn release(&self, id: &str) {
        self.in_flight.lock().remove(id);
    }

    #[cfg(test)]
    pub(crate) fn tracked_identities(&self) -> usize {
        self.in_flight.lock().len()
    }
}
