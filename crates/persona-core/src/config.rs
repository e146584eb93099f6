use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::{
    KdfAlgorithm, KdfParams, FALLBACK_HASH_ROUNDS, MIN_KDF_ITERATIONS, PBKDF2_ITERATIONS,
};
use crate::error::{Result, VaultError};
use crate::storage::DEFAULT_QUOTA_BYTES;

/// Failed PIN submissions inside one window before the identity is destroyed.
pub const MAX_PIN_ATTEMPTS: u32 = 10;
/// Length of the rolling attempt window, opened by the first failure.
pub const ATTEMPT_WINDOW_SECS: i64 = 60 * 60;
pub const DEFAULT_LOCK_TIMEOUT_MINUTES: u32 = 15;
pub const MAX_LOCK_TIMEOUT_MINUTES: u32 = 24 * 60;

/// Tunable security and storage parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoreConfig {
    pub kdf: KdfAlgorithm,
    pub kdf_iterations: u32,
    pub fallback_rounds: u32,
    pub max_attempts: u32,
    pub attempt_window_secs: i64,
    pub default_lock_timeout_minutes: u32,
    /// When set, every successful `current_key` read also slides the session.
    pub sliding_expiry: bool,
    /// 0 disables the quota.
    pub storage_quota_bytes: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            kdf: KdfAlgorithm::Pbkdf2Sha256,
            kdf_iterations: PBKDF2_ITERATIONS,
            fallback_rounds: FALLBACK_HASH_ROUNDS,
            max_attempts: MAX_PIN_ATTEMPTS,
            attempt_window_secs: ATTEMPT_WINDOW_SECS,
            default_lock_timeout_minutes: DEFAULT_LOCK_TIMEOUT_MINUTES,
            sliding_expiry: false,
            storage_quota_bytes: DEFAULT_QUOTA_BYTES,
        }
    }
}

impl CoreConfig {
    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                VaultError::InvalidConfig(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(VaultError::InvalidConfig(format!(
                "kdf_iterations must be at least {MIN_KDF_ITERATIONS}"
            )));
        }
        if self.fallback_rounds < MIN_KDF_ITERATIONS {
            return Err(VaultError::InvalidConfig(format!(
                "fallback_rounds must be at least {MIN_KDF_ITERATIONS}"
            )));
        }
        if self.max_attempts == 0 {
            return Err(VaultError::InvalidConfig("max_attempts must be non-zero".into()));
        }
        if self.attempt_window_secs <= 0 {
            return Err(VaultError::InvalidConfig(
                "attempt_window_secs must be positive".into(),
            ));
        }
        validate_lock_timeout(self.default_lock_timeout_minutes)?;
        if self.kdf_iterations < PBKDF2_ITERATIONS || self.fallback_rounds < FALLBACK_HASH_ROUNDS {
            warn!(
                kdf_iterations = self.kdf_iterations,
                fallback_rounds = self.fallback_rounds,
                "key derivation cost below recommended minimum"
            );
        }
        Ok(())
    }

    /// Parameters used for identities created under this config.
    pub fn kdf_params(&self) -> KdfParams {
        let iterations = match self.kdf {
            KdfAlgorithm::Pbkdf2Sha256 => self.kdf_iterations,
            KdfAlgorithm::IteratedSha256 => self.fallback_rounds,
        };
        KdfParams {
            algorithm: self.kdf,
            iterations,
        }
    }

    pub fn attempt_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.attempt_window_secs)
    }
}

pub fn validate_lock_timeout(minutes: u32) -> Result<()> {
    if minutes == 0 || minutes > MAX_LOCK_TIMEOUT_MINUTES {
        return Err(VaultError::InvalidConfig(format!(
            "lock timeout must be between 1 and {MAX_LOCK_TIMEOUT_MINUTES} minutes"
        )));
    }
    Ok(())
}
