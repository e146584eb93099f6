//! Low-level primitives shared by every other module.
//!
//! - `derive_key`       PBKDF2-HMAC-SHA256 or iterated SHA-256 PIN stretching
//! - `pin_verifier`     one-way, storable fingerprint of the derived key
//! - `constant_time_eq` comparison that does not leak the first mismatch
//! - `secure_erase`     best-effort multi-pass wipe of secret buffers
//! - `random_bytes`     OS CSPRNG output for salts, nonces, ids and keys

use std::fmt;
use std::sync::atomic::{compiler_fence, Ordering};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, VaultError};

pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
pub const IDENTITY_ID_LEN: usize = 16;

/// PBKDF2 iteration count for newly created identities.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
/// Round count for the iterated SHA-256 derivation.
pub const FALLBACK_HASH_ROUNDS: u32 = 100_000;
/// Floor accepted by configuration validation.
pub const MIN_KDF_ITERATIONS: u32 = 1_000;

const VERIFIER_DOMAIN: &[u8] = b"persona-pin-verifier-v1";

// ── KDF parameters ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    #[default]
    Pbkdf2Sha256,
    IteratedSha256,
}

/// Derivation parameters, recorded per identity at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2Sha256,
            iterations: PBKDF2_ITERATIONS,
        }
    }
}

// ── Derived key ──────────────────────────────────────────────────────────────

/// 32-byte key stretched from a PIN. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; DERIVED_KEY_LEN]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; DERIVED_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_LEN] {
        &self.0
    }

    /// Multi-pass wipe in place. The value is unusable afterwards.
    pub fn erase(&mut self) {
        secure_erase(&mut self.0);
    }
}

impl PartialEq for DerivedKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for DerivedKey {}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Stretch `pin` with `salt`. Deterministic for identical inputs.
///
/// CPU-bound; async callers run it on the blocking pool.
pub fn derive_key(pin: &str, salt: &[u8], params: &KdfParams) -> Result<DerivedKey> {
    if params.iterations == 0 {
        return Err(VaultError::Crypto("kdf iterations must be non-zero".into()));
    }
    let mut out = [0u8; DERIVED_KEY_LEN];
    match params.algorithm {
        KdfAlgorithm::Pbkdf2Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(pin.as_bytes(), salt, params.iterations, &mut out);
        }
        KdfAlgorithm::IteratedSha256 => {
            let mut state = Zeroizing::new([0u8; 32]);
            let mut hasher = Sha256::new();
            hasher.update(salt);
            hasher.update(pin.as_bytes());
            state.copy_from_slice(&hasher.finalize());
            for _ in 0..params.iterations {
                let mut hasher = Sha256::new();
                hasher.update(&state[..]);
                hasher.update(salt);
                state.copy_from_slice(&hasher.finalize());
            }
            out.copy_from_slice(&state[..]);
        }
    }
    let key = DerivedKey(out);
    out.zeroize();
    Ok(key)
}

/// Storable verifier for an already derived key.
///
/// Hashing diverges from the encryption key after the shared KDF step, so a
/// leaked verifier does not yield the vault key.
pub fn verifier_for_key(key: &DerivedKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(VERIFIER_DOMAIN);
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

pub fn pin_verifier(pin: &str, salt: &[u8], params: &KdfParams) -> Result<[u8; 32]> {
    let key = derive_key(pin, salt, params)?;
    Ok(verifier_for_key(&key))
}

// ── Comparison and erasure ───────────────────────────────────────────────────

fn fold_diff(a: &[u8], b: &[u8]) -> u8 {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff
}

/// Constant-time comparison to prevent timing side channels.
///
/// A length mismatch still walks a full-length dummy comparison before
/// returning false.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        std::hint::black_box(fold_diff(a, a));
        return false;
    }
    std::hint::black_box(fold_diff(a, b)) == 0
}

/// Overwrite `buf` with random bytes, 0xFF, then zeros.
///
/// Best effort only: copies the allocator or the compiler made earlier are
/// out of reach. Prefer `ZeroizeOnDrop` types for anything long-lived.
pub fn secure_erase(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
    std::hint::black_box(&*buf);
    buf.iter_mut().for_each(|b| *b = 0xFF);
    std::hint::black_box(&*buf);
    compiler_fence(Ordering::SeqCst);
    buf.zeroize();
}

// ── Randomness ───────────────────────────────────────────────────────────────

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    random_array()
}

pub fn generate_identity_id() -> String {
    hex::encode(random_array::<IDENTITY_ID_LEN>())
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}
