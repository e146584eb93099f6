//! Authenticated encryption of an identity's private payload.
//!
//! Blob format (stored as standard base64):
//!   [ nonce (24 bytes) | XChaCha20-Poly1305 ciphertext + tag ]
//!
//! A fresh random nonce is drawn for every seal. `open` has exactly one
//! failure outcome, `CorruptVault`, whether the key is wrong or the bytes are
//! damaged.

use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{generate_signing_key, random_array, DerivedKey, NONCE_LEN};
use crate::encoding::fixed_bytes;
use crate::error::{Result, VaultError};

pub const VAULT_PAYLOAD_VERSION: u32 = 1;
const VAULT_AAD: &[u8] = b"persona-vault-v1";
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Zeroize)]
pub struct Profile {
    pub handle: String,
    pub icon: String,
    pub color: String,
}

/// Secret contents of one identity's vault. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct VaultPayload {
    pub version: u32,
    #[serde(with = "fixed_bytes")]
    pub signing_key: [u8; 32],
    #[serde(with = "fixed_bytes")]
    pub public_key: [u8; 32],
    #[serde(with = "fixed_bytes")]
    pub recovery_secret: [u8; 32],
    pub profile: Profile,
}

impl VaultPayload {
    /// Fresh Ed25519 keypair and recovery secret for a new identity.
    pub fn generate(profile: Profile) -> Self {
        let signing = generate_signing_key();
        Self {
            version: VAULT_PAYLOAD_VERSION,
            signing_key: signing.to_bytes(),
            public_key: signing.verifying_key().to_bytes(),
            recovery_secret: random_array(),
            profile,
        }
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.signing_key)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.public_key).map_err(|_| VaultError::CorruptVault)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    fn is_consistent(&self) -> bool {
        self.signing_key().verifying_key().to_bytes() == self.public_key
    }
}

impl fmt::Debug for VaultPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultPayload")
            .field("version", &self.version)
            .field("public_key", &self.public_key_hex())
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// Encrypt `payload` under `key` and return the base64 blob.
pub fn seal(payload: &VaultPayload, key: &DerivedKey) -> Result<String> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(payload).map_err(|e| VaultError::Crypto(format!("encode: {e}")))?,
    );
    seal_bytes(&plaintext, key.as_bytes(), VAULT_AAD)
}

/// Decrypt a blob produced by `seal`.
pub fn open(blob: &str, key: &DerivedKey) -> Result<VaultPayload> {
    let plaintext = open_bytes(blob, key.as_bytes(), VAULT_AAD)?;
    let payload: VaultPayload =
        serde_json::from_slice(&plaintext).map_err(|_| VaultError::CorruptVault)?;
    if !payload.is_consistent() {
        return Err(VaultError::CorruptVault);
    }
    Ok(payload)
}

/// `base64(nonce || ciphertext+tag)` with a fresh random nonce.
pub(crate) fn seal_bytes(plaintext: &[u8], key: &[u8; 32], aad: &[u8]) -> Result<String> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| VaultError::Crypto("invalid key length".into()))?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::Crypto("encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(general_purpose::STANDARD.encode(out))
}

/// Inverse of `seal_bytes`. Every failure is `CorruptVault`.
pub(crate) fn open_bytes(blob: &str, key: &[u8; 32], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let data = general_purpose::STANDARD
        .decode(blob.trim())
        .map_err(|_| VaultError::CorruptVault)?;
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(VaultError::CorruptVault);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| VaultError::CorruptVault)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce_bytes), Payload { msg: ct, aad })
        .map_err(|_| VaultError::CorruptVault)?;
    Ok(Zeroizing::new(plaintext))
}
