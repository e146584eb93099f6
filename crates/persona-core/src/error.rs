use thiserror::Error;

/// Every failure the vault and session layer can surface.
///
/// Variants never carry PINs, keys, salts or verifiers. `CorruptVault` covers
/// both a wrong key and damaged ciphertext.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("PIN must be {min} to {max} digits")]
    InvalidPin { min: usize, max: usize },

    #[error("Handle must not be empty")]
    InvalidHandle,

    #[error("Identity not found: {0}")]
    NotFound(String),

    #[error("Wrong PIN ({remaining} attempts remaining)")]
    WrongPin { remaining: u32 },

    #[error("Identity destroyed after too many failed PIN attempts")]
    Destroyed,

    #[error("No active session; unlock an identity first")]
    NoSession,

    #[error("Vault could not be opened")]
    CorruptVault,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl VaultError {
    /// True for outcomes that should send the user back to onboarding
    /// instead of re-prompting for a PIN.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VaultError::Destroyed | VaultError::NotFound(_))
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::StorageUnavailable(format!("serialisation: {e}"))
    }
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        VaultError::StorageUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
