//! persona-core: device-local identity vault and session manager
//!
//! # Design principles
//! - Every identity is an isolated persona: its own keypair, handle and PIN.
//! - Secrets live encrypted at rest and only in volatile memory when unlocked.
//! - Key types zeroize on drop; comparisons on secrets are constant time.
//! - Too many wrong PINs destroy the identity; there is no recovery path.
//!
//! # Module layout
//! - `crypto`    PIN key derivation, verifiers, constant-time compare, RNG
//! - `identity`  durable identity index, vault blobs and settings
//! - `vault`     XChaCha20-Poly1305 sealing of the private payload
//! - `limiter`   per-identity attempt counting and lockout
//! - `session`   time-bounded session with pluggable volatile backends
//! - `scoped`    per-identity key-value namespace
//! - `manager`   `IdentityManager` facade composing all of the above
//! - `storage`   key-value backends (memory, JSON file)
//! - `config`    tunable costs and limits
//! - `clock`     injectable time source
//! - `encoding`  serde helpers for byte fields
//! - `paths`     per-user data locations
//! - `error`     unified error type

pub mod clock;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod manager;
pub mod paths;
pub mod scoped;
pub mod session;
pub mod storage;
pub mod vault;

pub use config::CoreConfig;
pub use error::{Result, VaultError};
pub use identity::IdentityRecord;
pub use manager::{IdentityManager, NewIdentity, ProfileUpdate, UnlockedIdentity};
pub use scoped::ScopedNamespace;
pub use session::{ActiveKey, SessionInfo, SessionManager, SessionStore};
pub use vault::{Profile, VaultPayload};
