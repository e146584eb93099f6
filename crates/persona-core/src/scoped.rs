//! Per-identity key-value partition for consumer state.
//!
//! Keys are namespaced by the identity of the live session. With no live
//! session they land in a separate unscoped space, used before any identity
//! exists (or after the session expired).
//!
//! A write that cannot be persisted stays visible in memory for the rest of
//! the process; the error is logged and returned so the caller can report
//! lost durability.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::identity::{scoped_prefix, UNSCOPED_KEY_PREFIX};
use crate::session::SessionManager;
use crate::storage::KeyValueStore;

/// Durable key for `key` under `identity_id`, or the unscoped key when none.
pub fn namespaced_key(identity_id: Option<&str>, key: &str) -> String {
    match identity_id {
        Some(id) => format!("{}{key}", scoped_prefix(id)),
        None => format!("{UNSCOPED_KEY_PREFIX}{key}"),
    }
}

pub struct ScopedNamespace {
    kv: Arc<dyn KeyValueStore>,
    sessions: Arc<SessionManager>,
    /// Values whose last write or removal did not reach storage.
    /// `None` marks a pending removal.
    overlay: Mutex<HashMap<String, Option<String>>>,
}

impl ScopedNamespace {
    pub fn new(kv: Arc<dyn KeyValueStore>, sessions: Arc<SessionManager>) -> Self {
        Self {
            kv,
            sessions,
            overlay: Mutex::new(HashMap::new()),
        }
    }

    /// Key for `key` under whichever identity is live right now.
    pub fn resolve(&self, key: &str) -> String {
        let identity = self.sessions.current_identity();
        if identity.is_none() {
            debug!(key, "no active session, using unscoped key space");
        }
        namespaced_key(identity.as_deref(), key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let full = self.resolve(key);
        if let Some(pending) = self.overlay.lock().get(&full) {
            return pending.clone();
        }
        match self.kv.get(&full) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %full, error = %e, "scoped read failed");
                None
            }
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let full = self.resolve(key);
        match self.kv.set(&full, value) {
            Ok(()) => {
                self.overlay.lock().remove(&full);
                Ok(())
            }
            Err(e) => {
                warn!(key = %full, error = %e, "scoped write not persisted, kept in memory");
                self.overlay.lock().insert(full, Some(value.to_string()));
                Err(e)
            }
        }
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let full = self.resolve(key);
        match self.kv.remove(&full) {
            Ok(()) => {
                self.overlay.lock().remove(&full);
                Ok(())
            }
            Err(e) => {
                warn!(key = %full, error = %e, "scoped removal not persisted");
                self.overlay.lock().insert(full, None);
                Err(e)
            }
        }
    }

    /// Deserialize a JSON value. Unparseable values read as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "scoped value is not valid JSON");
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }

    /// Drop in-memory state held for `identity_id`.
    pub fn forget(&self, identity_id: &str) {
        let prefix = scoped_prefix(identity_id);
        self.overlay.lock().retain(|k, _| !k.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CoreConfig;
    use crate::crypto::DerivedKey;
    use crate::identity::IdentityStore;
    use crate::limiter::AttemptLimiter;
    use crate::session::VolatileSessionStore;
    use crate::storage::MemoryStore;

    fn namespace(kv: Arc<dyn KeyValueStore>) -> (ScopedNamespace, Arc<SessionManager>) {
        let clock = Arc::new(ManualClock::default());
        let identities = IdentityStore::new(kv.clone());
        let limiter = Arc::new(AttemptLimiter::new(
            identities.clone(),
            clock.clone(),
            &CoreConfig::default(),
        ));
        let sessions = Arc::new(SessionManager::new(
            Box::new(VolatileSessionStore::new()),
            limiter,
            identities,
            clock,
            15,
            false,
        ));
        (ScopedNamespace::new(kv, sessions.clone()), sessions)
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(namespaced_key(Some("abc"), "theme"), "persona.scoped.abc.theme");
        assert_eq!(namespaced_key(None, "theme"), "persona.unscoped.theme");
    }

    #[test]
    fn identities_do_not_see_each_other() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let (ns, sessions) = namespace(kv.clone());
        let key = DerivedKey::from_bytes([1; 32]);

        sessions.start("alice", key.clone()).unwrap();
        ns.set("draft", "a").unwrap();
        sessions.start("bob", key).unwrap();
        assert_eq!(ns.get("draft"), None);
        ns.set("draft", "b").unwrap();

        sessions.lock();
        assert_eq!(ns.get("draft"), None);
        assert_eq!(kv.get("persona.scoped.alice.draft").unwrap().as_deref(), Some("a"));
        assert_eq!(kv.get("persona.scoped.bob.draft").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn failed_write_stays_readable() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_quota(64));
        let (ns, _) = namespace(kv.clone());
        let big = "x".repeat(128);

        assert!(ns.set("big", &big).is_err());
        assert_eq!(ns.get("big").as_deref(), Some(big.as_str()));
        assert_eq!(kv.get("persona.unscoped.big").unwrap(), None);

        ns.set("big", "small").unwrap();
        assert_eq!(ns.get("big").as_deref(), Some("small"));
    }

    #[test]
    fn json_helpers() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let (ns, _) = namespace(kv);
        ns.set_json("list", &vec![1u32, 2, 3]).unwrap();
        assert_eq!(ns.get_json::<Vec<u32>>("list"), Some(vec![1, 2, 3]));
        ns.set("list", "not json").unwrap();
        assert_eq!(ns.get_json::<Vec<u32>>("list"), None);
        ns.remove("list").unwrap();
        assert_eq!(ns.get("list"), None);
    }
}
