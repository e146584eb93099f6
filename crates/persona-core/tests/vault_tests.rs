//! End-to-end tests for the identity manager.
//!
//! Tests cover:
//!  1. Create → unlock returns the original profile
//!  2. Ten wrong PINs destroy the identity and its scoped data
//!  3. Hard session expiry falls back to the unscoped namespace
//!  4. Overlapping unlocks for one identity
//!  5. remaining_attempts is read-only
//!  6. PIN change, deletion and on-disk persistence
//!  7. Lockout and attempt counting when storage fails

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use tempfile::tempdir;

use persona_core::clock::ManualClock;
use persona_core::crypto::MIN_KDF_ITERATIONS;
use persona_core::identity::{scoped_prefix, INDEX_KEY};
use persona_core::session::VolatileSessionStore;
use persona_core::storage::{KeyValueStore, MemoryStore};
use persona_core::{CoreConfig, IdentityManager, NewIdentity, Result, VaultError};

fn fast_config() -> CoreConfig {
    CoreConfig {
        kdf_iterations: MIN_KDF_ITERATIONS,
        fallback_rounds: MIN_KDF_ITERATIONS,
        ..CoreConfig::default()
    }
}

struct Harness {
    mgr: IdentityManager,
    kv: Arc<MemoryStore>,
    clock: ManualClock,
}

fn harness() -> Harness {
    harness_with(MemoryStore::new())
}

fn harness_with(store: MemoryStore) -> Harness {
    let kv = Arc::new(store);
    let clock = ManualClock::default();
    let mgr = IdentityManager::with_parts(
        kv.clone(),
        Box::new(VolatileSessionStore::new()),
        Arc::new(clock.clone()),
        fast_config(),
    )
    .unwrap();
    Harness { mgr, kv, clock }
}

fn ada() -> NewIdentity {
    NewIdentity {
        handle: "ada".into(),
        icon: "owl".into(),
        color: "#336699".into(),
    }
}

// ─── Test 1: Create → unlock ────────────────────────────────────────────────

#[tokio::test]
async fn test_unlock_returns_original_profile() {
    let h = harness();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();
    assert!(!h.mgr.is_unlocked());

    let unlocked = h.mgr.unlock(&rec.id, "123456").await.unwrap();
    assert_eq!(unlocked.payload.profile.handle, "ada");
    assert_eq!(unlocked.payload.profile.icon, "owl");
    assert_eq!(unlocked.payload.profile.color, "#336699");
    assert_eq!(unlocked.record.handle, "ada");
    assert!(unlocked.persist_error.is_none());

    let active = h.mgr.current_key().unwrap();
    assert_eq!(active.identity_id, rec.id);
    assert_eq!(h.mgr.active_identity_id().as_deref(), Some(rec.id.as_str()));

    h.mgr.lock();
    assert!(h.mgr.current_key().is_none());
}

// ─── Test 2: Lockout ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tenth_wrong_pin_destroys_identity() {
    let h = harness();
    let victim = h.mgr.create(ada(), "123456").await.unwrap();
    let bystander = h.mgr.create(ada(), "654321").await.unwrap();

    h.mgr.unlock(&victim.id, "123456").await.unwrap();
    h.mgr.scoped().set("draft", "secret notes").unwrap();
    h.mgr.unlock(&bystander.id, "654321").await.unwrap();
    h.mgr.scoped().set("draft", "other notes").unwrap();
    h.mgr.unlock(&victim.id, "123456").await.unwrap();

    for expected_remaining in (1..=9).rev() {
        let err = h.mgr.unlock(&victim.id, "000000").await.unwrap_err();
        assert_eq!(err, VaultError::WrongPin { remaining: expected_remaining });
    }
    let err = h.mgr.unlock(&victim.id, "000000").await.unwrap_err();
    assert_eq!(err, VaultError::Destroyed);
    assert!(err.is_terminal());

    assert!(h.mgr.list().iter().all(|r| r.id != victim.id));
    assert!(h.kv.keys_with_prefix(&scoped_prefix(&victim.id)).unwrap().is_empty());
    assert!(h.kv.get(&format!("persona.vault.{}", victim.id)).unwrap().is_none());
    assert!(h.mgr.current_key().is_none(), "destroyed identity's session must end");
    assert!(h.mgr.active_identity_id().is_none());

    // Untouched neighbour.
    assert_eq!(h.mgr.remaining_attempts(&bystander.id).unwrap(), 10);
    assert_eq!(
        h.kv.get(&format!("{}draft", scoped_prefix(&bystander.id))).unwrap().as_deref(),
        Some("other notes")
    );

    let err = h.mgr.unlock(&victim.id, "123456").await.unwrap_err();
    assert!(matches!(err, VaultError::NotFound(_)));
}

#[tokio::test]
async fn test_invalid_format_does_not_count() {
    let h = harness();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();
    for bad in ["", "12345", "1234567890123", "12345a", "１２３４５６"] {
        assert!(matches!(
            h.mgr.unlock(&rec.id, bad).await,
            Err(VaultError::InvalidPin { .. })
        ));
    }
    assert_eq!(h.mgr.remaining_attempts(&rec.id).unwrap(), 10);
}

#[tokio::test]
async fn test_window_expiry_resets_count() {
    let h = harness();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();
    for _ in 0..9 {
        h.mgr.unlock(&rec.id, "000000").await.unwrap_err();
    }
    assert_eq!(h.mgr.remaining_attempts(&rec.id).unwrap(), 1);

    h.clock.advance(Duration::seconds(3601));
    assert_eq!(h.mgr.remaining_attempts(&rec.id).unwrap(), 10);
    let err = h.mgr.unlock(&rec.id, "000000").await.unwrap_err();
    assert_eq!(err, VaultError::WrongPin { remaining: 9 });
}

// ─── Test 3: Session expiry ─────────────────────────────────────────────────

#[tokio::test]
async fn test_expired_session_uses_unscoped_namespace() {
    let h = harness();
    h.mgr.scoped().set("theme", "light").unwrap();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();
    h.mgr.set_lock_timeout(1).unwrap();

    let unlocked = h.mgr.unlock(&rec.id, "123456").await.unwrap();
    assert_eq!(unlocked.session.timeout_minutes, 1);
    assert_eq!(h.mgr.scoped().get("theme"), None);
    h.mgr.scoped().set("theme", "dark").unwrap();
    assert_eq!(h.mgr.scoped().get("theme").as_deref(), Some("dark"));

    h.clock.advance(Duration::seconds(61));
    assert!(h.mgr.current_key().is_none());
    assert_eq!(h.mgr.scoped().get("theme").as_deref(), Some("light"));
    assert_eq!(h.mgr.open_vault().unwrap_err(), VaultError::NoSession);
}

#[tokio::test]
async fn test_refresh_keeps_session_alive() {
    let h = harness();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();
    h.mgr.set_lock_timeout(1).unwrap();
    h.mgr.unlock(&rec.id, "123456").await.unwrap();

    for _ in 0..3 {
        h.clock.advance(Duration::seconds(40));
        assert!(h.mgr.refresh());
    }
    assert!(h.mgr.is_unlocked());
    h.clock.advance(Duration::seconds(60));
    assert!(!h.mgr.is_unlocked());
}

// ─── Test 4: Overlapping unlocks ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_correct_unlocks_leave_count_zero() {
    let h = harness();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();
    h.mgr.unlock(&rec.id, "000000").await.unwrap_err();

    let (a, b) = tokio::join!(
        h.mgr.unlock(&rec.id, "123456"),
        h.mgr.unlock(&rec.id, "123456")
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(h.mgr.get(&rec.id).unwrap().attempt_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_wrong_pins_are_both_counted() {
    let h = harness();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();

    let (a, b) = tokio::join!(
        h.mgr.unlock(&rec.id, "000000"),
        h.mgr.unlock(&rec.id, "111111")
    );
    let mut remaining: Vec<_> = [a.unwrap_err(), b.unwrap_err()]
        .into_iter()
        .map(|e| match e {
            VaultError::WrongPin { remaining } => remaining,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    remaining.sort();
    assert_eq!(remaining, vec![8, 9]);
    assert_eq!(h.mgr.get(&rec.id).unwrap().attempt_count, 2);
}

// ─── Test 5: remaining_attempts is read-only ────────────────────────────────

#[tokio::test]
async fn test_remaining_attempts_never_mutates() {
    let h = harness();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();
    h.mgr.unlock(&rec.id, "000000").await.unwrap_err();
    let before = h.mgr.get(&rec.id).unwrap();

    for _ in 0..50 {
        assert_eq!(h.mgr.remaining_attempts(&rec.id).unwrap(), 9);
    }
    assert_eq!(h.mgr.get(&rec.id).unwrap(), before);
    assert!(matches!(
        h.mgr.remaining_attempts("nope"),
        Err(VaultError::NotFound(_))
    ));
}

// ─── Test 6: PIN change, delete, persistence ────────────────────────────────

#[tokio::test]
async fn test_change_pin_reseals_vault() {
    let h = harness();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();
    let original = h.mgr.unlock(&rec.id, "123456").await.unwrap();

    let err = h.mgr.change_pin(&rec.id, "999999", "24681357").await.unwrap_err();
    assert_eq!(err, VaultError::WrongPin { remaining: 9 });

    h.mgr.change_pin(&rec.id, "123456", "24681357").await.unwrap();
    assert_eq!(h.mgr.get(&rec.id).unwrap().salt, rec.salt);
    assert_eq!(h.mgr.get(&rec.id).unwrap().attempt_count, 0);

    // Live session follows the new key.
    let reopened = h.mgr.open_vault().unwrap();
    assert_eq!(reopened.public_key, original.payload.public_key);

    h.mgr.lock();
    assert!(matches!(
        h.mgr.unlock(&rec.id, "123456").await,
        Err(VaultError::WrongPin { .. })
    ));
    let again = h.mgr.unlock(&rec.id, "24681357").await.unwrap();
    assert_eq!(again.payload.signing_key, original.payload.signing_key);
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let h = harness();
    let rec = h.mgr.create(ada(), "123456").await.unwrap();
    h.mgr.unlock(&rec.id, "123456").await.unwrap();
    h.mgr.scoped().set("draft", "x").unwrap();

    h.mgr.delete(&rec.id).await.unwrap();
    assert!(h.mgr.list().is_empty());
    assert!(h.mgr.current_key().is_none());
    assert!(h.kv.keys_with_prefix("persona.scoped.").unwrap().is_empty());
    assert!(matches!(
        h.mgr.delete(&rec.id).await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_identities_survive_reopen() {
    let dir = tempdir().unwrap();
    let id = {
        let mgr = IdentityManager::open(dir.path(), fast_config()).unwrap();
        let rec = mgr.create(ada(), "123456").await.unwrap();
        mgr.set_lock_timeout(30).unwrap();
        rec.id
    };

    let mgr = IdentityManager::open(dir.path(), fast_config()).unwrap();
    assert_eq!(mgr.list().len(), 1);
    assert_eq!(mgr.lock_timeout(), 30);
    assert!(!mgr.is_unlocked(), "sessions are never persisted");
    let unlocked = mgr.unlock(&id, "123456").await.unwrap();
    assert_eq!(unlocked.record.handle, "ada");
}

// ─── Test 7: Storage failures ───────────────────────────────────────────────

/// Memory store with switchable write failures.
struct FaultyStore {
    inner: MemoryStore,
    /// Index writes still allowed before they start failing; negative means
    /// unlimited.
    index_writes_left: AtomicI64,
    fail_removes: AtomicBool,
}

impl FaultyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            index_writes_left: AtomicI64::new(-1),
            fail_removes: AtomicBool::new(false),
        }
    }

    fn allow_index_writes(&self, n: i64) {
        self.index_writes_left.store(n, Ordering::SeqCst);
    }
}

impl KeyValueStore for FaultyStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if key == INDEX_KEY {
            let left = self.index_writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(VaultError::StorageUnavailable("index write rejected".into()));
            }
            if left > 0 {
                self.index_writes_left.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(VaultError::StorageUnavailable("remove rejected".into()));
        }
        self.inner.remove(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }
}

fn faulty_manager(kv: Arc<FaultyStore>) -> IdentityManager {
    IdentityManager::with_parts(
        kv,
        Box::new(VolatileSessionStore::new()),
        Arc::new(ManualClock::default()),
        fast_config(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_lockout_cleanup_failures_still_destroy() {
    let kv = Arc::new(FaultyStore::new());
    let mgr = faulty_manager(kv.clone());
    let rec = mgr.create(ada(), "123456").await.unwrap();
    mgr.unlock(&rec.id, "123456").await.unwrap();
    mgr.scoped().set("draft", "notes").unwrap();
    mgr.lock();

    for _ in 0..9 {
        mgr.unlock(&rec.id, "000000").await.unwrap_err();
    }
    kv.fail_removes.store(true, Ordering::SeqCst);
    let err = mgr.unlock(&rec.id, "000000").await.unwrap_err();
    assert_eq!(err, VaultError::Destroyed);
    assert!(mgr.list().is_empty());

    // Secondary cleanup is logged, not retried: the leftovers stay behind.
    assert!(kv.get(&format!("persona.vault.{}", rec.id)).unwrap().is_some());
    assert!(!kv.keys_with_prefix(&scoped_prefix(&rec.id)).unwrap().is_empty());
    assert!(matches!(
        mgr.unlock(&rec.id, "123456").await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_index_removal_is_not_reported_as_destroyed() {
    let kv = Arc::new(FaultyStore::new());
    let mgr = faulty_manager(kv.clone());
    let rec = mgr.create(ada(), "123456").await.unwrap();

    for _ in 0..9 {
        mgr.unlock(&rec.id, "000000").await.unwrap_err();
    }
    // The tenth attempt is charged, then every further index write fails.
    kv.allow_index_writes(1);
    let err = mgr.unlock(&rec.id, "000000").await.unwrap_err();
    assert!(matches!(err, VaultError::StorageUnavailable(_)), "got {err:?}");

    let stuck = mgr.get(&rec.id).unwrap();
    assert_eq!(stuck.attempt_count, 10);
    assert_eq!(mgr.remaining_attempts(&rec.id).unwrap(), 0);

    // The correct PIN does not open an identity that is due for destruction.
    let err = mgr.unlock(&rec.id, "123456").await.unwrap_err();
    assert!(matches!(err, VaultError::StorageUnavailable(_)), "got {err:?}");
    assert!(!mgr.is_unlocked());

    kv.allow_index_writes(-1);
    assert_eq!(
        mgr.unlock(&rec.id, "123456").await.unwrap_err(),
        VaultError::Destroyed
    );
    assert!(mgr.list().is_empty());
}

#[tokio::test]
async fn test_uncountable_attempts_are_refused() {
    let h = harness_with(MemoryStore::with_quota(4096));
    let rec = h.mgr.create(ada(), "123456").await.unwrap();

    // Exhaust the quota through the unscoped namespace; no session needed.
    let mut fillers = Vec::new();
    for size in [256, 64, 16, 1] {
        loop {
            let key = format!("f{}", fillers.len());
            if h.mgr.scoped().set(&key, &"x".repeat(size)).is_err() {
                h.mgr.scoped().remove(&key).ok();
                break;
            }
            fillers.push(key);
        }
    }

    for _ in 0..25 {
        let err = h.mgr.unlock(&rec.id, "000000").await.unwrap_err();
        assert!(matches!(err, VaultError::StorageUnavailable(_)), "got {err:?}");
    }
    let err = h.mgr.unlock(&rec.id, "123456").await.unwrap_err();
    assert!(matches!(err, VaultError::StorageUnavailable(_)), "got {err:?}");
    assert!(!h.mgr.is_unlocked());
    assert_eq!(h.mgr.get(&rec.id).unwrap().attempt_count, 0);

    for key in &fillers {
        h.mgr.scoped().remove(key).unwrap();
    }
    h.mgr.unlock(&rec.id, "123456").await.unwrap();
    assert_eq!(h.mgr.get(&rec.id).unwrap().attempt_count, 0);
}
