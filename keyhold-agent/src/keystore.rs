//! In-memory key store.
//!
//! The [`KeyStore`] holds every private key the agent is currently willing
//! to sign with.  It is populated by `add` requests over the agent socket
//! and drained by `remove` requests, key expiry, and the daemon's auto-lock
//! policy.
//!
//! Thread safety: all mutations go through `Arc<RwLock<KeyStore>>`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand_core::RngCore as _;
use sha2::{Digest as _, Sha256};
use ssh_key::{HashAlg, PrivateKey};
use tracing::debug;
use zeroize::Zeroize as _;

/// An individual key entry in the store.
#[derive(Clone)]
pub struct KeyEntry {
    /// The private key (zeroized on drop via `ssh_key::PrivateKey`).
    pub private_key: PrivateKey,

    /// Comment supplied at add time (usually the key file path or the
    /// `user@host` comment baked into the key).
    pub comment: String,

    /// SHA-256 fingerprint string (e.g. `"SHA256:abc123…"`).
    pub fingerprint: String,

    /// OpenSSH wire-format public key (the `authorized_keys` line).
    pub public_key_openssh: String,

    pub added_at: Instant,

    /// Deadline after which the key is unobservable and will be reaped.
    pub expires_at: Option<Instant>,

    /// Whether the client asked for per-signature confirmation.
    pub require_confirm: bool,
}

impl KeyEntry {
    pub fn expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("comment", &self.comment)
            .field("fingerprint", &self.fingerprint)
            .field("expires_at", &self.expires_at)
            .field("require_confirm", &self.require_confirm)
            .finish_non_exhaustive()
    }
}

impl Drop for KeyEntry {
    fn drop(&mut self) {
        // PrivateKey zeroizes its own material; the comment can carry a
        // filesystem path the operator may consider private, so clear it too.
        self.comment.zeroize();
    }
}

/// Build a [`KeyEntry`] from a parsed [`PrivateKey`].
///
/// Returns `None` if the public key cannot be serialised to OpenSSH format.
pub fn build_entry(
    private_key: PrivateKey,
    comment: String,
    expires_at: Option<Instant>,
    require_confirm: bool,
) -> Option<KeyEntry> {
    let public_key = private_key.public_key();
    let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
    let public_key_openssh = public_key.to_openssh().ok()?;

    Some(KeyEntry {
        private_key,
        comment,
        fingerprint,
        public_key_openssh,
        added_at: Instant::now(),
        expires_at,
        require_confirm,
    })
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LockError {
    #[error("agent is already locked")]
    AlreadyLocked,
    #[error("agent is not locked")]
    NotLocked,
    #[error("incorrect passphrase")]
    BadPassphrase,
    #[error("empty passphrase refused")]
    EmptyPassphrase,
}

/// Salted digest of the lock passphrase.  The passphrase itself is never
/// retained.
struct LockVerifier {
    salt: [u8; 16],
    digest: [u8; 32],
}

impl LockVerifier {
    fn derive(salt: &[u8; 16], passphrase: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(passphrase);
        hasher.finalize().into()
    }

    fn new(passphrase: &[u8]) -> Self {
        let mut salt = [0u8; 16];
        rand_core::OsRng.fill_bytes(&mut salt);
        let digest = Self::derive(&salt, passphrase);
        Self { salt, digest }
    }

    fn matches(&self, passphrase: &[u8]) -> bool {
        Self::derive(&self.salt, passphrase) == self.digest
    }
}

/// Shared, thread-safe key store.
///
/// Create with [`KeyStore::new`] and share via [`Arc::clone`].  Keys are
/// keyed by SHA-256 fingerprint; re-adding a key replaces its entry so a
/// second `add` refreshes lifetime and confirmation constraints instead of
/// duplicating the identity.
pub struct KeyStore {
    entries: HashMap<String, KeyEntry>,
    lock: Option<LockVerifier>,

    /// Most recent sign/list request, for the idle auto-lock policy.
    last_activity: Instant,
    /// Most recent successful add, for the max-unlocked auto-lock policy.
    last_add: Option<Instant>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("entries", &self.entries.len())
            .field("locked", &self.lock.is_some())
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Create an empty, unlocked key store.
    pub fn new() -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self {
            entries: HashMap::new(),
            lock: None,
            last_activity: Instant::now(),
            last_add: None,
        }))
    }

    /// Insert a key entry, replacing any existing entry with the same
    /// fingerprint.  Returns `true` if an entry was replaced.
    pub fn insert(&mut self, entry: KeyEntry) -> bool {
        debug!(
            fingerprint = %entry.fingerprint,
            comment = %entry.comment,
            expires = entry.expires_at.is_some(),
            "keystore: adding key"
        );
        self.last_add = Some(Instant::now());
        self.entries
            .insert(entry.fingerprint.clone(), entry)
            .is_some()
    }

    /// Remove the key with the given fingerprint.  Returns `true` if a key
    /// was removed.
    pub fn remove(&mut self, fingerprint: &str) -> bool {
        let removed = self.entries.remove(fingerprint).is_some();
        debug!(fingerprint = %fingerprint, removed, "keystore: remove");
        removed
    }

    /// Remove all keys.
    pub fn remove_all(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        debug!(count, "keystore: removed all keys");
    }

    /// Look up a live key by its SHA-256 fingerprint string.  Expired keys
    /// are unobservable even before the reaper runs.
    pub fn get(&self, fingerprint: &str) -> Option<&KeyEntry> {
        let now = Instant::now();
        self.entries
            .get(fingerprint)
            .filter(|entry| !entry.expired_at(now))
    }

    /// Iterate all live (unexpired) entries.
    pub fn identities(&self) -> impl Iterator<Item = &KeyEntry> {
        let now = Instant::now();
        self.entries.values().filter(move |e| !e.expired_at(now))
    }

    /// Evict entries whose deadline has passed.  Returns the number evicted.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.expired_at(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "keystore: purged expired keys");
        }
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.identities().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Lock state
    // -----------------------------------------------------------------------

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Lock the store.  While locked the agent advertises no identities and
    /// refuses sign/add/remove.  Only a salted digest of the passphrase is
    /// retained.
    pub fn lock(&mut self, passphrase: &[u8]) -> Result<(), LockError> {
        if passphrase.is_empty() {
            return Err(LockError::EmptyPassphrase);
        }
        if self.lock.is_some() {
            return Err(LockError::AlreadyLocked);
        }
        self.lock = Some(LockVerifier::new(passphrase));
        debug!("keystore: locked");
        Ok(())
    }

    pub fn unlock(&mut self, passphrase: &[u8]) -> Result<(), LockError> {
        match &self.lock {
            None => Err(LockError::NotLocked),
            Some(verifier) if verifier.matches(passphrase) => {
                self.lock = None;
                debug!("keystore: unlocked");
                Ok(())
            }
            Some(_) => Err(LockError::BadPassphrase),
        }
    }

    // -----------------------------------------------------------------------
    // Activity tracking for the auto-lock policy
    // -----------------------------------------------------------------------

    /// Record client activity (a sign or list request).
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Time since the most recent add, or `None` if nothing was ever added.
    pub fn unlocked_for(&self) -> Option<Duration> {
        self.last_add.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::Algorithm;

    fn entry(comment: &str, expires_at: Option<Instant>) -> KeyEntry {
        let key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).unwrap();
        build_entry(key, comment.to_string(), expires_at, false).unwrap()
    }

    #[test]
    fn insert_then_get_by_fingerprint() {
        let store = KeyStore::new();
        let mut store = store.write().unwrap();
        let e = entry("alice@laptop", None);
        let fp = e.fingerprint.clone();

        assert!(!store.insert(e));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&fp).unwrap().comment, "alice@laptop");
    }

    #[test]
    fn reinsert_replaces_constraints() {
        let key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).unwrap();
        let first = build_entry(key.clone(), "first".into(), None, false).unwrap();
        let second = build_entry(key, "second".into(), None, true).unwrap();
        let fp = first.fingerprint.clone();

        let store = KeyStore::new();
        let mut store = store.write().unwrap();
        assert!(!store.insert(first));
        assert!(store.insert(second));
        assert_eq!(store.len(), 1);
        let got = store.get(&fp).unwrap();
        assert_eq!(got.comment, "second");
        assert!(got.require_confirm);
    }

    #[test]
    fn expired_entry_is_unobservable_before_reaping() {
        let store = KeyStore::new();
        let mut store = store.write().unwrap();
        let past = Instant::now() - Duration::from_secs(1);
        let e = entry("stale", Some(past));
        let fp = e.fingerprint.clone();
        store.insert(e);

        assert!(store.get(&fp).is_none());
        assert_eq!(store.identities().count(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn purge_expired_evicts_only_stale_entries() {
        let store = KeyStore::new();
        let mut store = store.write().unwrap();
        store.insert(entry("stale", Some(Instant::now() - Duration::from_secs(1))));
        store.insert(entry("fresh", Some(Instant::now() + Duration::from_secs(3600))));
        store.insert(entry("forever", None));

        assert_eq!(store.purge_expired(Instant::now()), 1);
        assert_eq!(store.identities().count(), 2);
    }

    #[test]
    fn remove_and_remove_all() {
        let store = KeyStore::new();
        let mut store = store.write().unwrap();
        let e = entry("a", None);
        let fp = e.fingerprint.clone();
        store.insert(e);
        store.insert(entry("b", None));

        assert!(store.remove(&fp));
        assert!(!store.remove(&fp));
        store.remove_all();
        assert!(store.is_empty());
    }

    #[test]
    fn lock_unlock_round_trip() {
        let store = KeyStore::new();
        let mut store = store.write().unwrap();

        assert_eq!(store.unlock(b"pw"), Err(LockError::NotLocked));
        assert_eq!(store.lock(b""), Err(LockError::EmptyPassphrase));

        store.lock(b"hunter2").unwrap();
        assert!(store.is_locked());
        assert_eq!(store.lock(b"again"), Err(LockError::AlreadyLocked));
        assert_eq!(store.unlock(b"wrong"), Err(LockError::BadPassphrase));
        assert!(store.is_locked());

        store.unlock(b"hunter2").unwrap();
        assert!(!store.is_locked());
    }

    #[test]
    fn debug_never_prints_key_material() {
        let e = entry("alice@laptop", None);
        let debug = format!("{e:?}");
        assert!(debug.contains("SHA256:"));
        assert!(!debug.contains("PRIVATE"));
        // The base64 public key blob must not leak either; only the
        // fingerprint is printed.
        assert!(!debug.contains(&e.public_key_openssh));
    }
}
