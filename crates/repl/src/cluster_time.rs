//! Cluster time
//!
//! A logical clock gossiped on every message: any received time greater
//! than the local one advances it, and the local time never goes backward,
//! including across restarts, because every advance persists through the
//! metadata store. Times are signed with a rotating key set; verification
//! accepts the current or the immediately previous generation so rotation
//! never invalidates in-flight gossip.

use parking_lot::{Mutex, RwLock};
use rook_core::{Result, Timestamp};
use rook_storage::MetadataStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const CLOCK_KEY: &str = "cluster_time";
const KEYS_KEY: &str = "cluster_time_keys";

/// A signed cluster time as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedClusterTime {
    /// The logical time.
    pub time: Timestamp,
    /// Which key generation signed it.
    pub key_id: u64,
    /// Keyed digest over the time.
    pub signature: Vec<u8>,
}

/// One signing key generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SigningKey {
    id: u64,
    secret: [u8; 32],
}

fn digest(secret: &[u8; 32], time: Timestamp) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(time.secs.to_be_bytes());
    hasher.update(time.increment.to_be_bytes());
    hasher.finalize().to_vec()
}

/// Rotating signing keys for cluster times.
pub struct SigningKeyManager {
    /// Newest first; at most two generations are kept.
    keys: RwLock<VecDeque<SigningKey>>,
    store: Option<Arc<MetadataStore>>,
}

impl SigningKeyManager {
    /// Manager with one fresh key and no persistence (tests).
    pub fn ephemeral() -> Self {
        let manager = Self {
            keys: RwLock::new(VecDeque::new()),
            store: None,
        };
        manager.rotate();
        manager
    }

    /// Open from the metadata store, generating the first key if none is
    /// persisted.
    pub fn open(store: Arc<MetadataStore>) -> Result<Self> {
        let persisted: Option<Vec<SigningKey>> = store.get(KEYS_KEY)?;
        let manager = Self {
            keys: RwLock::new(persisted.map(VecDeque::from).unwrap_or_default()),
            store: Some(store),
        };
        if manager.keys.read().is_empty() {
            manager.rotate();
        }
        Ok(manager)
    }

    /// Generate a new key generation, retiring all but the previous one.
    pub fn rotate(&self) {
        let mut keys = self.keys.write();
        let next_id = keys.front().map(|k| k.id + 1).unwrap_or(1);
        let mut secret = [0u8; 32];
        // Derive from time and id; real deployments source entropy here.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut hasher = Sha256::new();
        hasher.update(seed.to_be_bytes());
        hasher.update(next_id.to_be_bytes());
        secret.copy_from_slice(&hasher.finalize());
        keys.push_front(SigningKey {
            id: next_id,
            secret,
        });
        keys.truncate(2);
        drop(keys);
        self.persist();
        info!(target: "rook::repl", key_id = next_id, "cluster time signing key rotated");
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            let keys: Vec<SigningKey> = self.keys.read().iter().cloned().collect();
            let _ = store.put(KEYS_KEY, &keys);
        }
    }

    /// Sign with the newest key.
    pub fn sign(&self, time: Timestamp) -> SignedClusterTime {
        let keys = self.keys.read();
        let key = keys.front().expect("at least one signing key");
        SignedClusterTime {
            time,
            key_id: key.id,
            signature: digest(&key.secret, time),
        }
    }

    /// Verify against the current or previous generation.
    pub fn verify(&self, signed: &SignedClusterTime) -> bool {
        self.keys
            .read()
            .iter()
            .any(|k| k.id == signed.key_id && digest(&k.secret, signed.time) == signed.signature)
    }

    /// Id of the newest generation.
    pub fn current_key_id(&self) -> u64 {
        self.keys.read().front().map(|k| k.id).unwrap_or(0)
    }
}

/// The node's logical clock.
pub struct LogicalClock {
    current: Mutex<Timestamp>,
    store: Option<Arc<MetadataStore>>,
}

impl LogicalClock {
    /// In-memory clock (tests).
    pub fn ephemeral() -> Self {
        Self {
            current: Mutex::new(Timestamp::new(0, 0)),
            store: None,
        }
    }

    /// Open a persistent clock, restoring the last persisted time.
    pub fn open(store: Arc<MetadataStore>) -> Result<Self> {
        let persisted: Option<Timestamp> = store.get(CLOCK_KEY)?;
        Ok(Self {
            current: Mutex::new(persisted.unwrap_or_default()),
            store: Some(store),
        })
    }

    /// Current time without advancing.
    pub fn now(&self) -> Timestamp {
        *self.current.lock()
    }

    /// Reserve the next tick (new writes stamp with this).
    pub fn tick(&self) -> Timestamp {
        let wall_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let mut current = self.current.lock();
        let next = if wall_secs > current.secs {
            Timestamp::new(wall_secs, 1)
        } else {
            Timestamp::new(current.secs, current.increment + 1)
        };
        *current = next;
        self.persist(next);
        next
    }

    /// Fold in a gossiped time; the clock only moves forward.
    pub fn advance(&self, observed: Timestamp) {
        let mut current = self.current.lock();
        if observed > *current {
            *current = observed;
            self.persist(observed);
        }
    }

    fn persist(&self, time: Timestamp) {
        if let Some(store) = &self.store {
            let _ = store.put(CLOCK_KEY, &time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_storage::{HeapEngine, REPL_CONFIG_IDENT};

    #[test]
    fn clock_is_monotonic() {
        let clock = LogicalClock::ephemeral();
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
        // Gossip from behind never regresses the clock.
        clock.advance(Timestamp::new(0, 1));
        assert!(clock.now() >= b);
        // Gossip from ahead advances it.
        let ahead = Timestamp::new(b.secs + 100, 7);
        clock.advance(ahead);
        assert_eq!(clock.now(), ahead);
    }

    #[test]
    fn clock_survives_restart() {
        let engine = HeapEngine::new();
        let ahead = Timestamp::new(4_000_000_000, 3);
        {
            let store = Arc::new(MetadataStore::open(&engine, REPL_CONFIG_IDENT));
            let clock = LogicalClock::open(store).unwrap();
            clock.advance(ahead);
        }
        let store = Arc::new(MetadataStore::open(&engine, REPL_CONFIG_IDENT));
        let clock = LogicalClock::open(store).unwrap();
        assert_eq!(clock.now(), ahead);
        assert!(clock.tick() > ahead);
    }

    #[test]
    fn signatures_verify_across_one_rotation() {
        let manager = SigningKeyManager::ephemeral();
        let signed = manager.sign(Timestamp::new(100, 1));
        assert!(manager.verify(&signed));

        manager.rotate();
        // Previous generation still verifies.
        assert!(manager.verify(&signed));
        let newer = manager.sign(Timestamp::new(100, 2));
        assert!(manager.verify(&newer));

        manager.rotate();
        // Two rotations later the old signature is dead.
        assert!(!manager.verify(&signed));
    }

    #[test]
    fn tampered_signature_fails() {
        let manager = SigningKeyManager::ephemeral();
        let mut signed = manager.sign(Timestamp::new(5, 5));
        signed.time = Timestamp::new(5, 6);
        assert!(!manager.verify(&signed));
    }

    #[test]
    fn keys_persist_across_restart() {
        let engine = HeapEngine::new();
        let signed = {
            let store = Arc::new(MetadataStore::open(&engine, REPL_CONFIG_IDENT));
            let manager = SigningKeyManager::open(store).unwrap();
            manager.sign(Timestamp::new(9, 9))
        };
        let store = Arc::new(MetadataStore::open(&engine, REPL_CONFIG_IDENT));
        let manager = SigningKeyManager::open(store).unwrap();
        assert!(manager.verify(&signed));
    }
}
