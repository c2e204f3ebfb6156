//! Replay protection for payment proofs.
//!
//! A proof may unlock a resource once. The gate claims
//! `(resource, proof_id)` in a [`ReplayStore`] before verifying and keeps
//! the claim when the proof is accepted. `claim` is an atomic
//! insert-if-absent, so two concurrent requests carrying the same proof
//! cannot both get past it.
//!
//! Entries expire after the replay window. Verifiers must refuse proofs
//! that stay valid longer than that window.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, TransactionBehavior};
use thiserror::Error;

use crate::payment::{PaymentProof, ResourceId};

#[derive(Error, Debug)]
pub enum ReplayStoreError {
    #[error("replay store database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Key of one consumed proof.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplayKey {
    pub resource: String,
    pub proof_id: String,
}

impl ReplayKey {
    pub fn new(resource: &ResourceId, proof: &PaymentProof) -> Self {
        Self {
            resource: resource.to_string(),
            proof_id: proof.proof_id(),
        }
    }
}

pub trait ReplayStore: Send + Sync + std::fmt::Debug + 'static {
    /// Atomically mark `key` as consumed for `ttl`. Returns `false` if it is
    /// already marked and not yet expired.
    fn claim(&self, key: &ReplayKey, ttl: Duration) -> Result<bool, ReplayStoreError>;

    /// Drop a claim, e.g. when verification did not go through.
    fn release(&self, key: &ReplayKey) -> Result<(), ReplayStoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store. Fine for a single node and for tests.
#[derive(Debug, Default)]
pub struct MemoryReplayStore {
    entries: Mutex<HashMap<ReplayKey, Instant>>,
}

impl MemoryReplayStore {
    /// Expired entries are swept once the map grows past this.
    const SWEEP_THRESHOLD: usize = 4096;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReplayStore for MemoryReplayStore {
    fn claim(&self, key: &ReplayKey, ttl: Duration) -> Result<bool, ReplayStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= Self::SWEEP_THRESHOLD {
            entries.retain(|_, expires| *expires > now);
        }
        match entries.get(key) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                entries.insert(key.clone(), now + ttl);
                Ok(true)
            }
        }
    }

    fn release(&self, key: &ReplayKey) -> Result<(), ReplayStoreError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// Store backed by a SQLite file. Every node process pointed at the same
/// file shares one replay record; claims run in an IMMEDIATE transaction so
/// the check-and-mark is atomic across processes.
#[derive(Debug)]
pub struct SqliteReplayStore {
    conn: Mutex<Connection>,
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl SqliteReplayStore {
    pub fn open(path: &Path) -> Result<Self, ReplayStoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, ReplayStoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ReplayStoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS consumed_proofs (
                resource   TEXT NOT NULL,
                proof_id   TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (resource, proof_id)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Delete expired rows. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, ReplayStoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "DELETE FROM consumed_proofs WHERE expires_at <= ?1",
            params![unix_millis()],
        )?)
    }
}

impl ReplayStore for SqliteReplayStore {
    fn claim(&self, key: &ReplayKey, ttl: Duration) -> Result<bool, ReplayStoreError> {
        let now = unix_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM consumed_proofs
             WHERE resource = ?1 AND proof_id = ?2 AND expires_at <= ?3",
            params![key.resource, key.proof_id, now],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO consumed_proofs (resource, proof_id, expires_at)
             VALUES (?1, ?2, ?3)",
            params![key.resource, key.proof_id, expires_at],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    fn release(&self, key: &ReplayKey) -> Result<(), ReplayStoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM consumed_proofs WHERE resource = ?1 AND proof_id = ?2",
            params![key.resource, key.proof_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn key(resource: &str, proof: &str) -> ReplayKey {
        ReplayKey {
            resource: resource.into(),
            proof_id: proof.into(),
        }
    }

    fn exercise(store: &dyn ReplayStore) {
        let window = Duration::from_secs(600);
        let k = key("aa#0", "nonce:1");

        assert!(store.claim(&k, window).unwrap());
        assert!(!store.claim(&k, window).unwrap(), "second claim must fail");

        // Same proof on another resource is a different key.
        assert!(store.claim(&key("aa#1", "nonce:1"), window).unwrap());

        store.release(&k).unwrap();
        assert!(store.claim(&k, window).unwrap(), "released key can be claimed again");

        // A zero TTL expires immediately.
        let short = key("aa#2", "nonce:2");
        assert!(store.claim(&short, Duration::ZERO).unwrap());
        assert!(store.claim(&short, window).unwrap());
    }

    #[test]
    fn test_memory_store_semantics() {
        exercise(&MemoryReplayStore::new());
    }

    #[test]
    fn test_sqlite_store_semantics() {
        exercise(&SqliteReplayStore::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.db");
        let a = SqliteReplayStore::open(&path).unwrap();
        let b = SqliteReplayStore::open(&path).unwrap();
        let k = key("bb#3", "sha256:ff");
        assert!(a.claim(&k, Duration::from_secs(60)).unwrap());
        assert!(!b.claim(&k, Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_sqlite_purge() {
        let store = SqliteReplayStore::in_memory().unwrap();
        store.claim(&key("cc#0", "x"), Duration::ZERO).unwrap();
        store.claim(&key("cc#1", "y"), Duration::from_secs(60)).unwrap();
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let store = Arc::new(MemoryReplayStore::new());
        let k = key("dd#0", "nonce:race");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let k = k.clone();
                std::thread::spawn(move || store.claim(&k, Duration::from_secs(60)).unwrap())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
