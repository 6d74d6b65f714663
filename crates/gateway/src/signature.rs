//! Persistent store mapping thought signatures to the project that issued
//! them.
//!
//! The Antigravity thinking path needs to know whether a signature carried
//! in a request was issued under the current project; if not, the request is
//! re-keyed to its original project or the signature is stripped. Keys are
//! the SHA-256 of the signature string so arbitrarily large signatures stay
//! out of the database.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

/// Entries older than this are expired on access.
const TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Maximum stored entries; the least recently used are evicted beyond this.
const CAPACITY: i64 = 1000;

/// One stored signature record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    /// Project the signature was issued under.
    pub project_id: String,
    /// Provider that issued it.
    pub provider: String,
    /// Endpoint that issued it.
    pub endpoint: String,
    /// Account index within the provider's credential list.
    pub account: String,
}

/// SQLite-backed signature store. Cheap to clone; all clones share the
/// connection.
#[derive(Clone)]
pub struct SignatureStore {
    connection: Arc<Mutex<Connection>>,
}

impl SignatureStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// An in-memory store, used by tests.
    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> rusqlite::Result<Self> {
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS thought_signatures (
                hash TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                account TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signatures_last_used
                ON thought_signatures (last_used_at);",
        )?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn hash(signature: &str) -> String {
        let digest = Sha256::digest(signature.as_bytes());
        format!("{digest:x}")
    }

    fn now() -> i64 {
        jiff::Timestamp::now().as_second()
    }

    /// Store (or refresh) a signature record, evicting expired and
    /// least-recently-used entries as needed.
    pub fn save_signature(&self, signature: &str, record: &SignatureRecord) -> rusqlite::Result<()> {
        let hash = Self::hash(signature);
        let now = Self::now();

        let connection = self.connection.lock().unwrap_or_else(|e| e.into_inner());

        connection.execute(
            "INSERT INTO thought_signatures
                (hash, project_id, provider, endpoint, account, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(hash) DO UPDATE SET
                project_id = excluded.project_id,
                provider = excluded.provider,
                endpoint = excluded.endpoint,
                account = excluded.account,
                last_used_at = excluded.last_used_at",
            params![hash, record.project_id, record.provider, record.endpoint, record.account, now],
        )?;

        connection.execute(
            "DELETE FROM thought_signatures WHERE created_at < ?1",
            params![now - TTL_SECONDS],
        )?;

        connection.execute(
            "DELETE FROM thought_signatures WHERE hash NOT IN (
                SELECT hash FROM thought_signatures ORDER BY last_used_at DESC, rowid DESC LIMIT ?1
            )",
            params![CAPACITY],
        )?;

        Ok(())
    }

    /// Look up a signature, bumping its `last_used_at`. Expired entries are
    /// treated as absent.
    pub fn get_record(&self, signature: &str) -> rusqlite::Result<Option<SignatureRecord>> {
        let hash = Self::hash(signature);
        let now = Self::now();

        let connection = self.connection.lock().unwrap_or_else(|e| e.into_inner());

        let record = connection
            .query_row(
                "SELECT project_id, provider, endpoint, account FROM thought_signatures
                 WHERE hash = ?1 AND created_at >= ?2",
                params![hash, now - TTL_SECONDS],
                |row| {
                    Ok(SignatureRecord {
                        project_id: row.get(0)?,
                        provider: row.get(1)?,
                        endpoint: row.get(2)?,
                        account: row.get(3)?,
                    })
                },
            )
            .optional()?;

        if record.is_some() {
            connection.execute(
                "UPDATE thought_signatures SET last_used_at = ?1 WHERE hash = ?2",
                params![now, hash],
            )?;
        }

        Ok(record)
    }

    /// Whether the signature was issued under the given project.
    pub fn is_valid_for_project(&self, signature: &str, target_project_id: &str) -> rusqlite::Result<bool> {
        Ok(self
            .get_record(signature)?
            .is_some_and(|record| record.project_id == target_project_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(project: &str) -> SignatureRecord {
        SignatureRecord {
            project_id: project.to_string(),
            provider: "antigravity".to_string(),
            endpoint: "https://daily.example.com".to_string(),
            account: "0".to_string(),
        }
    }

    #[test]
    fn save_and_get_round_trip() {
        let store = SignatureStore::in_memory().unwrap();

        store.save_signature("sig-1", &record("project-a")).unwrap();

        let found = store.get_record("sig-1").unwrap().unwrap();
        assert_eq!(found, record("project-a"));

        assert!(store.get_record("sig-2").unwrap().is_none());
    }

    #[test]
    fn validity_is_scoped_to_project() {
        let store = SignatureStore::in_memory().unwrap();
        store.save_signature("sig-1", &record("project-a")).unwrap();

        assert!(store.is_valid_for_project("sig-1", "project-a").unwrap());
        assert!(!store.is_valid_for_project("sig-1", "project-b").unwrap());
        assert!(!store.is_valid_for_project("unknown", "project-a").unwrap());
    }

    #[test]
    fn saving_again_overwrites() {
        let store = SignatureStore::in_memory().unwrap();
        store.save_signature("sig-1", &record("project-a")).unwrap();
        store.save_signature("sig-1", &record("project-b")).unwrap();

        let found = store.get_record("sig-1").unwrap().unwrap();
        assert_eq!(found.project_id, "project-b");
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let store = SignatureStore::in_memory().unwrap();

        for i in 0..CAPACITY + 10 {
            store.save_signature(&format!("sig-{i}"), &record("project-a")).unwrap();
        }

        // The earliest entries fell out, the latest survive.
        assert!(store.get_record("sig-0").unwrap().is_none());
        assert!(store.get_record(&format!("sig-{}", CAPACITY + 9)).unwrap().is_some());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.db");

        {
            let store = SignatureStore::open(&path).unwrap();
            store.save_signature("sig-1", &record("project-a")).unwrap();
        }

        let store = SignatureStore::open(&path).unwrap();
        assert!(store.get_record("sig-1").unwrap().is_some());
    }
}
