use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_rusqlite::Connection;

use facecheck_core::SessionState;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("session serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("session encryption failed")]
    EncryptionFailed,
    #[error("session decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid session blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// Externally held, TTL-bounded session state.
///
/// Both operations are atomic for a single id. `set` always restarts the
/// entry's TTL; an entry past its TTL reads as absent.
pub trait SessionStore: Send + Sync + 'static {
    fn get(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<SessionState>, StoreError>> + Send;

    fn set(
        &self,
        id: &str,
        state: &SessionState,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Number of live (unexpired) sessions.
    fn count_live(&self) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

// ── SQLite store ──────────────────────────────────────────────────────────────

/// SQLite-backed session store with AES-256-GCM encryption at rest.
///
/// Session state carries the subject's first frame, so the serialized JSON is
/// encrypted before storage. A per-installation 32-byte key is generated at
/// first use and stored at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl SqliteSessionStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/facecheck"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS sessions (
                     id TEXT PRIMARY KEY,
                     state BLOB NOT NULL,
                     expires_at INTEGER NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(expires_at);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Delete every expired session. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                let removed = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", [now])?;
                Ok(removed)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Encrypt serialized session bytes.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)
    }
}

impl SessionStore for SqliteSessionStore {
    fn get(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<SessionState>, StoreError>> + Send {
        let id = id.to_string();
        async move {
            let now = chrono::Utc::now().timestamp_millis();
            let blob: Option<Vec<u8>> = self
                .conn
                .call(move |conn| {
                    let blob = conn
                        .query_row(
                            "SELECT state FROM sessions WHERE id = ?1 AND expires_at > ?2",
                            rusqlite::params![id, now],
                            |row| row.get::<_, Vec<u8>>(0),
                        )
                        .optional()?;
                    Ok(blob)
                })
                .await?;

            match blob {
                Some(blob) => {
                    let json = self.decrypt(&blob)?;
                    Ok(Some(serde_json::from_slice(&json)?))
                }
                None => Ok(None),
            }
        }
    }

    fn set(
        &self,
        id: &str,
        state: &SessionState,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let id = id.to_string();
        // Serialize and encrypt before entering the SQLite closure
        let blob = serde_json::to_vec(state)
            .map_err(StoreError::from)
            .and_then(|json| self.encrypt(&json));
        async move {
            let blob = blob?;
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            let expires_at = chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms);
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "INSERT INTO sessions (id, state, expires_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(id) DO UPDATE SET state = excluded.state,
                                                       expires_at = excluded.expires_at",
                        rusqlite::params![id, blob, expires_at],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        }
    }

    fn count_live(&self) -> impl Future<Output = Result<u64, StoreError>> + Send {
        async move {
            let now = chrono::Utc::now().timestamp_millis();
            self.conn
                .call(move |conn| {
                    let count: u64 = conn.query_row(
                        "SELECT COUNT(*) FROM sessions WHERE expires_at > ?1",
                        [now],
                        |row| row.get(0),
                    )?;
                    Ok(count)
                })
                .await
                .map_err(StoreError::from)
        }
    }
}

// ── In-memory store ───────────────────────────────────────────────────────────

struct MemoryEntry {
    state: SessionState,
    expires_at: Instant,
}

/// Process-local session store for single-instance deployments and tests.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<SessionState>, StoreError>> + Send {
        let id = id.to_string();
        async move {
            let mut entries = self.entries.lock().await;
            let expired = match entries.get(&id) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.state.clone()))
                }
                Some(_) => true,
                None => false,
            };
            if expired {
                entries.remove(&id);
            }
            Ok(None)
        }
    }

    fn set(
        &self,
        id: &str,
        state: &SessionState,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let id = id.to_string();
        let state = state.clone();
        async move {
            let entry = MemoryEntry {
                state,
                expires_at: Instant::now() + ttl,
            };
            self.entries.lock().await.insert(id, entry);
            Ok(())
        }
    }

    fn count_live(&self) -> impl Future<Output = Result<u64, StoreError>> + Send {
        async move {
            let now = Instant::now();
            let entries = self.entries.lock().await;
            Ok(entries.values().filter(|e| e.expires_at > now).count() as u64)
        }
    }
}

// ── Backend selection ─────────────────────────────────────────────────────────

/// The store chosen at startup via `FACECHECK_STORE`.
#[derive(Clone)]
pub enum SessionBackend {
    Sqlite(SqliteSessionStore),
    Memory(MemorySessionStore),
}

impl SessionBackend {
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        match self {
            SessionBackend::Sqlite(store) => store.purge_expired().await,
            SessionBackend::Memory(store) => Ok(store.purge_expired().await),
        }
    }
}

impl SessionStore for SessionBackend {
    fn get(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<SessionState>, StoreError>> + Send {
        async move {
            match self {
                SessionBackend::Sqlite(store) => store.get(id).await,
                SessionBackend::Memory(store) => store.get(id).await,
            }
        }
    }

    fn set(
        &self,
        id: &str,
        state: &SessionState,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            match self {
                SessionBackend::Sqlite(store) => store.set(id, state, ttl).await,
                SessionBackend::Memory(store) => store.set(id, state, ttl).await,
            }
        }
    }

    fn count_live(&self) -> impl Future<Output = Result<u64, StoreError>> + Send {
        async move {
            match self {
                SessionBackend::Sqlite(store) => store.count_live().await,
                SessionBackend::Memory(store) => store.count_live().await,
            }
        }
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded session encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 session key");
        Ok(key)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use facecheck_core::Challenge;

    fn sample_state(id: &str) -> SessionState {
        SessionState::new(
            id,
            vec![
                Challenge::Shake,
                Challenge::Blink,
                Challenge::Nod,
                Challenge::MouthOpen,
            ],
            vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10],
            chrono::Utc::now(),
        )
    }

    const TTL: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let store = SqliteSessionStore::open(Path::new(":memory:")).await.unwrap();
        let state = sample_state("abc");

        store.set("abc", &state, TTL).await.unwrap();
        let loaded = store.get("abc").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.first_frame(), state.first_frame());
        assert_eq!(store.count_live().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_unknown_id_is_absent() {
        let store = SqliteSessionStore::open(Path::new(":memory:")).await.unwrap();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_set_overwrites() {
        let store = SqliteSessionStore::open(Path::new(":memory:")).await.unwrap();
        store.set("abc", &sample_state("abc"), TTL).await.unwrap();
        let other = sample_state("abc-2");
        store.set("abc", &other, TTL).await.unwrap();
        assert_eq!(store.get("abc").await.unwrap().unwrap().id(), "abc-2");
        assert_eq!(store.count_live().await.unwrap(), 1);
    }

    async fn expires_at(store: &SqliteSessionStore, id: &'static str) -> i64 {
        store
            .conn
            .call(move |conn| {
                let expires_at = conn.query_row(
                    "SELECT expires_at FROM sessions WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )?;
                Ok(expires_at)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_set_pushes_expiry_forward() {
        let store = SqliteSessionStore::open(Path::new(":memory:")).await.unwrap();
        store
            .set("abc", &sample_state("abc"), Duration::from_secs(1))
            .await
            .unwrap();
        let first = expires_at(&store, "abc").await;

        store.set("abc", &sample_state("abc"), TTL).await.unwrap();
        let second = expires_at(&store, "abc").await;
        assert!(second >= first + 599_000);
    }

    #[tokio::test]
    async fn test_memory_set_restarts_ttl() {
        let store = MemorySessionStore::new();
        let short = Duration::from_millis(50);
        store.set("a", &sample_state("a"), short).await.unwrap();
        store.set("a", &sample_state("a"), TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get("a").await.unwrap().is_some());

        store.set("b", &sample_state("b"), short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_expired_reads_absent_and_purges() {
        let store = SqliteSessionStore::open(Path::new(":memory:")).await.unwrap();
        store.set("old", &sample_state("old"), Duration::ZERO).await.unwrap();
        store.set("live", &sample_state("live"), TTL).await.unwrap();

        assert!(store.get("old").await.unwrap().is_none());
        assert_eq!(store.count_live().await.unwrap(), 1);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_state_is_encrypted_at_rest() {
        let store = SqliteSessionStore::open(Path::new(":memory:")).await.unwrap();
        store.set("abc", &sample_state("abc"), TTL).await.unwrap();

        let blob: Vec<u8> = store
            .conn
            .call(|conn| {
                let blob =
                    conn.query_row("SELECT state FROM sessions WHERE id = 'abc'", [], |row| {
                        row.get(0)
                    })?;
                Ok(blob)
            })
            .await
            .unwrap();
        assert!(serde_json::from_slice::<SessionState>(&blob).is_err());
        assert!(!String::from_utf8_lossy(&blob).contains("created_at"));
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let store1 = SqliteSessionStore {
            conn: Connection::open(Path::new(":memory:")).await.unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = SqliteSessionStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };

        let blob = store1.encrypt(b"{\"id\":\"x\"}").unwrap();
        assert!(matches!(
            store2.decrypt(&blob),
            Err(StoreError::DecryptionFailed)
        ));
        assert!(matches!(
            store1.decrypt(&blob[..NONCE_LEN]),
            Err(StoreError::InvalidBlob(12))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_ttl() {
        let store = MemorySessionStore::new();
        store.set("a", &sample_state("a"), TTL).await.unwrap();
        store.set("b", &sample_state("b"), Duration::ZERO).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().unwrap().id(), "a");
        assert!(store.get("b").await.unwrap().is_none());
        assert_eq!(store.count_live().await.unwrap(), 1);
        assert_eq!(store.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn test_backend_dispatch() {
        let backend = SessionBackend::Memory(MemorySessionStore::new());
        backend.set("x", &sample_state("x"), TTL).await.unwrap();
        assert!(backend.get("x").await.unwrap().is_some());
        assert_eq!(backend.purge_expired().await.unwrap(), 0);
    }
}
