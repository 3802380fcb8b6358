use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use passage_core::{Embedding, EMBEDDING_DIM};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rusqlite::Connection;

const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected 512)")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// Metadata about a registered user (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserInfo {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub slot_id: i64,
    pub passage_count: i64,
    pub is_active: bool,
    pub created_at: String,
}

/// One row of the access audit log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccessLogEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub confidence: Option<f64>,
    pub access_granted: bool,
    pub liveness_passed: bool,
    pub stream_id: String,
    pub error_message: Option<String>,
    pub timestamp: String,
}

/// What gets written to the audit log for one validation attempt.
pub struct AccessAttempt<'a> {
    pub user_id: Option<i64>,
    pub confidence: Option<f64>,
    pub access_granted: bool,
    pub liveness_passed: bool,
    pub stream_id: &'a str,
    pub error_message: Option<&'a str>,
}

/// Aggregate counters for the status surface.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PassageStats {
    pub total_attempts: u64,
    pub granted: u64,
}

/// SQLite-backed user registry and access audit log.
///
/// Embeddings are encrypted with AES-256-GCM before storage. The key comes
/// from `PASSAGE_ENC_PASSPHRASE` (SHA-256 of the passphrase) when set,
/// otherwise from a per-installation 32-byte key file at `{db_dir}/.key`
/// (mode 0600), generated on first use.
#[derive(Clone)]
pub struct AccessStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl AccessStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = resolve_key(db_path)?;
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS users (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     name TEXT NOT NULL,
                     email TEXT NOT NULL UNIQUE,
                     embedding BLOB NOT NULL,
                     slot_id INTEGER NOT NULL DEFAULT -1,
                     passage_count INTEGER NOT NULL DEFAULT 0,
                     is_active INTEGER NOT NULL DEFAULT 1,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS access_log (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     user_id INTEGER,
                     confidence REAL,
                     access_granted INTEGER NOT NULL,
                     liveness_passed INTEGER NOT NULL,
                     stream_id TEXT NOT NULL,
                     error_message TEXT,
                     timestamp TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_access_log_user ON access_log(user_id);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Insert a new user with an encrypted embedding. The slot id starts at
    /// -1 and is filled in by [`update_slot`](Self::update_slot) once the
    /// index enrollment commits. Returns the new user id.
    pub async fn insert_user(
        &self,
        name: &str,
        email: &str,
        embedding: &Embedding,
    ) -> Result<i64, StoreError> {
        validate_embedding_values(&embedding.values)?;
        let blob = self.encrypt_embedding(&embedding.values)?;
        let created_at = chrono::Utc::now().to_rfc3339();

        let name = name.to_string();
        let email = email.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (name, email, embedding, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![name, email, blob, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Record the index slot assigned to a user.
    pub async fn update_slot(&self, user_id: i64, slot: u64) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET slot_id = ?1 WHERE id = ?2",
                    rusqlite::params![slot as i64, user_id],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Delete a user row entirely (enrollment rollback). Returns whether a
    /// row was deleted.
    pub async fn delete_user(&self, user_id: i64) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM users WHERE id = ?1", [user_id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove a user, returning their index slot so the caller can tombstone
    /// it. `None` when the user did not exist.
    pub async fn remove_user(&self, user_id: i64) -> Result<Option<i64>, StoreError> {
        self.conn
            .call(move |conn| {
                let slot: Option<i64> = conn
                    .query_row(
                        "SELECT slot_id FROM users WHERE id = ?1",
                        [user_id],
                        |row| row.get(0),
                    )
                    .ok();
                if slot.is_some() {
                    conn.execute("DELETE FROM users WHERE id = ?1", [user_id])?;
                }
                Ok(slot)
            })
            .await
            .map_err(StoreError::from)
    }

    /// List all users (metadata only).
    pub async fn list_users(&self) -> Result<Vec<UserInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, email, slot_id, passage_count, is_active, created_at
                     FROM users ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(UserInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        slot_id: row.get(3)?,
                        passage_count: row.get(4)?,
                        is_active: row.get::<_, i64>(5)? != 0,
                        created_at: row.get(6)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Look up a user's display name (granted-access messaging).
    pub async fn user_name(&self, user_id: i64) -> Result<Option<String>, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT name FROM users WHERE id = ?1", [user_id], |row| {
                        row.get(0)
                    })
                    .ok())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Fetch every active user's decrypted embedding, for an index rebuild.
    pub async fn active_embeddings(&self) -> Result<Vec<(i64, Embedding)>, StoreError> {
        let rows: Vec<(i64, Vec<u8>)> = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, embedding FROM users WHERE is_active = 1 ORDER BY id")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, blob) in rows {
            let values = self.decrypt_embedding(&blob)?;
            out.push((id, Embedding::new(values)));
        }
        Ok(out)
    }

    /// Increment a user's passage counter after a granted access.
    pub async fn record_passage(&self, user_id: i64) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET passage_count = passage_count + 1 WHERE id = ?1",
                    [user_id],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Append one validation attempt to the audit log.
    pub async fn log_access(&self, attempt: AccessAttempt<'_>) -> Result<(), StoreError> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let stream_id = attempt.stream_id.to_string();
        let error_message = attempt.error_message.map(|s| s.to_string());
        let (user_id, confidence, granted, liveness) = (
            attempt.user_id,
            attempt.confidence,
            attempt.access_granted,
            attempt.liveness_passed,
        );

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO access_log
                       (user_id, confidence, access_granted, liveness_passed, stream_id, error_message, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        user_id,
                        confidence,
                        granted as i64,
                        liveness as i64,
                        stream_id,
                        error_message,
                        timestamp
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Most recent audit entries, newest first.
    pub async fn recent_logs(&self, limit: u32) -> Result<Vec<AccessLogEntry>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, confidence, access_granted, liveness_passed,
                            stream_id, error_message, timestamp
                     FROM access_log ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], |row| {
                    Ok(AccessLogEntry {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        confidence: row.get(2)?,
                        access_granted: row.get::<_, i64>(3)? != 0,
                        liveness_passed: row.get::<_, i64>(4)? != 0,
                        stream_id: row.get(5)?,
                        error_message: row.get(6)?,
                        timestamp: row.get(7)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count registered users.
    pub async fn count_users(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Attempt/grant counters over the whole audit log.
    pub async fn passage_stats(&self) -> Result<PassageStats, StoreError> {
        self.conn
            .call(|conn| {
                let total: u64 =
                    conn.query_row("SELECT COUNT(*) FROM access_log", [], |row| row.get(0))?;
                let granted: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM access_log WHERE access_granted = 1",
                    [],
                    |row| row.get(0),
                )?;
                Ok(PassageStats {
                    total_attempts: total,
                    granted,
                })
            })
            .await
            .map_err(StoreError::from)
    }

    /// Delete every user row (index reset).
    pub async fn clear_users(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM users", [])?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt an embedding blob (12-byte nonce + ciphertext + GCM tag).
    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        const NONCE_LEN: usize = 12;

        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding_strict(&plaintext)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Resolve the AES key: passphrase-derived when `PASSAGE_ENC_PASSPHRASE` is
/// set, all-zeros for in-memory databases (tests), otherwise a key file next
/// to the database.
fn resolve_key(db_path: &Path) -> Result<[u8; 32], StoreError> {
    if let Ok(passphrase) = std::env::var("PASSAGE_ENC_PASSPHRASE") {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        tracing::debug!("encryption key derived from passphrase");
        return Ok(key);
    }

    if db_path == Path::new(":memory:") {
        return Ok([0u8; 32]);
    }

    let key_path = db_path
        .parent()
        .unwrap_or(Path::new("/var/lib/passage"))
        .join(".key");
    load_or_generate_key(&key_path)
}

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
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

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(EMBEDDING_DIM);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }

    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn emb() -> Embedding {
        Embedding::new(
            (0..EMBEDDING_DIM)
                .map(|i| i as f32 / EMBEDDING_DIM as f32)
                .collect(),
        )
    }

    #[tokio::test]
    async fn user_roundtrip() {
        let store = AccessStore::open(Path::new(":memory:")).await.unwrap();

        let id = store
            .insert_user("Ana Souza", "ana@example.com", &emb())
            .await
            .unwrap();
        store.update_slot(id, 0).await.unwrap();

        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, id);
        assert_eq!(users[0].name, "Ana Souza");
        assert_eq!(users[0].slot_id, 0);
        assert_eq!(users[0].passage_count, 0);
        assert!(users[0].is_active);

        assert_eq!(
            store.user_name(id).await.unwrap().as_deref(),
            Some("Ana Souza")
        );
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = AccessStore::open(Path::new(":memory:")).await.unwrap();
        store
            .insert_user("Ana", "ana@example.com", &emb())
            .await
            .unwrap();
        assert!(store
            .insert_user("Ana Again", "ana@example.com", &emb())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn remove_user_returns_slot() {
        let store = AccessStore::open(Path::new(":memory:")).await.unwrap();
        let id = store
            .insert_user("Ana", "ana@example.com", &emb())
            .await
            .unwrap();
        store.update_slot(id, 7).await.unwrap();

        assert_eq!(store.remove_user(id).await.unwrap(), Some(7));
        assert_eq!(store.remove_user(id).await.unwrap(), None);
        assert_eq!(store.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn active_embeddings_roundtrip_encryption() {
        let store = AccessStore::open(Path::new(":memory:")).await.unwrap();
        let original = emb();
        let id = store
            .insert_user("Ana", "ana@example.com", &original)
            .await
            .unwrap();

        let rows = store.active_embeddings().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, id);
        for (a, b) in original.values.iter().zip(rows[0].1.values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[tokio::test]
    async fn passage_counter_increments() {
        let store = AccessStore::open(Path::new(":memory:")).await.unwrap();
        let id = store
            .insert_user("Ana", "ana@example.com", &emb())
            .await
            .unwrap();

        store.record_passage(id).await.unwrap();
        store.record_passage(id).await.unwrap();

        let users = store.list_users().await.unwrap();
        assert_eq!(users[0].passage_count, 2);
    }

    #[tokio::test]
    async fn audit_log_and_stats() {
        let store = AccessStore::open(Path::new(":memory:")).await.unwrap();

        store
            .log_access(AccessAttempt {
                user_id: Some(1),
                confidence: Some(0.93),
                access_granted: true,
                liveness_passed: true,
                stream_id: "door-1",
                error_message: None,
            })
            .await
            .unwrap();
        store
            .log_access(AccessAttempt {
                user_id: None,
                confidence: None,
                access_granted: false,
                liveness_passed: false,
                stream_id: "door-1",
                error_message: Some("no face detected"),
            })
            .await
            .unwrap();

        let logs = store.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        // Newest first
        assert!(!logs[0].access_granted);
        assert_eq!(logs[0].error_message.as_deref(), Some("no face detected"));
        assert!(logs[1].access_granted);
        assert_eq!(logs[1].confidence, Some(0.93));

        let stats = store.passage_stats().await.unwrap();
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.granted, 1);
    }

    #[tokio::test]
    async fn rejects_wrong_dimension() {
        let store = AccessStore::open(Path::new(":memory:")).await.unwrap();
        let short = Embedding::new(vec![0.5; 64]);
        assert!(matches!(
            store
                .insert_user("Ana", "ana@example.com", &short)
                .await
                .unwrap_err(),
            StoreError::InvalidEmbeddingDim(64)
        ));
    }

    #[tokio::test]
    async fn rejects_non_finite_values() {
        let store = AccessStore::open(Path::new(":memory:")).await.unwrap();
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[100] = f32::NAN;
        assert!(matches!(
            store
                .insert_user("Ana", "ana@example.com", &Embedding::new(values))
                .await
                .unwrap_err(),
            StoreError::InvalidEmbeddingValue
        ));
    }

    #[tokio::test]
    async fn wrong_key_fails_decryption() {
        let store1 = AccessStore {
            conn: tokio_rusqlite::Connection::open(Path::new(":memory:"))
                .await
                .unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = AccessStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };

        let blob = store1.encrypt_embedding(&emb().values).unwrap();
        assert!(store2.decrypt_embedding(&blob).is_err());
        assert!(store1.decrypt_embedding(&blob).is_ok());
    }

    #[tokio::test]
    async fn clear_users_empties_registry() {
        let store = AccessStore::open(Path::new(":memory:")).await.unwrap();
        store
            .insert_user("Ana", "ana@example.com", &emb())
            .await
            .unwrap();
        store
            .insert_user("Bruno", "bruno@example.com", &emb())
            .await
            .unwrap();

        store.clear_users().await.unwrap();
        assert_eq!(store.count_users().await.unwrap(), 0);
    }
}
