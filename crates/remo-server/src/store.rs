//! SQLite-backed state: authorized keys, subdomain reservations, audit
//! events, and settings. A server without a store is a supported
//! configuration; callers hold an `Option<Store>` and skip writes.

use std::path::Path;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::{info, warn};

use remo_core::auth::{decode_public_key, KeyEntry};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Counts surfaced in the status snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub authorized_keys: u64,
    pub reservations: u64,
}

/// A persistent binding of a subdomain to its owning key.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Reservation {
    pub subdomain: String,
    pub pubkey: String,
    pub created_at: String,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS authorized_keys (
        pubkey TEXT PRIMARY KEY,
        rule TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS reservations (
        subdomain TEXT PRIMARY KEY,
        pubkey TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event TEXT NOT NULL,
        subdomain TEXT,
        pubkey TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (or create) the store at the given file path. The parent
    /// directory is created owner-only.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ── Authorized keys ──────────────────────────────────────────────

    pub async fn authorized_entries(&self) -> Result<Vec<KeyEntry>, StoreError> {
        let rows = sqlx::query("SELECT pubkey, rule FROM authorized_keys")
            .fetch_all(&self.pool)
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let pubkey: String = row.get("pubkey");
            let rule: String = row.get("rule");
            let key = decode_public_key(&pubkey)
                .map_err(|e| StoreError::Corrupt(format!("authorized key {pubkey}: {e}")))?;
            entries.push(KeyEntry { key, rule });
        }
        Ok(entries)
    }

    /// Insert or replace the rule for a key. Idempotent.
    pub async fn upsert_authorized_key(&self, key: &VerifyingKey, rule: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO authorized_keys(pubkey, rule, created_at) VALUES(?, ?, ?)
             ON CONFLICT(pubkey) DO UPDATE SET rule = excluded.rule",
        )
        .bind(STANDARD.encode(key.as_bytes()))
        .bind(rule)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_authorized_key(&self, pubkey: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM authorized_keys WHERE pubkey = ?")
            .bind(pubkey)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────────────

    /// The owning key of a reservation, or `None` if unreserved.
    pub async fn reservation_owner(&self, subdomain: &str) -> Result<Option<String>, StoreError> {
        let owner = sqlx::query_scalar::<_, String>(
            "SELECT pubkey FROM reservations WHERE subdomain = ?",
        )
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner)
    }

    /// Bind a subdomain to a key, replacing any prior owner. Idempotent.
    /// This is the explicit operator operation; the handshake path uses
    /// [`Store::try_reserve_subdomain`] instead.
    pub async fn reserve_subdomain(&self, subdomain: &str, pubkey: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reservations(subdomain, pubkey, created_at) VALUES(?, ?, ?)
             ON CONFLICT(subdomain) DO UPDATE SET pubkey = excluded.pubkey",
        )
        .bind(subdomain)
        .bind(pubkey)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a reservation only if the subdomain is unowned. Returns
    /// whether this call created it, so two concurrent first claims
    /// resolve to exactly one owner.
    pub async fn try_reserve_subdomain(
        &self,
        subdomain: &str,
        pubkey: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO reservations(subdomain, pubkey, created_at) VALUES(?, ?, ?)
             ON CONFLICT(subdomain) DO NOTHING",
        )
        .bind(subdomain)
        .bind(pubkey)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        let rows = sqlx::query_as::<_, Reservation>(
            "SELECT subdomain, pubkey, created_at FROM reservations ORDER BY subdomain ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ── Audit log ────────────────────────────────────────────────────

    /// Append an audit event. Failures are logged and swallowed: the audit
    /// trail never blocks the tunnel plane.
    pub async fn log_event(&self, event: &str, subdomain: &str, pubkey: &str) {
        let result = sqlx::query(
            "INSERT INTO audit_log(event, subdomain, pubkey, created_at) VALUES(?, ?, ?, ?)",
        )
        .bind(event)
        .bind(subdomain)
        .bind(pubkey)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!(event, subdomain, error = %e, "audit write failed");
        }
    }

    // ── Counters / settings ──────────────────────────────────────────

    pub async fn count_authorized_keys(&self) -> Result<u64, StoreError> {
        self.count("SELECT COUNT(1) FROM authorized_keys").await
    }

    pub async fn count_reservations(&self) -> Result<u64, StoreError> {
        self.count("SELECT COUNT(1) FROM reservations").await
    }

    async fn count(&self, query: &str) -> Result<u64, StoreError> {
        let value = sqlx::query_scalar::<_, i64>(query)
            .fetch_one(&self.pool)
            .await?;
        Ok(value.max(0) as u64)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            authorized_keys: self.count_authorized_keys().await?,
            reservations: self.count_reservations().await?,
        })
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings(key, value) VALUES(?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
