//! SQLite-based persistent storage for trusted devices.
//!
//! One table, `trusted_devices`, keyed by device id with a unique index on
//! the signing key. Timestamps are stored as RFC 3339 text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tokio::sync::Mutex;

use crate::store::{DeviceStore, StoreError, TrustedDevice};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

const DEVICE_COLUMNS: &str = "device_id, name, device_type, public_key, exchange_key, \
     shared_secret, paired_at, last_auth_at, last_seen_at, enabled, ipv4, ipv6";

// ============================================================================
// SQLite Store Implementation
// ============================================================================

/// SQLite-based persistent store.
///
/// The connection sits behind an async mutex; statements are short and the
/// device table is small, so contention stays low.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| {
            StoreError::OperationFailed(format!("failed to open database: {}", e))
        })?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::OperationFailed(format!("failed to set pragmas: {}", e)))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite store for testing.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::OperationFailed(format!("failed to open in-memory database: {}", e))
        })?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to create schema_version: {}", e)))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| StoreError::OperationFailed(format!("failed to read schema version: {}", e)))?;

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trusted_devices (
                device_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                device_type TEXT NOT NULL,
                public_key TEXT NOT NULL UNIQUE,
                exchange_key TEXT NOT NULL,
                shared_secret BLOB NOT NULL,
                paired_at TEXT NOT NULL,
                last_auth_at TEXT,
                last_seen_at TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                ipv4 TEXT,
                ipv6 TEXT
            );
            "#,
        )
        .map_err(|e| StoreError::OperationFailed(format!("migration v1 failed: {}", e)))?;

        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to record schema version: {}", e)))?;

        Ok(())
    }

    fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<RawDevice> {
        Ok(RawDevice {
            device_id: row.get(0)?,
            name: row.get(1)?,
            device_type: row.get(2)?,
            public_key: row.get(3)?,
            exchange_key: row.get(4)?,
            shared_secret: row.get(5)?,
            paired_at: row.get(6)?,
            last_auth_at: row.get(7)?,
            last_seen_at: row.get(8)?,
            enabled: row.get(9)?,
            ipv4: row.get(10)?,
            ipv6: row.get(11)?,
        })
    }

    async fn query_one(
        &self,
        sql: &str,
        key: &str,
    ) -> Result<Option<TrustedDevice>, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(sql, params![key], Self::row_to_device)
            .optional()
            .map_err(op_failed)?;
        raw.map(RawDevice::into_device).transpose()
    }

    async fn update(
        &self,
        sql: &str,
        value: &(dyn rusqlite::ToSql + Sync),
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(sql, params![value, device_id])
            .map_err(op_failed)?;
        Ok(rows > 0)
    }
}

/// Row as read from SQLite, before timestamp and key-length validation.
struct RawDevice {
    device_id: String,
    name: String,
    device_type: String,
    public_key: String,
    exchange_key: String,
    shared_secret: Vec<u8>,
    paired_at: String,
    last_auth_at: Option<String>,
    last_seen_at: Option<String>,
    enabled: bool,
    ipv4: Option<String>,
    ipv6: Option<String>,
}

impl RawDevice {
    fn into_device(self) -> Result<TrustedDevice, StoreError> {
        let shared_secret: [u8; 32] = self.shared_secret.as_slice().try_into().map_err(|_| {
            StoreError::DataCorruption(format!(
                "shared secret for {} has length {}",
                self.device_id,
                self.shared_secret.len()
            ))
        })?;
        Ok(TrustedDevice {
            paired_at: parse_time(&self.paired_at)?,
            last_auth_at: self.last_auth_at.as_deref().map(parse_time).transpose()?,
            last_seen_at: self.last_seen_at.as_deref().map(parse_time).transpose()?,
            device_id: self.device_id,
            name: self.name,
            device_type: self.device_type,
            public_key: self.public_key,
            exchange_key: self.exchange_key,
            shared_secret,
            enabled: self.enabled,
            ipv4: self.ipv4,
            ipv6: self.ipv6,
        })
    }
}

/// Fixed-width UTC form, so text ordering matches time ordering.
fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::DataCorruption(format!("invalid timestamp {value:?}: {e}")))
}

fn op_failed(e: rusqlite::Error) -> StoreError {
    StoreError::OperationFailed(e.to_string())
}

// ============================================================================
// Store Trait Implementation
// ============================================================================

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn find_by_id(&self, device_id: &str) -> Result<Option<TrustedDevice>, StoreError> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM trusted_devices WHERE device_id = ?1");
        self.query_one(&sql, device_id).await
    }

    async fn find_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<TrustedDevice>, StoreError> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM trusted_devices WHERE public_key = ?1");
        self.query_one(&sql, public_key).await
    }

    async fn exists(&self, device_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM trusted_devices WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .map_err(op_failed)?;
        Ok(count > 0)
    }

    async fn insert(&self, device: TrustedDevice) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "INSERT INTO trusted_devices ({DEVICE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        let result = conn.execute(
            &sql,
            params![
                device.device_id,
                device.name,
                device.device_type,
                device.public_key,
                device.exchange_key,
                device.shared_secret.as_slice(),
                format_time(&device.paired_at),
                device.last_auth_at.as_ref().map(format_time),
                device.last_seen_at.as_ref().map(format_time),
                device.enabled,
                device.ipv4,
                device.ipv6,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::AlreadyExists(device.device_id))
            }
            Err(e) => Err(op_failed(e)),
        }
    }

    async fn mark_authenticated(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.update(
            "UPDATE trusted_devices SET last_auth_at = ?1, last_seen_at = ?1 WHERE device_id = ?2",
            &format_time(&at),
            device_id,
        )
        .await
    }

    async fn mark_seen(&self, device_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update(
            "UPDATE trusted_devices SET last_seen_at = ?1 WHERE device_id = ?2",
            &format_time(&at),
            device_id,
        )
        .await
    }

    async fn set_enabled(&self, device_id: &str, enabled: bool) -> Result<bool, StoreError> {
        self.update(
            "UPDATE trusted_devices SET enabled = ?1 WHERE device_id = ?2",
            &enabled,
            device_id,
        )
        .await
    }

    async fn delete(&self, device_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM trusted_devices WHERE device_id = ?1",
                params![device_id],
            )
            .map_err(op_failed)?;
        Ok(rows > 0)
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM trusted_devices", [])
            .map_err(op_failed)
    }

    async fn list(&self) -> Result<Vec<TrustedDevice>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM trusted_devices ORDER BY paired_at, device_id");
        let mut stmt = conn.prepare(&sql).map_err(op_failed)?;
        let rows = stmt
            .query_map([], Self::row_to_device)
            .map_err(op_failed)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(op_failed)?;
        rows.into_iter().map(RawDevice::into_device).collect()
    }
}
