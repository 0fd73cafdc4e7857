//! Session store: persisted pairing session rows.
//!
//! A passive boundary: single-row reads and writes, last writer wins. Only
//! the owning session actor writes a given row.
//!
//! Uses `spawn_blocking` for async-safe SQLite access.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pairline_protocol::{PairingSession, PairingStatus, SessionError};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(
        &self,
        tenant_id: &str,
        instance_name: &str,
    ) -> Result<Option<PairingSession>, StoreError>;

    async fn upsert(&self, session: &PairingSession) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    async fn delete(&self, tenant_id: &str, instance_name: &str) -> Result<bool, StoreError>;

    /// All rows, used for restart recovery and status listings.
    async fn list(&self) -> Result<Vec<PairingSession>, StoreError>;
}

/// SQLite-backed store. Opens a connection per operation so callers never
/// share a `Connection` across threads.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Blocking listing for CLI subcommands that run outside the server.
    pub fn list_blocking(&self) -> Result<Vec<PairingSession>, StoreError> {
        let conn = open(&self.db_path)?;
        list_rows(&conn)
    }

    /// Blocking lookup for CLI subcommands that run outside the server.
    pub fn get_blocking(
        &self,
        tenant_id: &str,
        instance_name: &str,
    ) -> Result<Option<PairingSession>, StoreError> {
        let conn = open(&self.db_path)?;
        get_row(&conn, tenant_id, instance_name)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(
        &self,
        tenant_id: &str,
        instance_name: &str,
    ) -> Result<Option<PairingSession>, StoreError> {
        let db_path = self.db_path.clone();
        let tenant_id = tenant_id.to_string();
        let instance_name = instance_name.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            get_row(&conn, &tenant_id, &instance_name)
        })
        .await?
    }

    async fn upsert(&self, session: &PairingSession) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let session = session.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            upsert_row(&conn, &session)
        })
        .await?
    }

    async fn delete(&self, tenant_id: &str, instance_name: &str) -> Result<bool, StoreError> {
        let db_path = self.db_path.clone();
        let tenant_id = tenant_id.to_string();
        let instance_name = instance_name.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let removed = conn.execute(
                "DELETE FROM pairing_sessions WHERE tenant_id = ?1 AND instance_name = ?2",
                params![tenant_id, instance_name],
            )?;
            Ok(removed > 0)
        })
        .await?
    }

    async fn list(&self) -> Result<Vec<PairingSession>, StoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            list_rows(&conn)
        })
        .await?
    }
}

pub(crate) fn open(db_path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

const SELECT_COLUMNS: &str = "SELECT id, tenant_id, instance_name, status, qr_payload, qr_issued_at,
        connected_at, last_activity_at, last_error, created_at, updated_at
 FROM pairing_sessions";

fn get_row(
    conn: &Connection,
    tenant_id: &str,
    instance_name: &str,
) -> Result<Option<PairingSession>, StoreError> {
    let sql = format!("{} WHERE tenant_id = ?1 AND instance_name = ?2", SELECT_COLUMNS);
    let raw = conn
        .query_row(&sql, params![tenant_id, instance_name], RawRow::from_row)
        .optional()?;
    raw.map(RawRow::decode).transpose()
}

fn list_rows(conn: &Connection) -> Result<Vec<PairingSession>, StoreError> {
    let sql = format!("{} ORDER BY tenant_id, instance_name", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map([], RawRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawRow::decode).collect()
}

fn upsert_row(conn: &Connection, session: &PairingSession) -> Result<(), StoreError> {
    let last_error = session
        .last_error
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO pairing_sessions (id, tenant_id, instance_name, status, qr_payload, qr_issued_at,
                                       connected_at, last_activity_at, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(tenant_id, instance_name) DO UPDATE SET
           status = ?4,
           qr_payload = ?5,
           qr_issued_at = ?6,
           connected_at = ?7,
           last_activity_at = ?8,
           last_error = ?9,
           updated_at = ?11",
        params![
            session.id,
            session.tenant_id,
            session.instance_name,
            session.status.as_str(),
            session.qr_payload,
            session.qr_issued_at.map(|t| t.to_rfc3339()),
            session.connected_at.map(|t| t.to_rfc3339()),
            session.last_activity_at.map(|t| t.to_rfc3339()),
            last_error,
            session.created_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Column values as stored, before parsing into typed fields.
struct RawRow {
    id: String,
    tenant_id: String,
    instance_name: String,
    status: String,
    qr_payload: Option<String>,
    qr_issued_at: Option<String>,
    connected_at: Option<String>,
    last_activity_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            instance_name: row.get(2)?,
            status: row.get(3)?,
            qr_payload: row.get(4)?,
            qr_issued_at: row.get(5)?,
            connected_at: row.get(6)?,
            last_activity_at: row.get(7)?,
            last_error: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<PairingSession, StoreError> {
        let status = PairingStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {:?}", self.status)))?;
        let last_error: Option<SessionError> = self
            .last_error
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(PairingSession {
            id: self.id,
            tenant_id: self.tenant_id,
            instance_name: self.instance_name,
            status,
            qr_payload: self.qr_payload,
            qr_issued_at: parse_optional_ts(self.qr_issued_at)?,
            connected_at: parse_optional_ts(self.connected_at)?,
            last_activity_at: parse_optional_ts(self.last_activity_at)?,
            last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", value, e)))
}

fn parse_optional_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_ts).transpose()
}
