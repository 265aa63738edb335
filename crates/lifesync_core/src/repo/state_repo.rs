//! Key/value state repository and SQLite implementation.
//!
//! # Responsibility
//! - Persist named blobs (dataset snapshot, backend configuration,
//!   migration markers) in the `kv_state` table.
//! - Keep a short history of sync runs in `sync_runs`.
//!
//! # Invariants
//! - A repository is only constructed over a fully migrated connection.
//! - `save_value` is an upsert; readers never observe a partial blob.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::record::Timestamp;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

const KV_TABLE: &str = "kv_state";
const KV_COLUMNS: [&str; 3] = ["key", "value", "updated_at"];
const SYNC_RUNS_TABLE: &str = "sync_runs";
const SYNC_RUNS_COLUMNS: [&str; 4] = ["backend", "outcome", "message", "finished_at"];
const SYNC_RUNS_RETAINED: i64 = 200;

pub type RepoResult<T> = Result<T, RepoError>;

/// Generic repository error for local state persistence.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    Codec(serde_json::Error),
    UnsupportedPayloadVersion {
        key: String,
        found: u32,
        latest_supported: u32,
    },
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "connection schema version {actual_version} is not initialized to {expected_version}"
            ),
            Self::MissingRequiredTable(table) => write!(f, "required table missing: {table}"),
            Self::MissingRequiredColumn { table, column } => {
                write!(f, "required column missing: {table}.{column}")
            }
            Self::Codec(err) => write!(f, "stored payload could not be encoded/decoded: {err}"),
            Self::UnsupportedPayloadVersion {
                key,
                found,
                latest_supported,
            } => write!(
                f,
                "stored payload `{key}` has schema version {found}, newer than supported {latest_supported}"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted state: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value)
    }
}

/// One finished sync run as kept in local history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRunRecord {
    pub backend: String,
    pub outcome: String,
    pub message: String,
    pub finished_at: Timestamp,
}

/// Persistence contract for local state blobs and sync history.
pub trait StateRepository: Send {
    fn load_value(&self, key: &str) -> RepoResult<Option<String>>;
    fn save_value(&self, key: &str, value: &str) -> RepoResult<()>;
    /// Removes one key. Returns whether a value existed.
    fn delete_value(&self, key: &str) -> RepoResult<bool>;
    fn record_sync_run(&self, run: &SyncRunRecord) -> RepoResult<()>;
    /// Most recent runs first.
    fn recent_sync_runs(&self, limit: u32) -> RepoResult<Vec<SyncRunRecord>>;
}

/// State repository shared between the local store, settings and sync.
pub type SharedStateRepository = Arc<Mutex<dyn StateRepository>>;

/// Wraps a repository into the shared handle used across the crate.
pub fn share<R: StateRepository + 'static>(repo: R) -> SharedStateRepository {
    Arc::new(Mutex::new(repo))
}

/// SQLite-backed state repository owning its connection.
#[derive(Debug)]
pub struct SqliteStateRepository {
    conn: Connection,
}

impl SqliteStateRepository {
    /// Wraps a migrated connection.
    ///
    /// # Errors
    /// - `UninitializedConnection` when migrations have not been applied.
    /// - `MissingRequiredTable` / `MissingRequiredColumn` when the schema
    ///   does not match what this repository queries.
    pub fn try_new(conn: Connection) -> RepoResult<Self> {
        let expected_version = latest_version();
        let actual_version: u32 =
            conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if actual_version < expected_version {
            return Err(RepoError::UninitializedConnection {
                expected_version,
                actual_version,
            });
        }

        ensure_table(&conn, KV_TABLE, &KV_COLUMNS)?;
        ensure_table(&conn, SYNC_RUNS_TABLE, &SYNC_RUNS_COLUMNS)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StateRepository for SqliteStateRepository {
    fn load_value(&self, key: &str) -> RepoResult<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1;",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn save_value(&self, key: &str, value: &str) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO kv_state (key, value, updated_at)
             VALUES (?1, ?2, (strftime('%s', 'now') * 1000))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at;",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_value(&self, key: &str) -> RepoResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM kv_state WHERE key = ?1;", [key])?;
        Ok(changed > 0)
    }

    fn record_sync_run(&self, run: &SyncRunRecord) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO sync_runs (backend, outcome, message, finished_at)
             VALUES (?1, ?2, ?3, ?4);",
            params![
                run.backend.as_str(),
                run.outcome.as_str(),
                run.message.as_str(),
                run.finished_at.timestamp_millis(),
            ],
        )?;
        self.conn.execute(
            "DELETE FROM sync_runs
             WHERE id NOT IN (
                SELECT id FROM sync_runs ORDER BY finished_at DESC, id DESC LIMIT ?1
             );",
            [SYNC_RUNS_RETAINED],
        )?;
        Ok(())
    }

    fn recent_sync_runs(&self, limit: u32) -> RepoResult<Vec<SyncRunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT backend, outcome, message, finished_at
             FROM sync_runs
             ORDER BY finished_at DESC, id DESC
             LIMIT ?1;",
        )?;
        let mut rows = stmt.query([i64::from(limit)])?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next()? {
            let millis: i64 = row.get("finished_at")?;
            let finished_at = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "invalid finished_at value `{millis}` in sync_runs.finished_at"
                ))
            })?;
            runs.push(SyncRunRecord {
                backend: row.get("backend")?,
                outcome: row.get("outcome")?,
                message: row.get("message")?,
                finished_at,
            });
        }
        Ok(runs)
    }
}

fn ensure_table(
    conn: &Connection,
    table: &'static str,
    columns: &[&'static str],
) -> RepoResult<()> {
    if !table_exists(conn, table)? {
        return Err(RepoError::MissingRequiredTable(table));
    }
    for column in columns {
        if !table_has_column(conn, table, column)? {
            return Err(RepoError::MissingRequiredColumn {
                table,
                column: *column,
            });
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
