use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tokio::task;
use tracing::{debug, warn};

use super::{ExpiryMode, RecordStream, SessionRecord, Storage};
use crate::error::{Result, SessionError, token_preview};

/// Rows fetched per round trip by [`SqliteStorage::list_active`].
const LIST_PAGE_SIZE: i64 = 256;

/// SQLite-based session storage
///
/// Rows are never physically removed by [`Storage::delete`]: the `active`
/// flag is cleared and `deleted_at` stamped so the history stays auditable.
/// SQLite has no TTL of its own, so this backend needs an
/// [`ExpiryCoordinator`](super::ExpiryCoordinator).
pub struct SqliteStorage {
    /// Path to the SQLite database file
    db_path: PathBuf,
    closed: AtomicBool,
}

/// Open a SQLite connection with standard pragmas (busy_timeout).
fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("failed to open database: {}", db_path.display()))
        .map_err(unavailable)?;
    conn.execute_batch("PRAGMA busy_timeout=5000;")
        .context("failed to set busy_timeout")
        .map_err(unavailable)?;
    Ok(conn)
}

fn unavailable(e: anyhow::Error) -> SessionError {
    SessionError::BackendUnavailable(format!("{:#}", e))
}

/// Map a driver error to the storage taxonomy.
fn backend_error(e: rusqlite::Error) -> SessionError {
    SessionError::BackendUnavailable(format!("sqlite: {}", e))
}

/// Timestamps are stored as nanoseconds since the epoch (years 1677..2262).
fn to_nanos(ts: DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| SessionError::Config(format!("timestamp outside storable range: {}", ts)))
}

fn from_nanos(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let mut record = SessionRecord {
        token: row.get("token")?,
        key: row.get("key")?,
        ip: row.get("ip")?,
        issued_at: from_nanos(row.get("issued_at")?),
        expires_at: from_nanos(row.get("expires_at")?),
        expiry_in: 0,
    };
    record.refresh_expiry(Utc::now());
    Ok(record)
}

impl SqliteStorage {
    /// Create a new SQLite storage at the given path
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        // Create parent directories if they don't exist
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))
                .map_err(unavailable)?;
        }

        let storage = Self {
            db_path,
            closed: AtomicBool::new(false),
        };
        storage.init_schema()?;

        Ok(storage)
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::BackendUnavailable(
                "sqlite session store is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = open_connection(&self.db_path)?;

        // Enable WAL mode for better concurrent read/write performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("failed to set WAL mode")
            .map_err(unavailable)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT NOT NULL UNIQUE,
                key TEXT NOT NULL,
                ip TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )
        .context("failed to create sessions table")
        .map_err(unavailable)?;

        // Recovery scans walk active rows by id
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(active, id)",
            [],
        )
        .context("failed to create active index")
        .map_err(unavailable)?;

        // Migration: audit column (nullable, safe to run multiple times)
        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(sessions)")
            .and_then(|mut stmt| {
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(1))?
                    .collect::<rusqlite::Result<Vec<_>>>();
                names
            })
            .map_err(backend_error)?;

        if !columns.iter().any(|c| c == "deleted_at") {
            conn.execute("ALTER TABLE sessions ADD COLUMN deleted_at INTEGER", [])
                .context("failed to add deleted_at column")
                .map_err(unavailable)?;
            debug!("migrated: added deleted_at column");
        }

        debug!(path = %self.db_path.display(), "initialized SQLite storage");

        Ok(())
    }

    /// Physically remove soft-deleted rows deleted before `cutoff`.
    ///
    /// Returns the number of rows removed.
    pub async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.ensure_open()?;
        let cutoff = to_nanos(cutoff)?;
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> Result<usize> {
            let conn = open_connection(&db_path)?;
            let removed = conn
                .execute(
                    "DELETE FROM sessions WHERE active = 0 AND deleted_at IS NOT NULL AND deleted_at < ?1",
                    [cutoff],
                )
                .map_err(backend_error)?;
            debug!(removed, "purged inactive sessions");
            Ok(removed)
        })
        .await
        .context("spawn_blocking failed")?
    }

    /// Fetch the page of active rows after `cursor`, plus the cursor for the next page.
    async fn next_page(
        db_path: PathBuf,
        cursor: Option<i64>,
    ) -> Result<Option<(Vec<SessionRecord>, Option<i64>)>> {
        let Some(after) = cursor else {
            return Ok(None);
        };

        let page = task::spawn_blocking(move || -> Result<Vec<(i64, SessionRecord)>> {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, token, key, ip, issued_at, expires_at
                     FROM sessions
                     WHERE active = 1 AND id > ?1
                     ORDER BY id
                     LIMIT ?2",
                )
                .map_err(backend_error)?;

            let rows = stmt
                .query_map(rusqlite::params![after, LIST_PAGE_SIZE], |row| {
                    Ok((row.get::<_, i64>("id")?, row_to_record(row)?))
                })
                .map_err(backend_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend_error)?;

            Ok(rows)
        })
        .await
        .context("spawn_blocking failed")??;

        let next = match page.last() {
            Some((id, _)) if page.len() as i64 == LIST_PAGE_SIZE => Some(*id),
            _ => None,
        };
        let records = page.into_iter().map(|(_, record)| record).collect();
        Ok(Some((records, next)))
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    fn name(&self) -> &str {
        "relational"
    }

    fn expiry_mode(&self) -> ExpiryMode {
        ExpiryMode::Manual
    }

    async fn put(&self, record: &SessionRecord, _ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let issued_at = to_nanos(record.issued_at)?;
        let expires_at = to_nanos(record.expires_at)?;
        let record = record.clone();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(&db_path)?;

            let inserted = conn.execute(
                "INSERT INTO sessions (token, key, ip, issued_at, expires_at, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                rusqlite::params![
                    record.token,
                    record.key,
                    record.ip,
                    issued_at,
                    expires_at,
                ],
            );

            match inserted {
                Ok(_) => {
                    debug!(token = token_preview(&record.token), "saved session");
                    Ok(())
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    warn!(token = token_preview(&record.token), "token already present");
                    Err(SessionError::duplicate(&record.token))
                }
                Err(e) => Err(backend_error(e)),
            }
        })
        .await
        .context("spawn_blocking failed")??;

        Ok(())
    }

    async fn get(&self, token: &str) -> Result<SessionRecord> {
        self.ensure_open()?;
        let token = token.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> Result<SessionRecord> {
            let conn = open_connection(&db_path)?;

            let record = conn
                .query_row(
                    "SELECT token, key, ip, issued_at, expires_at
                     FROM sessions
                     WHERE token = ?1 AND active = 1",
                    [&token],
                    row_to_record,
                )
                .optional()
                .map_err(backend_error)?;

            record.ok_or_else(|| SessionError::not_found(&token))
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn delete(&self, token: &str) -> Result<()> {
        self.ensure_open()?;
        let deleted_at = to_nanos(Utc::now())?;
        let token = token.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(&db_path)?;
            let changes = conn
                .execute(
                    "UPDATE sessions SET active = 0, deleted_at = ?2
                     WHERE token = ?1 AND active = 1",
                    rusqlite::params![token, deleted_at],
                )
                .map_err(backend_error)?;
            if changes > 0 {
                debug!(token = token_preview(&token), "deactivated session");
            }
            Ok(())
        })
        .await
        .context("spawn_blocking failed")??;

        Ok(())
    }

    fn list_active(&self) -> RecordStream {
        if let Err(e) = self.ensure_open() {
            return stream::once(async move { Err(e) }).boxed();
        }
        let db_path = self.db_path.clone();

        // Keyset pagination over row ids; each page is one blocking query.
        stream::try_unfold(Some(0i64), move |cursor| Self::next_page(db_path.clone(), cursor))
            .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, SessionError>)))
            .try_flatten()
            .boxed()
    }

    async fn close(&self) -> Result<()> {
        // Connections are per operation, so closing only refuses new work
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(path = %self.db_path.display(), "closed SQLite storage");
        }
        Ok(())
    }
}
