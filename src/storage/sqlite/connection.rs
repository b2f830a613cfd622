//! Shared connection handling for the `SQLite` backend.
//!
//! One `rusqlite::Connection` per pool key, behind a mutex. Every call runs
//! on the blocking thread pool so the async runtime is never stalled by
//! disk I/O or lock waits.

use crate::config::StoreConfig;
use crate::storage::acquire_lock;
use crate::{Error, Result};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A connection shared by every store using the same pool key.
///
/// `None` once the pool has been released.
pub type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// Default busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Where a `SQLite` URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// Private in-memory database.
    Memory,
    /// Database file.
    File(PathBuf),
}

/// Parses `sqlite://path`, `sqlite:path` and `sqlite::memory:`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for a non-`SQLite` URI or an empty path.
pub fn parse_location(uri: &str) -> Result<DatabaseLocation> {
    let rest = uri
        .strip_prefix("sqlite://")
        .or_else(|| uri.strip_prefix("sqlite:"))
        .ok_or_else(|| Error::InvalidInput("expected a sqlite: URI".to_string()))?;

    match rest {
        "" => Err(Error::InvalidInput("sqlite URI has no path".to_string())),
        ":memory:" => Ok(DatabaseLocation::Memory),
        path => Ok(DatabaseLocation::File(PathBuf::from(path))),
    }
}

/// Configures a `SQLite` connection.
///
/// Defaults to WAL journaling, `NORMAL` synchronous and a 5 second busy
/// timeout; `journal_mode`, `synchronous` and `busy_timeout` driver options
/// override them.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for a malformed `busy_timeout`, or
/// [`Error::OperationFailed`] when an explicitly requested pragma fails.
pub fn configure_connection(conn: &Connection, options: &BTreeMap<String, String>) -> Result<()> {
    // journal_mode returns a row, so errors on the defaults are ignored;
    // in-memory databases report "memory" instead of "wal".
    match options.get("journal_mode") {
        Some(mode) => {
            conn.pragma_update_and_check(None, "journal_mode", mode, |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| Error::operation("sqlite_journal_mode", e))?;
        },
        None => {
            let _ = conn.pragma_update(None, "journal_mode", "WAL");
        },
    }

    match options.get("synchronous") {
        Some(mode) => conn
            .pragma_update(None, "synchronous", mode)
            .map_err(|e| Error::operation("sqlite_synchronous", e))?,
        None => {
            let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        },
    }

    let busy_ms = match options.get("busy_timeout") {
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
            Error::InvalidInput(format!("busy_timeout must be milliseconds, got '{raw}'"))
        })?,
        None => DEFAULT_BUSY_TIMEOUT_MS,
    };
    conn.busy_timeout(Duration::from_millis(busy_ms))
        .map_err(|e| Error::operation("sqlite_busy_timeout", e))?;

    Ok(())
}

/// Opens and configures the shared connection for a store configuration.
///
/// # Errors
///
/// Returns an error if the URI is invalid or the database cannot be opened.
pub async fn open_shared(config: &StoreConfig) -> Result<SharedConnection> {
    let location = parse_location(config.uri())?;
    let options = config.pool.driver_options.clone();

    let connection = tokio::task::spawn_blocking(move || -> Result<Connection> {
        let conn = match &location {
            DatabaseLocation::Memory => Connection::open_in_memory(),
            DatabaseLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::operation("sqlite_create_dir", e))?;
                }
                Connection::open(path)
            },
        }
        .map_err(|e| Error::operation("sqlite_open", e))?;
        configure_connection(&conn, &options)?;
        Ok(conn)
    })
    .await
    .map_err(|e| Error::operation("sqlite_open", e))??;

    Ok(Arc::new(Mutex::new(Some(connection))))
}

/// Runs `f` against the shared connection on the blocking thread pool.
///
/// # Errors
///
/// Returns [`Error::Disconnected`] if the connection was closed, or
/// whatever `f` returns.
pub async fn run_blocking<T, F>(shared: &SharedConnection, operation: &'static str, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || {
        let mut guard = acquire_lock(&shared);
        let conn = guard.as_mut().ok_or(Error::Disconnected)?;
        f(conn)
    })
    .await
    .map_err(|e| Error::operation(operation, e))?
}
