use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
pub use rusqlite::Connection;
use rusqlite::OpenFlags;

use crate::error::ReconcileError;

/// Minimal shape of the host application's registration tables. Used to seed
/// a registry mirror (`extfix init-store`) and the test fixtures; the live
/// registry is created and owned by the host application's installer.
const REGISTRY_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS extension (
    extension_id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    code TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 1,
    UNIQUE (type, code)
);
CREATE INDEX IF NOT EXISTS idx_extension_code ON extension(code);

CREATE TABLE IF NOT EXISTS extension_path (
    extension_path_id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    extension_install_id INTEGER
);
CREATE INDEX IF NOT EXISTS idx_extension_path_path ON extension_path(path);

CREATE TABLE IF NOT EXISTS module (
    module_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    code TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_module_code ON module(code);

CREATE TABLE IF NOT EXISTS user_group (
    user_group_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    permission TEXT NOT NULL DEFAULT '{"access":[],"modify":[]}'
);
"#;

/// Open the registry store, creating parent directories as needed.
/// Connection failures surface as `StoreUnavailable`, fatal for the run.
pub fn open_store(db_path: &Path) -> Result<Connection, ReconcileError> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(error) = fs::create_dir_all(parent)
    {
        return Err(ReconcileError::StoreUnavailable(format!(
            "failed to create {}: {error}",
            parent.display()
        )));
    }

    let connection = Connection::open(db_path).map_err(|error| {
        ReconcileError::StoreUnavailable(format!("failed to open {}: {error}", db_path.display()))
    })?;
    configure_connection(&connection)
        .map_err(|error| ReconcileError::StoreUnavailable(error.to_string()))?;
    Ok(connection)
}

/// Open a store that must already exist. Unlike `open_store`, a missing
/// file is an error rather than a fresh empty database, so a mistyped
/// path never leaves a stray file behind.
pub fn open_existing_store(db_path: &Path) -> Result<Connection, ReconcileError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection = Connection::open_with_flags(db_path, flags).map_err(|error| {
        ReconcileError::StoreUnavailable(format!("failed to open {}: {error}", db_path.display()))
    })?;
    configure_connection(&connection)
        .map_err(|error| ReconcileError::StoreUnavailable(error.to_string()))?;
    Ok(connection)
}

/// In-memory store for tests and dry experiments.
pub fn open_memory_store() -> Result<Connection, ReconcileError> {
    let connection = Connection::open_in_memory()
        .map_err(|error| ReconcileError::StoreUnavailable(error.to_string()))?;
    configure_connection(&connection)
        .map_err(|error| ReconcileError::StoreUnavailable(error.to_string()))?;
    Ok(connection)
}

pub fn init_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(REGISTRY_SCHEMA_SQL)
        .context("failed to initialize registry schema")
}

pub fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

pub fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}

fn configure_connection(connection: &Connection) -> rusqlite::Result<()> {
    connection.busy_timeout(Duration::from_secs(5))?;
    connection.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}
