//! # SQLite Schema for WatchDB
//!
//! Schema definition and database initialization. Besides a small amount
//! of fixed infrastructure, the schema is generated per collection when a
//! collection is registered.
//!
//! ## Table Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Schema Overview                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  fixed:                                                              │
//! │   watch_meta          watch_rev_seq         watch_outbox             │
//! │   ┌────────────┐      ┌──────────────┐      ┌────────────────┐       │
//! │   │ key (PK)   │      │ rev          │      │ seq (PK, auto) │       │
//! │   │ value      │      │ (single row) │      │ channel        │       │
//! │   └────────────┘      └──────────────┘      │ payload        │       │
//! │                                             └────────────────┘       │
//! │  per collection C:                                                   │
//! │   coll_C                          coll_C_idx_<name>                  │
//! │   ┌──────────────────┐            ┌─────────────────────────┐        │
//! │   │ key (PK)         │◄───────────│ key                     │        │
//! │   │ value BLOB       │            │ index_value             │        │
//! │   │ created_rev      │            │ PK (index_value, key)   │        │
//! │   │ updated_rev      │            └─────────────────────────┘        │
//! │   │ created_ms       │                                               │
//! │   │ updated_ms       │                                               │
//! │   └──────────────────┘                                               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why a single-row sequence table?
//!
//! `watch_rev_seq` holds one row whose `rev` column is bumped inside each
//! writing transaction. Because all writes serialize through one
//! connection, the bump cannot race, and because it happens inside the
//! transaction, a rollback also rolls back the revision: committed
//! revisions are gap-free in commit order.
//!
//! ### Why an outbox instead of an in-process broadcast?
//!
//! Notifications are appended to `watch_outbox` in the same transaction
//! as the mutation they describe. Listeners therefore observe exactly the
//! committed changes, in commit order, with nothing invented and nothing
//! lost: a rollback takes its outbox rows with it. The drain thread
//! deletes rows once routed; the outbox is a hand-off buffer, not a log.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::{Connection, OpenFlags};

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Bumped on breaking schema changes; there is no
/// migration support, a mismatch is surfaced as `Fatal`.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// Fixed DDL
// =============================================================================

/// Key/value metadata, currently just the schema version.
const CREATE_META: &str = r#"
CREATE TABLE IF NOT EXISTS watch_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// The global revision sequence. Exactly one row; `rev` is bumped by
/// every mutating statement inside its transaction.
const CREATE_REV_SEQ: &str = r#"
CREATE TABLE IF NOT EXISTS watch_rev_seq (
    rev INTEGER NOT NULL
)
"#;

/// The transactional outbox. One row per affected key per mutation,
/// appended inside the mutating transaction and deleted after routing.
///
/// `seq` is the canonical notification order: AUTOINCREMENT guarantees
/// values are never reused even after drained rows are deleted.
const CREATE_OUTBOX: &str = r#"
CREATE TABLE IF NOT EXISTS watch_outbox (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    payload TEXT NOT NULL
)
"#;

// =============================================================================
// Identifier Validation and Table Naming
// =============================================================================

/// Validates a collection or index identifier.
///
/// Identifiers are spliced into DDL and query strings, so they are
/// restricted to `[a-z0-9_]`, starting with a letter. Anything else is a
/// `Fatal` registration error.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_lowercase()
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Fatal(format!(
            "invalid identifier '{name}': must match [a-z][a-z0-9_]*"
        )))
    }
}

/// Row table name for a collection.
pub(crate) fn row_table(collection: &str) -> String {
    format!("coll_{collection}")
}

/// Index table name for a collection index.
pub(crate) fn index_table(collection: &str, index: &str) -> String {
    format!("coll_{collection}_idx_{index}")
}

/// Creates the row table and index tables for a collection.
///
/// Idempotent; registering the same collection shape twice (for example
/// from two processes sharing a database file) is safe.
pub(crate) fn create_collection_tables(
    conn: &Connection,
    collection: &str,
    indexes: &[&str],
) -> Result<()> {
    validate_identifier(collection)?;

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            key         TEXT PRIMARY KEY,
            value       BLOB NOT NULL,
            created_rev INTEGER NOT NULL,
            updated_rev INTEGER NOT NULL,
            created_ms  INTEGER NOT NULL,
            updated_ms  INTEGER NOT NULL
        )",
        row_table(collection)
    ))?;

    // Revision scans back both sort targets in list operations.
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS {table}_created ON {table}(created_rev);
         CREATE INDEX IF NOT EXISTS {table}_updated ON {table}(updated_rev)",
        table = row_table(collection)
    ))?;

    for index in indexes {
        validate_identifier(index)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                index_value TEXT NOT NULL,
                key         TEXT NOT NULL,
                PRIMARY KEY (index_value, key)
            )",
            index_table(collection, index)
        ))?;
    }

    Ok(())
}

// =============================================================================
// Database Location
// =============================================================================

/// Counter making in-memory database names unique within the process.
static MEMORY_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Where the database lives. All connections for one `WatchDb` (writer,
/// reader pool, listener) are opened from the same location.
#[derive(Debug, Clone)]
pub(crate) enum DbLocation {
    /// A database file on disk, opened in WAL mode.
    File(PathBuf),
    /// A shared-cache in-memory database, addressed by URI. Lives as
    /// long as at least one connection stays open (the writer's does).
    Memory(String),
}

impl DbLocation {
    /// A file-backed location.
    pub(crate) fn file(path: impl AsRef<Path>) -> Self {
        DbLocation::File(path.as_ref().to_path_buf())
    }

    /// A fresh process-unique in-memory location.
    pub(crate) fn memory() -> Self {
        let n = MEMORY_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
        DbLocation::Memory(format!(
            "file:watchdb_mem_{}_{}?mode=memory&cache=shared",
            std::process::id(),
            n
        ))
    }

    /// Opens a read-write connection to this location.
    pub(crate) fn connect(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = match self {
            DbLocation::File(path) => Connection::open_with_flags(path, flags)?,
            DbLocation::Memory(uri) => Connection::open_with_flags(uri, flags)?,
        };
        self.apply_pragmas(&conn)?;
        Ok(conn)
    }

    /// Opens a read-only connection to this location.
    pub(crate) fn connect_read_only(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = match self {
            DbLocation::File(path) => Connection::open_with_flags(path, flags)?,
            DbLocation::Memory(uri) => Connection::open_with_flags(uri, flags)?,
        };
        self.apply_pragmas(&conn)?;
        Ok(conn)
    }

    fn apply_pragmas(&self, conn: &Connection) -> Result<()> {
        // WAL lets readers see a consistent snapshot while the writer
        // commits; it only applies to file-backed databases.
        if matches!(self, DbLocation::File(_)) {
            conn.execute_batch("PRAGMA journal_mode = WAL")?;
            conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        }
        conn.execute_batch("PRAGMA busy_timeout = 5000")?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(())
    }
}

// =============================================================================
// Initialization
// =============================================================================

/// Creates the fixed tables, seeds the revision sequence, and verifies
/// the schema version. Called once on the writer's connection before any
/// other connection is opened.
pub(crate) fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_META)?;
    conn.execute_batch(CREATE_REV_SEQ)?;
    conn.execute_batch(CREATE_OUTBOX)?;

    // Seed the sequence exactly once.
    let seq_rows: i64 =
        conn.query_row("SELECT COUNT(*) FROM watch_rev_seq", [], |row| row.get(0))?;
    if seq_rows == 0 {
        conn.execute("INSERT INTO watch_rev_seq (rev) VALUES (0)", [])?;
    }

    verify_or_set_version(conn)
}

fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<i32> = conn
        .query_row(
            "SELECT value FROM watch_meta WHERE key = 'schema_version'",
            [],
            |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            },
        )
        .ok();

    match existing {
        None => {
            conn.execute(
                "INSERT INTO watch_meta (key, value) VALUES ('schema_version', ?)",
                [SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        Some(v) if v == SCHEMA_VERSION => Ok(()),
        Some(v) => Err(Error::Fatal(format!(
            "schema version mismatch: database has version {v}, this build requires {SCHEMA_VERSION}"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
