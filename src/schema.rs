//! # SQLite Schema for Kafkaesque
//!
//! This module defines the database layout and handles initialization. Every
//! topic owns two *collections*, each backed by its own table:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  collections              c_<topic>               c_<topic>_subscribers │
//! │  ┌──────────────┐         ┌──────────────────┐    ┌──────────────────┐  │
//! │  │ name (PK)    │────────►│ position (PK)    │    │ subscriber (PK)  │  │
//! │  │ capped       │         │ event            │    │ last_position    │  │
//! │  │ size_bytes   │         │ message BLOB     │    │ updated_ms       │  │
//! │  │ max_entries  │         │ sentinel         │    └──────────────────┘  │
//! │  └──────────────┘         │ size_bytes       │                          │
//! │                           │ created_ms       │                          │
//! │                           └──────────────────┘                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why AUTOINCREMENT?
//!
//! Plain `INTEGER PRIMARY KEY` may hand out the rowid of a deleted row again.
//! Capped eviction deletes the oldest rows, so without `AUTOINCREMENT` an empty
//! log could restart at a position a durable subscriber has already
//! acknowledged. `AUTOINCREMENT` keeps positions strictly increasing forever.
//!
//! ### Why a registry table?
//!
//! `ensure_collection` must be idempotent and must remember how a collection
//! was created (capped or not, its bounds) across restarts. The registry is
//! the source of truth for that.

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::{CollectionOptions, TopicOptions};
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Registry of provisioned collections.
///
/// - `name`: collection name (topic name, or `<topic>_subscribers`)
/// - `capped`: 1 for entry logs, 0 for offset collections
/// - `size_bytes`: retention bound in payload bytes (capped only)
/// - `max_entries`: optional retention bound in entries (capped only)
const CREATE_COLLECTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    name        TEXT PRIMARY KEY,
    capped      INTEGER NOT NULL,
    size_bytes  INTEGER,
    max_entries INTEGER,
    created_ms  INTEGER NOT NULL
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS kafkaesque_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Entry log of one topic.
///
/// `sentinel` marks the no-op entry seeded into an empty log so that "start of
/// stream" has a concrete position; sentinels are never delivered.
fn create_entries_table(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS "{table}" (
    position   INTEGER PRIMARY KEY AUTOINCREMENT,
    event      TEXT NOT NULL,
    message    BLOB NOT NULL,
    sentinel   INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL,
    created_ms INTEGER NOT NULL
)
"#
    )
}

/// Offset records of one topic's durable subscribers.
fn create_offsets_table(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS "{table}" (
    subscriber    TEXT PRIMARY KEY,
    last_position INTEGER NOT NULL,
    updated_ms    INTEGER NOT NULL
)
"#
    )
}

// =============================================================================
// Naming
// =============================================================================

/// Maps a collection name to its table name.
///
/// Collection names are interpolated into SQL, so anything outside
/// `[A-Za-z0-9_-]` is rejected here rather than escaped.
pub fn collection_table(collection: &str) -> Result<String> {
    if collection.is_empty()
        || !collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Schema(format!(
            "invalid collection name '{collection}'"
        )));
    }
    Ok(format!("c_{collection}"))
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the Kafkaesque schema applied.
///
/// `Database` owns its `Connection`; dropping it closes the connection. The
/// store actor takes the connection out with [`Database::into_connection`].
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL lets other processes read while the actor writes.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_COLLECTIONS)?;

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM kafkaesque_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO kafkaesque_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper, handing the initialized connection to the caller.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Collection Provisioning
// =============================================================================

/// Creates a collection if it is absent.
///
/// Returns `true` if the collection was created by this call and `false` if it
/// already existed. An existing collection keeps the options it was created
/// with; the `options` argument only applies on creation.
pub fn ensure_collection(
    conn: &Connection,
    collection: &str,
    options: CollectionOptions,
) -> Result<bool> {
    let table = collection_table(collection)?;

    let known: Option<i64> = conn
        .query_row(
            "SELECT capped FROM collections WHERE name = ?",
            [collection],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(capped) = known {
        let wants_capped = matches!(options, CollectionOptions::Capped(_));
        if (capped != 0) != wants_capped {
            return Err(Error::Schema(format!(
                "collection '{collection}' already exists with a different kind"
            )));
        }
        return Ok(false);
    }

    let now = crate::types::current_time_ms() as i64;
    let tx = conn.unchecked_transaction()?;
    match options {
        CollectionOptions::Capped(topic) => {
            tx.execute_batch(&create_entries_table(&table))?;
            tx.execute(
                "INSERT INTO collections (name, capped, size_bytes, max_entries, created_ms)
                 VALUES (?, 1, ?, ?, ?)",
                params![
                    collection,
                    topic.size_bytes as i64,
                    topic.max_entries.map(|m| m as i64),
                    now
                ],
            )?;
        }
        CollectionOptions::Uncapped => {
            tx.execute_batch(&create_offsets_table(&table))?;
            tx.execute(
                "INSERT INTO collections (name, capped, size_bytes, max_entries, created_ms)
                 VALUES (?, 0, NULL, NULL, ?)",
                params![collection, now],
            )?;
        }
    }
    tx.commit()?;

    Ok(true)
}

/// Loads the retention options a capped collection was created with.
///
/// Returns `None` if the collection is unknown or uncapped.
pub fn load_capped_options(conn: &Connection, collection: &str) -> Result<Option<TopicOptions>> {
    let row: Option<(i64, Option<i64>, Option<i64>)> = conn
        .query_row(
            "SELECT capped, size_bytes, max_entries FROM collections WHERE name = ?",
            [collection],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    Ok(match row {
        Some((1, size_bytes, max_entries)) => Some(TopicOptions {
            size_bytes: size_bytes.unwrap_or(0).max(0) as u64,
            max_entries: max_entries.map(|m| m.max(0) as u64),
        }),
        _ => None,
    })
}

// =============================================================================
// Tests
// =============================================================================
