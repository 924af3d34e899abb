//! # Log Storage
//!
//! The synchronous storage layer behind the store actor. It implements the log
//! store contract the broker consumes:
//!
//! - `append(event, message) → Entry`
//! - `latest() → Option<Position>` and `seed_sentinel()` for empty logs
//! - `read_after(position, limit) → Vec<Entry>` (exclusive lower bound)
//! - `ensure_collection(name, options)`
//!
//! plus the offset records of durable subscribers:
//!
//! - `get_offset(subscriber) → Option<Position>`
//! - `acknowledge(subscriber, position)`
//!
//! ## Capped Retention
//!
//! Entry collections are capped. After each append the oldest entries are
//! evicted until the payload bytes fit the collection's `size_bytes` bound and
//! the entry count fits `max_entries`. The entry just appended is never
//! evicted, so an oversized single message still lands.
//!
//! Running totals are cached per collection so eviction does not have to
//! re-sum the table on every append.
//!
//! ## Thread Safety
//!
//! `LogStorage` is NOT thread-safe. It is owned by the store actor thread; all
//! other access goes through [`StoreHandle`](crate::actor::StoreHandle).

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::{CollectionOptions, TopicOptions};
use crate::error::{Error, Result};
use crate::schema::{self, collection_table};
use crate::types::{current_time_ms, Entry, Position, SubscriberName};

/// Event name stored on sentinel entries. Never delivered.
const SENTINEL_EVENT: &str = "";

// =============================================================================
// Capped Collection State
// =============================================================================

/// Cached retention bookkeeping for one capped collection.
#[derive(Debug, Clone)]
struct CappedState {
    table: String,
    options: TopicOptions,
    total_bytes: u64,
    count: u64,
}

impl CappedState {
    fn over_bounds(&self) -> bool {
        self.total_bytes > self.options.size_bytes
            || self.options.max_entries.is_some_and(|max| self.count > max)
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Owns the SQLite connection and the per-collection retention caches.
pub struct LogStorage {
    conn: Connection,
    capped: HashMap<String, CappedState>,
}

impl LogStorage {
    /// Wraps an initialized connection (see [`Database`](crate::schema::Database)).
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            capped: HashMap::new(),
        }
    }

    /// Creates a collection if absent. Returns `true` if it was created.
    pub fn ensure_collection(&mut self, collection: &str, options: CollectionOptions) -> Result<bool> {
        let created = schema::ensure_collection(&self.conn, collection, options)?;
        if created {
            tracing::debug!(collection, ?options, "created collection");
        }
        Ok(created)
    }

    // =========================================================================
    // Entry Log
    // =========================================================================

    /// Appends an entry and enforces retention.
    ///
    /// # Errors
    ///
    /// - `Error::Schema` if the collection was never provisioned as capped
    /// - `Error::Sqlite` on write failure
    pub fn append(&mut self, collection: &str, event: &str, message: &[u8]) -> Result<Entry> {
        let (position, created_ms) = self.insert(collection, event, message, false)?;
        Ok(Entry::new(position, event, message.to_vec(), created_ms))
    }

    /// Appends a no-op entry so an empty log has a well-defined start position.
    pub fn seed_sentinel(&mut self, collection: &str) -> Result<Position> {
        let (position, _) = self.insert(collection, SENTINEL_EVENT, &[], true)?;
        tracing::debug!(collection, %position, "seeded sentinel entry");
        Ok(position)
    }

    fn insert(
        &mut self,
        collection: &str,
        event: &str,
        message: &[u8],
        sentinel: bool,
    ) -> Result<(Position, u64)> {
        let mut state = self.capped_state(collection)?;
        let size = (event.len() + message.len()) as u64;
        let created_ms = current_time_ms();

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                r#"INSERT INTO "{}" (event, message, sentinel, size_bytes, created_ms)
                   VALUES (?, ?, ?, ?, ?)"#,
                state.table
            ),
            params![event, message, sentinel as i64, size as i64, created_ms as i64],
        )?;
        let position = Position::from_sql(tx.last_insert_rowid());

        state.total_bytes += size;
        state.count += 1;
        let evicted = Self::evict(&tx, &mut state, position)?;
        tx.commit()?;

        if evicted > 0 {
            tracing::debug!(collection, evicted, "evicted entries from capped collection");
        }
        self.capped.insert(collection.to_string(), state);

        Ok((position, created_ms))
    }

    /// Deletes the oldest entries until the collection fits its bounds.
    fn evict(conn: &Connection, state: &mut CappedState, newest: Position) -> Result<u64> {
        let mut evicted = 0;

        while state.over_bounds() {
            let oldest: Option<(i64, i64)> = conn
                .query_row(
                    &format!(
                        r#"SELECT position, size_bytes FROM "{}" ORDER BY position LIMIT 1"#,
                        state.table
                    ),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((position, size)) = oldest else { break };
            if Position::from_sql(position) >= newest {
                break;
            }

            conn.execute(
                &format!(r#"DELETE FROM "{}" WHERE position = ?"#, state.table),
                [position],
            )?;
            state.total_bytes = state.total_bytes.saturating_sub(size.max(0) as u64);
            state.count = state.count.saturating_sub(1);
            evicted += 1;
        }

        Ok(evicted)
    }

    fn capped_state(&mut self, collection: &str) -> Result<CappedState> {
        if let Some(state) = self.capped.get(collection) {
            return Ok(state.clone());
        }

        let options = schema::load_capped_options(&self.conn, collection)?.ok_or_else(|| {
            Error::Schema(format!("collection '{collection}' is not a provisioned entry log"))
        })?;
        let table = collection_table(collection)?;
        let (total_bytes, count): (i64, i64) = self.conn.query_row(
            &format!(r#"SELECT COALESCE(SUM(size_bytes), 0), COUNT(*) FROM "{table}""#),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let state = CappedState {
            table,
            options,
            total_bytes: total_bytes.max(0) as u64,
            count: count.max(0) as u64,
        };
        self.capped.insert(collection.to_string(), state.clone());
        Ok(state)
    }

    /// Returns the newest position in the log, sentinels included.
    pub fn latest(&self, collection: &str) -> Result<Option<Position>> {
        let table = collection_table(collection)?;
        let max: Option<i64> = self.conn.query_row(
            &format!(r#"SELECT MAX(position) FROM "{table}""#),
            [],
            |row| row.get(0),
        )?;
        Ok(max.map(Position::from_sql))
    }

    /// Reads up to `limit` entries strictly after `after`, in position order.
    ///
    /// Sentinel entries are skipped.
    pub fn read_after(&self, collection: &str, after: Position, limit: usize) -> Result<Vec<Entry>> {
        let table = collection_table(collection)?;
        let mut stmt = self.conn.prepare_cached(&format!(
            r#"SELECT position, event, message, created_ms FROM "{table}"
               WHERE position > ? AND sentinel = 0
               ORDER BY position
               LIMIT ?"#
        ))?;

        let rows = stmt.query_map(params![after.as_sql(), limit as i64], |row| {
            let position: i64 = row.get(0)?;
            let event: String = row.get(1)?;
            let message: Vec<u8> = row.get(2)?;
            let created_ms: i64 = row.get(3)?;
            Ok(Entry::new(
                Position::from_sql(position),
                event,
                message,
                created_ms.max(0) as u64,
            ))
        })?;

        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    // =========================================================================
    // Offsets
    // =========================================================================

    /// Returns a subscriber's last acknowledged position, if any.
    pub fn get_offset(&self, collection: &str, subscriber: &SubscriberName) -> Result<Option<Position>> {
        let table = collection_table(collection)?;
        let position: Option<i64> = self
            .conn
            .query_row(
                &format!(r#"SELECT last_position FROM "{table}" WHERE subscriber = ?"#),
                [subscriber.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position.map(Position::from_sql))
    }

    /// Upserts a subscriber's offset and returns the stored value.
    ///
    /// The stored offset never moves backwards: acknowledging a position at or
    /// below the current one leaves it unchanged.
    pub fn acknowledge(
        &self,
        collection: &str,
        subscriber: &SubscriberName,
        position: Position,
    ) -> Result<Position> {
        let table = collection_table(collection)?;
        self.conn.execute(
            &format!(
                r#"INSERT INTO "{table}" (subscriber, last_position, updated_ms) VALUES (?1, ?2, ?3)
                   ON CONFLICT(subscriber) DO UPDATE SET
                       last_position = MAX(last_position, excluded.last_position),
                       updated_ms = excluded.updated_ms"#
            ),
            params![subscriber.as_str(), position.as_sql(), current_time_ms() as i64],
        )?;

        self.get_offset(collection, subscriber)?
            .ok_or_else(|| Error::Store(format!("offset for '{subscriber}' vanished after upsert")))
    }
}

// =============================================================================
// Tests
// =============================================================================
