//! # Configuration
//!
//! Connection-level settings live in [`ConnectionConfig`]; per-topic retention
//! lives in [`TopicOptions`]. Both have sensible defaults, so most callers
//! only touch the store location.
//!
//! ## Environment Overrides
//!
//! [`ConnectionConfig::from_env`] reads:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `KAFKAESQUE_DB` | database file, or `:memory:` | `kafkaesque.db` |
//! | `KAFKAESQUE_READ_BATCH` | entries per range read | `256` |
//! | `KAFKAESQUE_TAIL_POLL_MS` | tail poll fallback in ms | `500` |

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default byte bound of a topic's capped entry collection (5 MiB).
pub const DEFAULT_TOPIC_SIZE_BYTES: u64 = 5 * 1024 * 1024;

/// Default number of entries fetched per range read.
pub const DEFAULT_READ_BATCH_SIZE: usize = 256;

/// Default interval after which an idle tail re-reads the log even without a
/// local append notification.
///
/// Appends made through this process wake the tail immediately; the poll only
/// matters for other processes writing to the same database file.
pub const DEFAULT_TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default capacity of the store actor's request channel.
pub const DEFAULT_REQUEST_CHANNEL_SIZE: usize = 1024;

/// Default database file name.
pub const DEFAULT_DB_FILE: &str = "kafkaesque.db";

// =============================================================================
// Store Location
// =============================================================================

/// Where the log store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A SQLite database file, created if missing.
    File(PathBuf),
    /// A private in-memory database; lost when the connection closes.
    InMemory,
}

impl StoreLocation {
    fn parse(value: &str) -> Self {
        if value == ":memory:" {
            StoreLocation::InMemory
        } else {
            StoreLocation::File(PathBuf::from(value))
        }
    }
}

// =============================================================================
// Connection Configuration
// =============================================================================

/// Settings for a [`Connection`](crate::Connection).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use kafkaesque::ConnectionConfig;
///
/// let config = ConnectionConfig::in_memory()
///     .with_read_batch_size(64)
///     .with_tail_poll_interval(Duration::from_millis(50));
/// assert_eq!(config.read_batch_size, 64);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Where the database lives.
    pub location: StoreLocation,

    /// Maximum entries fetched per range read (replay and tail).
    pub read_batch_size: usize,

    /// Tail poll fallback when no local append wakes it.
    pub tail_poll_interval: Duration,

    /// Capacity of the store actor's request channel.
    pub request_channel_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            location: StoreLocation::File(PathBuf::from(DEFAULT_DB_FILE)),
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            tail_poll_interval: DEFAULT_TAIL_POLL_INTERVAL,
            request_channel_size: DEFAULT_REQUEST_CHANNEL_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Configuration for a database file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
            ..Self::default()
        }
    }

    /// Configuration for a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::InMemory,
            ..Self::default()
        }
    }

    /// Builds a configuration from `KAFKAESQUE_*` environment variables.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(location) = lookup("KAFKAESQUE_DB") {
            config.location = StoreLocation::parse(&location);
        }
        if let Some(batch) = lookup("KAFKAESQUE_READ_BATCH") {
            config.read_batch_size = batch.parse().map_err(|_| {
                Error::InvalidArgument(format!("KAFKAESQUE_READ_BATCH: '{batch}' is not a number"))
            })?;
        }
        if let Some(poll) = lookup("KAFKAESQUE_TAIL_POLL_MS") {
            let millis: u64 = poll.parse().map_err(|_| {
                Error::InvalidArgument(format!("KAFKAESQUE_TAIL_POLL_MS: '{poll}' is not a number"))
            })?;
            config.tail_poll_interval = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size;
        self
    }

    pub fn with_tail_poll_interval(mut self, interval: Duration) -> Self {
        self.tail_poll_interval = interval;
        self
    }

    pub fn with_request_channel_size(mut self, size: usize) -> Self {
        self.request_channel_size = size;
        self
    }

    /// Rejects values the store actor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.read_batch_size == 0 {
            return Err(Error::InvalidArgument("read_batch_size must be > 0".into()));
        }
        if self.request_channel_size == 0 {
            return Err(Error::InvalidArgument(
                "request_channel_size must be > 0".into(),
            ));
        }
        if self.tail_poll_interval.is_zero() {
            return Err(Error::InvalidArgument(
                "tail_poll_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Topic Options
// =============================================================================

/// Retention settings of a topic's capped entry collection.
///
/// Once the stored payload bytes exceed `size_bytes` (or the entry count
/// exceeds `max_entries`), the oldest entries are evicted. Eviction is the log
/// store's concern; the broker never deletes entries itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicOptions {
    /// Byte bound of the entry collection.
    pub size_bytes: u64,

    /// Optional bound on the number of entries.
    pub max_entries: Option<u64>,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            size_bytes: DEFAULT_TOPIC_SIZE_BYTES,
            max_entries: None,
        }
    }
}

impl TopicOptions {
    pub fn with_size_bytes(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = Some(max_entries);
        self
    }
}

/// How a collection is created by `ensure_collection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOptions {
    /// Append-only entry log with bounded retention.
    Capped(TopicOptions),
    /// Keyed offset records, never evicted.
    Uncapped,
}

// =============================================================================
// Tests
// =============================================================================
