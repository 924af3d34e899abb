//! # Error Handling for Kafkaesque
//!
//! This module defines the error types used throughout the broker. A single
//! error enum ([`Error`]) represents every failure mode, which keeps function
//! signatures short and lets callers match on the variant they care about.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Lifecycle | `NotConnected`, `Closed` | Connect / recreate the topic |
//! | Store | `Sqlite`, `Store` | Surface, let an outer layer retry |
//! | Replay | `Replay` | Resubscribe once the store recovers |
//! | Tail | `Tail` | Recreate the topic |
//! | Caller | `InvalidArgument`, `Schema` | Fix the call site |
//!
//! The core never retries on its own. Store-level failures observed by
//! background loops are broadcast as [`Notice`](crate::topic::Notice) values
//! instead of being returned, because no caller is waiting on them.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in broker operations.
///
/// # Example
///
/// ```rust,ignore
/// use kafkaesque::{Error, Result};
///
/// async fn publish_once(topic: &Topic) -> Result<()> {
///     match topic.publish("created", b"{}".to_vec()).await {
///         Ok(entry) => println!("stored at {}", entry.position),
///         Err(e) if e.is_store_error() => return Err(e),
///         Err(e) => eprintln!("not ready: {e}"),
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// The operation needs a connected store or a provisioned topic.
    ///
    /// # When This Happens
    ///
    /// - `Topic::create` before `Connection::connect`
    /// - `publish`/`subscribe` on a topic that never reached `Ready`
    /// - Provisioning of the entry or offset collection failed, leaving the
    ///   topic permanently uninitialized
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The topic or connection was closed.
    ///
    /// Persisted data is untouched; prepare the topic again to keep using it.
    #[error("closed: {0}")]
    Closed(String),

    // =========================================================================
    // Store Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// The `#[from]` attribute lets `?` convert rusqlite errors directly.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store actor is unavailable or dropped a response.
    #[error("store error: {0}")]
    Store(String),

    /// Collection layout is invalid or a name cannot be used as a collection.
    #[error("schema error: {0}")]
    Schema(String),

    // =========================================================================
    // Subscription Errors
    // =========================================================================

    /// Resolving a durable subscriber's last acknowledged position failed.
    #[error("replay failed for subscriber '{subscriber}': {source}")]
    Replay {
        /// The durable subscriber whose offset could not be read
        subscriber: String,
        /// The underlying store failure
        #[source]
        source: Box<Error>,
    },

    /// The live blocking read failed.
    #[error("tail error: {0}")]
    Tail(String),

    /// A caller-supplied value was rejected before touching the store.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Returns true for failures of the underlying log or offset store.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Sqlite(_) | Error::Store(_))
    }

    /// Wraps a store failure that happened while resolving a replay position.
    pub(crate) fn replay(subscriber: impl Into<String>, source: Error) -> Self {
        Error::Replay {
            subscriber: subscriber.into(),
            source: Box::new(source),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let not_connected = Error::NotConnected("topic 'orders' is not provisioned".to_string());
        assert_eq!(
            not_connected.to_string(),
            "not connected: topic 'orders' is not provisioned"
        );

        let replay = Error::replay("billing", Error::Store("store actor has shut down".into()));
        assert_eq!(
            replay.to_string(),
            "replay failed for subscriber 'billing': store error: store actor has shut down"
        );
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.is_store_error());
        assert!(our_err.to_string().contains("sqlite error"));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(Error::Store("gone".into()).is_store_error());
        assert!(!Error::Closed("topic".into()).is_store_error());
        assert!(!Error::Tail("cursor".into()).is_store_error());
    }
}
