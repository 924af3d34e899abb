//! # Domain Types for Kafkaesque
//!
//! This module defines the core types used throughout the broker: positions in
//! a topic's log, topic and subscriber identities, event filters and entries.
//!
//! ## Newtypes for Safety
//!
//! Positions, topic names and subscriber names are all "just" integers or
//! strings underneath. Wrapping them means a subscriber name can never be
//! passed where a topic name is expected, and validation happens once, at
//! construction.
//!
//! ## Invariants
//!
//! - [`Position`]: assigned by the log store, strictly increasing, never reused
//! - [`TopicName`]: non-empty, restricted to `[A-Za-z0-9_-]` because it names
//!   storage collections
//! - [`SubscriberName`]: non-empty

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

// =============================================================================
// Positions
// =============================================================================

/// A position in a topic's log.
///
/// Positions are the sole ordering and resumption key. The log store assigns
/// them on append; the broker only ever compares them.
///
/// # Invariants
///
/// - Strictly increases with each entry appended to a topic
/// - Never reused, even after capped eviction
/// - [`Position::ZERO`] sorts before every real entry and means "start of log"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position(u64);

impl Position {
    /// The position before the first entry of any log.
    pub const ZERO: Position = Position(0);

    /// Creates a position from a raw value read from storage.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value for storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// SQLite stores INTEGER as i64; positions never approach i64::MAX.
    pub(crate) fn as_sql(&self) -> i64 {
        self.0 as i64
    }

    pub(crate) fn from_sql(value: i64) -> Self {
        Self(value.max(0) as u64)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Identities
// =============================================================================

/// The identifier of a topic.
///
/// A topic name doubles as the name of its storage collections, so it is
/// limited to ASCII letters, digits, `_` and `-`.
///
/// # Example
///
/// ```rust
/// use kafkaesque::TopicName;
///
/// let topic = TopicName::new("orders").unwrap();
/// assert_eq!(topic.offsets_collection(), "orders_subscribers");
/// assert!(TopicName::new("drop table;").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(String);

impl TopicName {
    /// Validates and wraps a topic name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument("topic name must not be empty".into()));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidArgument(format!(
                "topic name '{name}' may only contain ASCII letters, digits, '_' and '-'"
            )));
        }
        Ok(Self(name))
    }

    /// Returns the string representation of this topic name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the capped collection holding this topic's entries.
    pub fn entries_collection(&self) -> String {
        self.0.clone()
    }

    /// Name of the uncapped collection holding this topic's subscriber offsets.
    pub fn offsets_collection(&self) -> String {
        format!("{}_subscribers", self.0)
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The name of a durable subscriber.
///
/// Only durable subscriptions have a name; it keys the persisted offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberName(String);

impl SubscriberName {
    /// Validates and wraps a subscriber name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "subscriber name must not be empty".into(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Event Filters
// =============================================================================

/// The event name that selects every entry regardless of its own event name.
pub const WILDCARD_EVENT: &str = "message";

/// Which entries a subscription wants.
///
/// `EventFilter::All` is the catch-all stream. An absent filter and the
/// literal [`WILDCARD_EVENT`] both map to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Every entry.
    All,
    /// Only entries whose event name matches exactly.
    Named(String),
}

impl EventFilter {
    /// Builds a filter for one event name.
    pub fn named(event: impl Into<String>) -> Self {
        let event = event.into();
        if event == WILDCARD_EVENT {
            EventFilter::All
        } else {
            EventFilter::Named(event)
        }
    }

    /// Returns true if an entry with this event name passes the filter.
    pub fn matches(&self, event: &str) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Named(name) => name == event,
        }
    }

    /// The dispatcher key listeners for this filter are registered under.
    pub fn key(&self) -> &str {
        match self {
            EventFilter::All => WILDCARD_EVENT,
            EventFilter::Named(name) => name,
        }
    }
}

impl From<&str> for EventFilter {
    fn from(event: &str) -> Self {
        EventFilter::named(event)
    }
}

impl From<String> for EventFilter {
    fn from(event: String) -> Self {
        EventFilter::named(event)
    }
}

impl From<Option<&str>> for EventFilter {
    fn from(event: Option<&str>) -> Self {
        event.map(EventFilter::named).unwrap_or(EventFilter::All)
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

// =============================================================================
// Entries
// =============================================================================

/// An immutable record in a topic's log.
///
/// The message payload is opaque to the broker and wrapped in an `Arc` so the
/// tail can hand the same entry to many listeners without copying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Position assigned by the log store.
    pub position: Position,

    /// Event name the entry was published under.
    pub event: String,

    /// Opaque payload.
    pub message: Arc<Vec<u8>>,

    /// Unix milliseconds at which the entry was stored.
    pub timestamp_ms: u64,
}

impl Entry {
    pub fn new(position: Position, event: impl Into<String>, message: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            position,
            event: event.into(),
            message: Arc::new(message),
            timestamp_ms,
        }
    }

    /// Borrow the payload.
    pub fn message(&self) -> &[u8] {
        &self.message
    }
}

/// Current time in Unix milliseconds.
pub(crate) fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        assert!(Position::ZERO < Position::from_raw(1));
        assert!(Position::from_raw(7) > Position::from_raw(6));
        assert_eq!(Position::from_sql(-3), Position::ZERO);
        assert_eq!(Position::from_raw(42).to_string(), "42");
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(TopicName::new("").is_err());
        assert!(TopicName::new("has space").is_err());
        assert!(TopicName::new("quote\"d").is_err());

        let name = TopicName::new("test-subscribe_2").unwrap();
        assert_eq!(name.entries_collection(), "test-subscribe_2");
        assert_eq!(name.offsets_collection(), "test-subscribe_2_subscribers");
    }

    #[test]
    fn test_subscriber_name_validation() {
        assert!(SubscriberName::new("   ").is_err());
        assert_eq!(
            SubscriberName::new("a-durable-subscriber").unwrap().as_str(),
            "a-durable-subscriber"
        );
    }

    #[test]
    fn test_event_filter_wildcard() {
        assert_eq!(EventFilter::from(None), EventFilter::All);
        assert_eq!(EventFilter::from("message"), EventFilter::All);
        assert_eq!(
            EventFilter::from(Some("my-event")),
            EventFilter::Named("my-event".into())
        );

        assert!(EventFilter::All.matches("anything"));
        assert!(EventFilter::named("my-event").matches("my-event"));
        assert!(!EventFilter::named("my-event").matches("other-event"));
        assert_eq!(EventFilter::All.key(), WILDCARD_EVENT);
    }

    #[test]
    fn test_entry_shares_payload() {
        let entry = Entry::new(Position::from_raw(3), "my-event", b"{\"number\":1}".to_vec(), 12345);
        let copy = entry.clone();
        assert!(Arc::ptr_eq(&entry.message, &copy.message));
        assert_eq!(copy.message(), b"{\"number\":1}");
    }
}
