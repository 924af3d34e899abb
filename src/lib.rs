//! # Kafkaesque - Durable Topics on a Capped Log
//!
//! Kafkaesque is a publish/subscribe broker built on an append-only, capped
//! SQLite log. It provides:
//!
//! - **Topics**: named, ordered streams of `{position, event, message}` entries
//! - **Transient subscriptions**: receive entries published after subscribing
//! - **Durable subscriptions**: acknowledge entries and resume after restarts
//! - **Replay with handoff**: catch up from the last ack, then go live without
//!   gaps or duplicates
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Topic                                 │
//! │             (publish, subscribe, close, notices)                │
//! └───────┬───────────────────┬───────────────────────┬─────────────┘
//!         │                   │                       │
//!         ▼                   ▼                       ▼
//! ┌───────────────┐   ┌───────────────┐       ┌───────────────┐
//! │ Replay Engine │──►│  Dispatcher   │◄──────│  Live Tailer  │
//! │ (per durable  │   │ (event → list │       │ (one loop per │
//! │  subscriber)  │   │  of listeners)│       │  topic)       │
//! └───────┬───────┘   └───────────────┘       └───────┬───────┘
//!         │                                           │
//!         ▼                                           ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Store Actor                                │
//! │       (single thread, owns the SQLite connection)               │
//! │   entry logs (capped) · offset records · live head watches      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Ordering**: positions strictly increase per topic and are never reused
//! 2. **Per-subscription order**: a subscription sees entries in position order
//! 3. **At-least-once**: every entry above a durable subscriber's last ack is
//!    delivered again until it is acknowledged
//! 4. **Monotonic offsets**: a stored offset never moves backwards
//! 5. **Isolation**: a transient subscription never sees entries published
//!    before it subscribed
//!
//! ## Module Organization
//!
//! - [`error`]: Error type and `Result` alias
//! - [`config`]: Connection and topic settings
//! - [`types`]: Positions, names, event filters, entries
//! - [`schema`]: SQLite layout and collection provisioning
//! - [`storage`]: Capped log and offset operations on a connection
//! - [`actor`]: Store actor owning the connection
//! - [`reader`]: Cancellable tailing cursor
//! - [`offsets`]: Offset store of a topic
//! - [`dispatcher`]: Event-keyed listener table
//! - [`tailer`]: The per-topic live tail loop
//! - [`subscription`]: Subscription handles, deliveries and acks
//! - `replay`: Replay-then-handoff for durable subscribers
//! - [`topic`]: Topic lifecycle and public operations
//! - [`connection`]: Connection bootstrap and topic cache

pub mod error;

pub mod config;

pub mod types;

/// SQLite schema definitions and collection provisioning.
pub mod schema;

/// Capped entry logs and offset records on a single SQLite connection.
///
/// Synchronous; only the store actor calls into it.
pub mod storage;

/// The store actor: one thread owning the connection, driven over channels.
pub mod actor;

pub mod reader;

pub mod offsets;

pub mod dispatcher;

pub mod tailer;

/// Subscription handles, deliveries and acknowledgments.
///
/// See [`Subscription`] for the handle returned by [`Topic::subscribe`].
pub mod subscription;

pub(crate) mod replay;

pub mod topic;

pub mod connection;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ConnectionConfig, StoreLocation, TopicOptions};
pub use connection::Connection;
pub use error::{Error, Result};
pub use subscription::{Ack, Delivery, SubscribeOptions, Subscription, SubscriptionState};
pub use topic::{Notice, Topic, TopicState};
pub use types::{Entry, EventFilter, Position, SubscriberName, TopicName, WILDCARD_EVENT};
