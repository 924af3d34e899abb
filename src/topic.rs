//! # Topics
//!
//! A [`Topic`] is one named, ordered, durable stream. It owns a capped entry
//! log, the offsets of its durable subscribers, at most one live tail and the
//! dispatcher that fans entries out to subscriptions.
//!
//! ## State Machine
//!
//! ```text
//!   ┌───────────────┐  initialize()   ┌───────┐   close()   ┌────────┐
//!   │ Uninitialized │────────────────►│ Ready │────────────►│ Closed │
//!   └───────────────┘  collections    └───────┘             └────────┘
//!          │           provisioned                              ▲
//!          └────────────────────── close() ─────────────────────┘
//! ```
//!
//! Operations on an uninitialized topic fail fast with
//! `Error::NotConnected`; operations on a closed topic fail with
//! `Error::Closed`. Closing never deletes persisted data.
//!
//! ## Notices
//!
//! Failures that have no caller to return to (the tail loop, a replay task)
//! are broadcast as [`Notice`]s. Receivers that fall behind lose the oldest
//! notices, never the entries themselves.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::actor::StoreHandle;
use crate::config::{CollectionOptions, TopicOptions};
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::offsets::OffsetStore;
use crate::replay::{replay, ReplayContext};
use crate::subscription::{join, Callback, Delivery, SubscribeOptions, Subscription};
use crate::tailer::LiveTailer;
use crate::types::{Entry, EventFilter, Position, SubscriberName, TopicName};

/// Capacity of a topic's notice channel.
pub const NOTICE_CAPACITY: usize = 64;

/// Lifecycle state of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    Uninitialized,
    Ready,
    Closed,
}

/// Topic-level events without a caller to report to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Both collections exist; the topic accepts operations.
    Ready,
    /// The live tail failed and stopped. New subscriptions are refused.
    TailError { message: String },
    /// The tail woke for a new head but found nothing to read.
    TailStalled { position: Position },
    /// A durable subscriber's replay failed.
    ReplayError {
        subscriber: SubscriberName,
        message: String,
    },
    /// The topic was closed.
    Closed,
}

struct Parts {
    store: StoreHandle,
    offsets: OffsetStore,
    tailer: LiveTailer,
}

struct TopicInner {
    name: TopicName,
    options: TopicOptions,
    connection: Connection,
    dispatcher: Arc<Dispatcher>,
    notices: broadcast::Sender<Notice>,
    cancel: CancellationToken,
    state: Mutex<TopicState>,
    parts: OnceLock<Parts>,
}

/// Handle to a topic. Cheap to clone; clones share one topic.
///
/// # Example
///
/// ```rust,no_run
/// use kafkaesque::{Connection, ConnectionConfig, SubscribeOptions};
///
/// # async fn run() -> kafkaesque::Result<()> {
/// let connection = Connection::open(ConnectionConfig::file("events.db")).await?;
/// let topic = connection.topic("orders").await?;
///
/// let subscription = topic
///     .subscribe("created", SubscribeOptions::transient(), |delivery| {
///         println!("{} at {}", delivery.event(), delivery.position());
///     })
///     .await?;
///
/// topic.publish("created", b"{\"id\":1}".to_vec()).await?;
/// subscription.unsubscribe();
/// topic.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

impl Topic {
    /// Creates an uninitialized topic. No I/O happens until [`Topic::initialize`].
    pub fn new(connection: &Connection, name: TopicName, options: TopicOptions) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(TopicInner {
                name,
                options,
                connection: connection.clone(),
                dispatcher: Arc::new(Dispatcher::new()),
                notices,
                cancel: CancellationToken::new(),
                state: Mutex::new(TopicState::Uninitialized),
                parts: OnceLock::new(),
            }),
        }
    }

    /// Creates a topic and provisions its collections.
    pub async fn create(connection: &Connection, name: TopicName, options: TopicOptions) -> Result<Self> {
        let topic = Self::new(connection, name, options);
        topic.initialize().await?;
        Ok(topic)
    }

    /// Provisions the entry and offset collections and moves to `Ready`.
    ///
    /// An empty entry log is seeded with a sentinel so "start of stream" has
    /// a position. Calling this on a ready topic is a no-op.
    ///
    /// # Errors
    ///
    /// - `Error::NotConnected` if the connection is not established
    /// - `Error::Closed` if the topic was closed
    /// - store errors from provisioning; the topic stays uninitialized
    pub async fn initialize(&self) -> Result<()> {
        match self.state() {
            TopicState::Ready => return Ok(()),
            TopicState::Closed => return Err(self.closed()),
            TopicState::Uninitialized => {}
        }

        let name = &self.inner.name;
        let store = self.inner.connection.store()?;
        let entries = name.entries_collection();

        store
            .ensure_collection(&entries, CollectionOptions::Capped(self.inner.options))
            .await?;
        store
            .ensure_collection(&name.offsets_collection(), CollectionOptions::Uncapped)
            .await?;
        let head = store.latest_or_seed(&entries).await?;

        let _ = self.inner.parts.set(Parts {
            offsets: OffsetStore::new(store.clone(), name),
            tailer: LiveTailer::new(
                name.clone(),
                store.clone(),
                Arc::clone(&self.inner.dispatcher),
                self.inner.notices.clone(),
                self.inner.connection.config().tail_poll_interval,
                self.inner.cancel.child_token(),
            ),
            store,
        });

        {
            let mut state = self.inner.state.lock().expect("topic mutex poisoned");
            match *state {
                TopicState::Closed => return Err(self.closed()),
                TopicState::Ready => return Ok(()),
                TopicState::Uninitialized => *state = TopicState::Ready,
            }
        }

        tracing::debug!(topic = %name, head = %head, "topic ready");
        let _ = self.inner.notices.send(Notice::Ready);
        Ok(())
    }

    pub fn name(&self) -> &TopicName {
        &self.inner.name
    }

    pub fn state(&self) -> TopicState {
        *self.inner.state.lock().expect("topic mutex poisoned")
    }

    /// Subscribes to topic notices from now on.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    fn closed(&self) -> Error {
        Error::Closed(format!("topic '{}' is closed", self.inner.name))
    }

    fn parts(&self) -> Result<&Parts> {
        match self.state() {
            TopicState::Uninitialized => Err(Error::NotConnected(format!(
                "topic '{}' is not initialized",
                self.inner.name
            ))),
            TopicState::Closed => Err(self.closed()),
            TopicState::Ready => self.inner.parts.get().ok_or_else(|| {
                Error::NotConnected(format!("topic '{}' is not initialized", self.inner.name))
            }),
        }
    }

    /// Appends an entry and returns it with its assigned position.
    ///
    /// Publishing does not dispatch; the live tail picks the entry up.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` for an empty event name
    /// - `Error::NotConnected` / `Error::Closed` outside `Ready`
    /// - store errors from the append
    pub async fn publish(&self, event: &str, message: impl Into<Vec<u8>>) -> Result<Entry> {
        if event.is_empty() {
            return Err(Error::InvalidArgument("event name must not be empty".into()));
        }
        let parts = self.parts()?;
        let entry = parts
            .store
            .append(&self.inner.name.entries_collection(), event, message.into())
            .await?;
        tracing::trace!(topic = %self.inner.name, event, position = %entry.position, "published");
        Ok(entry)
    }

    /// Registers `callback` for entries matching `event`.
    ///
    /// - durable with replay: replays from the last acknowledged position,
    ///   then goes live
    /// - otherwise: receives entries published from now on; durable
    ///   subscribers still get acks
    ///
    /// `event` may be an event name, `"message"` or `EventFilter::All` for
    /// every entry.
    pub async fn subscribe<F>(
        &self,
        event: impl Into<EventFilter>,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let parts = self.parts()?;
        let filter = event.into();
        let callback: Callback = Arc::new(callback);
        let cancel = self.inner.cancel.child_token();

        match options.name {
            Some(name) if options.replay => {
                let ctx = ReplayContext {
                    topic: self.inner.name.clone(),
                    store: parts.store.clone(),
                    offsets: parts.offsets.clone(),
                    tailer: parts.tailer.clone(),
                    notices: self.inner.notices.clone(),
                };
                replay(ctx, name, filter, callback, cancel).await
            }
            name => join(&parts.tailer, &parts.offsets, filter, name, callback, cancel).await,
        }
    }

    /// Last position `name` acknowledged on this topic.
    pub async fn last_acknowledged(&self, name: &SubscriberName) -> Result<Option<Position>> {
        self.parts()?.offsets.get(name).await
    }

    /// Stops the live tail and every replay, and drops all listeners.
    ///
    /// Later operations fail with `Error::Closed`. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("topic mutex poisoned");
            if *state == TopicState::Closed {
                return;
            }
            *state = TopicState::Closed;
        }

        self.inner.cancel.cancel();
        self.inner.dispatcher.stop_tail();
        if let Some(parts) = self.inner.parts.get() {
            parts.tailer.stop().await;
        }
        self.inner.dispatcher.clear();

        tracing::debug!(topic = %self.inner.name, "topic closed");
        let _ = self.inner.notices.send(Notice::Closed);
    }
}
