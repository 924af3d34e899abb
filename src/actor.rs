//! # Store Actor
//!
//! SQLite's `Connection` is `!Sync`, so it cannot be shared between async
//! tasks. Instead, one dedicated OS thread owns the [`LogStorage`] and serves
//! requests arriving on a bounded channel:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Tokio Runtime                          │
//! │                                                              │
//! │   publish ─┐                                ┌─ tail loop     │
//! │   ack     ─┼── tokio::sync::mpsc ───────────┼─ replay loop   │
//! │   replay  ─┘     (async send)               └─ offsets       │
//! └──────────────────────────┬───────────────────────────────────┘
//!                            │
//!                            ▼
//!                ┌───────────────────────┐
//!                │  Dedicated OS Thread  │  ← std::thread::Builder
//!                │  ┌─────────────────┐  │
//!                │  │   LogStorage    │  │  ← owned, never shared
//!                │  │  (Connection)   │  │
//!                │  └─────────────────┘  │
//!                │  heads: watch::Sender │  ← newest position per log
//!                └───────────────────────┘
//! ```
//!
//! Every request carries a `oneshot` sender for its answer. Because a single
//! thread executes requests in arrival order, appends to one collection are
//! trivially serialized and positions come out strictly increasing.
//!
//! ## Live Heads
//!
//! After each append the actor publishes the collection's newest position on a
//! `tokio::sync::watch` channel. Tails wait on that channel instead of
//! spinning on the database. When the actor stops, the senders are dropped and
//! every waiting tail observes the shutdown.

use std::collections::HashMap;
use std::thread;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{CollectionOptions, ConnectionConfig};
use crate::error::{Error, Result};
use crate::storage::LogStorage;
use crate::types::{Entry, Position, SubscriberName};

// =============================================================================
// Request Types
// =============================================================================

/// Requests served by the store actor.
pub enum StoreRequest {
    EnsureCollection {
        collection: String,
        options: CollectionOptions,
        response: oneshot::Sender<Result<bool>>,
    },
    Append {
        collection: String,
        event: String,
        message: Vec<u8>,
        response: oneshot::Sender<Result<Entry>>,
    },
    Latest {
        collection: String,
        response: oneshot::Sender<Result<Option<Position>>>,
    },
    /// Returns the newest position, seeding a sentinel entry if the log is empty.
    LatestOrSeed {
        collection: String,
        response: oneshot::Sender<Result<Position>>,
    },
    ReadAfter {
        collection: String,
        after: Position,
        limit: usize,
        response: oneshot::Sender<Result<Vec<Entry>>>,
    },
    WatchHead {
        collection: String,
        response: oneshot::Sender<Result<watch::Receiver<Position>>>,
    },
    GetOffset {
        collection: String,
        subscriber: SubscriberName,
        response: oneshot::Sender<Result<Option<Position>>>,
    },
    Acknowledge {
        collection: String,
        subscriber: SubscriberName,
        position: Position,
        response: oneshot::Sender<Result<Position>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

// =============================================================================
// Actor Loop
// =============================================================================

struct StoreActor {
    storage: LogStorage,
    heads: HashMap<String, watch::Sender<Position>>,
}

impl StoreActor {
    fn publish_head(&mut self, collection: &str, position: Position) {
        if let Some(head) = self.heads.get(collection) {
            head.send_replace(position);
        }
    }

    fn watch_head(&mut self, collection: &str) -> Result<watch::Receiver<Position>> {
        if let Some(head) = self.heads.get(collection) {
            return Ok(head.subscribe());
        }
        let latest = self.storage.latest(collection)?.unwrap_or(Position::ZERO);
        let (tx, rx) = watch::channel(latest);
        self.heads.insert(collection.to_string(), tx);
        Ok(rx)
    }

    fn latest_or_seed(&mut self, collection: &str) -> Result<Position> {
        match self.storage.latest(collection)? {
            Some(position) => Ok(position),
            None => {
                let position = self.storage.seed_sentinel(collection)?;
                self.publish_head(collection, position);
                Ok(position)
            }
        }
    }

    /// Serves requests until shutdown or until every handle is dropped.
    fn run(mut self, mut rx: mpsc::Receiver<StoreRequest>) {
        while let Some(request) = rx.blocking_recv() {
            match request {
                StoreRequest::EnsureCollection {
                    collection,
                    options,
                    response,
                } => {
                    let _ = response.send(self.storage.ensure_collection(&collection, options));
                }
                StoreRequest::Append {
                    collection,
                    event,
                    message,
                    response,
                } => {
                    let result = self.storage.append(&collection, &event, &message);
                    if let Ok(entry) = &result {
                        self.publish_head(&collection, entry.position);
                    }
                    let _ = response.send(result);
                }
                StoreRequest::Latest { collection, response } => {
                    let _ = response.send(self.storage.latest(&collection));
                }
                StoreRequest::LatestOrSeed { collection, response } => {
                    let _ = response.send(self.latest_or_seed(&collection));
                }
                StoreRequest::ReadAfter {
                    collection,
                    after,
                    limit,
                    response,
                } => {
                    let _ = response.send(self.storage.read_after(&collection, after, limit));
                }
                StoreRequest::WatchHead { collection, response } => {
                    let _ = response.send(self.watch_head(&collection));
                }
                StoreRequest::GetOffset {
                    collection,
                    subscriber,
                    response,
                } => {
                    let _ = response.send(self.storage.get_offset(&collection, &subscriber));
                }
                StoreRequest::Acknowledge {
                    collection,
                    subscriber,
                    position,
                    response,
                } => {
                    let _ = response.send(self.storage.acknowledge(&collection, &subscriber, position));
                }
                StoreRequest::Shutdown { response } => {
                    // Drop the watch senders before answering so tails see the close.
                    self.heads.clear();
                    rx.close();
                    let _ = response.send(());
                    break;
                }
            }
        }

        tracing::debug!("store actor stopped");
    }
}

// =============================================================================
// Store Handle
// =============================================================================

/// Async handle to the store actor.
///
/// Cheap to clone; all clones talk to the same thread.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreRequest>,
    read_batch_size: usize,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("closed", &self.tx.is_closed())
            .field("read_batch_size", &self.read_batch_size)
            .finish()
    }
}

impl StoreHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> StoreRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::Store("store actor has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Store("store actor dropped response".to_string()))?
    }

    /// Entries fetched per range read.
    pub fn read_batch_size(&self) -> usize {
        self.read_batch_size
    }

    /// Returns true once the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn ensure_collection(&self, collection: &str, options: CollectionOptions) -> Result<bool> {
        self.request(|response| StoreRequest::EnsureCollection {
            collection: collection.to_string(),
            options,
            response,
        })
        .await
    }

    pub async fn append(&self, collection: &str, event: &str, message: Vec<u8>) -> Result<Entry> {
        self.request(|response| StoreRequest::Append {
            collection: collection.to_string(),
            event: event.to_string(),
            message,
            response,
        })
        .await
    }

    pub async fn latest(&self, collection: &str) -> Result<Option<Position>> {
        self.request(|response| StoreRequest::Latest {
            collection: collection.to_string(),
            response,
        })
        .await
    }

    pub async fn latest_or_seed(&self, collection: &str) -> Result<Position> {
        self.request(|response| StoreRequest::LatestOrSeed {
            collection: collection.to_string(),
            response,
        })
        .await
    }

    /// Reads up to `limit` entries strictly after `after`.
    pub async fn read_after(&self, collection: &str, after: Position, limit: usize) -> Result<Vec<Entry>> {
        self.request(|response| StoreRequest::ReadAfter {
            collection: collection.to_string(),
            after,
            limit,
            response,
        })
        .await
    }

    /// Subscribes to the newest position of a collection.
    pub async fn watch_head(&self, collection: &str) -> Result<watch::Receiver<Position>> {
        self.request(|response| StoreRequest::WatchHead {
            collection: collection.to_string(),
            response,
        })
        .await
    }

    pub async fn get_offset(&self, collection: &str, subscriber: &SubscriberName) -> Result<Option<Position>> {
        self.request(|response| StoreRequest::GetOffset {
            collection: collection.to_string(),
            subscriber: subscriber.clone(),
            response,
        })
        .await
    }

    pub async fn acknowledge(
        &self,
        collection: &str,
        subscriber: &SubscriberName,
        position: Position,
    ) -> Result<Position> {
        self.request(|response| StoreRequest::Acknowledge {
            collection: collection.to_string(),
            subscriber: subscriber.clone(),
            position,
            response,
        })
        .await
    }

    /// Stops the actor after it finishes the requests queued before this one.
    ///
    /// Idempotent: shutting down a stopped actor is a no-op.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .tx
            .send(StoreRequest::Shutdown { response: response_tx })
            .await
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }
}

/// Spawns the store actor on a dedicated thread.
///
/// The connection must already carry the schema (see
/// [`Database`](crate::schema::Database)).
pub fn spawn_store(conn: Connection, config: &ConnectionConfig) -> Result<StoreHandle> {
    config.validate()?;
    let (tx, rx) = mpsc::channel(config.request_channel_size);

    let actor = StoreActor {
        storage: LogStorage::new(conn),
        heads: HashMap::new(),
    };

    thread::Builder::new()
        .name("kafkaesque-store".to_string())
        .spawn(move || actor.run(rx))
        .map_err(|e| Error::Store(format!("failed to spawn store thread: {e}")))?;

    Ok(StoreHandle {
        tx,
        read_batch_size: config.read_batch_size,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicOptions;
    use crate::schema::Database;

    async fn handle_with_topic() -> StoreHandle {
        let db = Database::open_in_memory().unwrap();
        let handle = spawn_store(db.into_connection(), &ConnectionConfig::in_memory()).unwrap();
        handle
            .ensure_collection("orders", CollectionOptions::Capped(TopicOptions::default()))
            .await
            .unwrap();
        handle
    }

    #[tokio::test]
    async fn test_append_and_read_through_actor() {
        let handle = handle_with_topic().await;

        let first = handle.append("orders", "created", b"1".to_vec()).await.unwrap();
        let second = handle.append("orders", "created", b"2".to_vec()).await.unwrap();

        let read = handle.read_after("orders", first.position, 10).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], second);
    }

    #[tokio::test]
    async fn test_latest_or_seed_seeds_once() {
        let handle = handle_with_topic().await;
        assert_eq!(handle.latest("orders").await.unwrap(), None);

        let seeded = handle.latest_or_seed("orders").await.unwrap();
        let again = handle.latest_or_seed("orders").await.unwrap();
        assert_eq!(seeded, again);
        assert_eq!(handle.latest("orders").await.unwrap(), Some(seeded));
    }

    #[tokio::test]
    async fn test_watch_head_follows_appends() {
        let handle = handle_with_topic().await;
        let mut head = handle.watch_head("orders").await.unwrap();
        assert_eq!(*head.borrow(), Position::ZERO);

        let entry = handle.append("orders", "created", b"x".to_vec()).await.unwrap();
        head.changed().await.unwrap();
        assert_eq!(*head.borrow_and_update(), entry.position);
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle_and_heads() {
        let handle = handle_with_topic().await;
        let mut head = handle.watch_head("orders").await.unwrap();

        handle.shutdown().await;
        assert!(head.changed().await.is_err());

        let result = handle.append("orders", "created", b"late".to_vec()).await;
        assert!(matches!(result, Err(Error::Store(_))));

        // second shutdown is a no-op
        handle.shutdown().await;
    }
}
