//! # Connection
//!
//! Owns the store actor and a cache of prepared topics.
//!
//! A `Connection` is inert until [`Connection::connect`] opens the database
//! and spawns the actor. Topics prepared through it share that actor.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::actor::{spawn_store, StoreHandle};
use crate::config::{ConnectionConfig, StoreLocation, TopicOptions};
use crate::error::{Error, Result};
use crate::schema::Database;
use crate::topic::{Topic, TopicState};
use crate::types::TopicName;

struct ConnectionInner {
    config: ConnectionConfig,
    store: Mutex<Option<StoreHandle>>,
    topics: Mutex<HashMap<TopicName, Topic>>,
}

/// Handle to a Kafkaesque store. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("location", &self.inner.config.location)
            .field("connected", &self.connected())
            .finish()
    }
}

impl Connection {
    /// Creates an unconnected connection.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                store: Mutex::new(None),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a connection and connects it.
    pub async fn open(config: ConnectionConfig) -> Result<Self> {
        let connection = Self::new(config);
        connection.connect().await?;
        Ok(connection)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Opens the database and starts the store actor. No-op when connected.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` for an invalid configuration
    /// - `Error::Sqlite` / `Error::Schema` if the database cannot be opened
    pub async fn connect(&self) -> Result<()> {
        if self.connected() {
            return Ok(());
        }
        let config = self.inner.config.clone();
        config.validate()?;

        let location = config.location.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<rusqlite::Connection> {
            let db = match location {
                StoreLocation::File(path) => Database::open(path)?,
                StoreLocation::InMemory => Database::open_in_memory()?,
            };
            Ok(db.into_connection())
        })
        .await
        .map_err(|e| Error::Store(format!("database open task failed: {e}")))??;

        let handle = spawn_store(conn, &config)?;

        let previous = {
            let mut store = self.inner.store.lock().expect("connection mutex poisoned");
            match store.as_ref() {
                Some(existing) if !existing.is_closed() => Some(handle),
                _ => {
                    *store = Some(handle);
                    None
                }
            }
        };
        if let Some(redundant) = previous {
            // Lost a race with a concurrent connect.
            redundant.shutdown().await;
            return Ok(());
        }

        tracing::info!(location = ?config.location, "connected");
        Ok(())
    }

    /// True while the store actor is running.
    pub fn connected(&self) -> bool {
        self.inner
            .store
            .lock()
            .expect("connection mutex poisoned")
            .as_ref()
            .is_some_and(|store| !store.is_closed())
    }

    pub(crate) fn store(&self) -> Result<StoreHandle> {
        self.inner
            .store
            .lock()
            .expect("connection mutex poisoned")
            .as_ref()
            .filter(|store| !store.is_closed())
            .cloned()
            .ok_or_else(|| Error::NotConnected("connection is not established".into()))
    }

    /// Returns the topic `name` with default retention, preparing it if needed.
    pub async fn topic(&self, name: &str) -> Result<Topic> {
        self.prepare_topic(name, TopicOptions::default()).await
    }

    /// Returns the cached topic `name`, or provisions a new one.
    ///
    /// A cached topic that was closed is replaced. `options` only apply when
    /// the entry collection is first created.
    pub async fn prepare_topic(&self, name: &str, options: TopicOptions) -> Result<Topic> {
        let name = TopicName::new(name)?;

        if let Some(topic) = self.cached(&name) {
            return Ok(topic);
        }

        let topic = Topic::create(self, name.clone(), options).await?;

        let mut topics = self.inner.topics.lock().expect("connection mutex poisoned");
        match topics.get(&name) {
            Some(existing) if existing.state() == TopicState::Ready => Ok(existing.clone()),
            _ => {
                topics.insert(name, topic.clone());
                Ok(topic)
            }
        }
    }

    fn cached(&self, name: &TopicName) -> Option<Topic> {
        self.inner
            .topics
            .lock()
            .expect("connection mutex poisoned")
            .get(name)
            .filter(|topic| topic.state() == TopicState::Ready)
            .cloned()
    }

    /// Closes every cached topic and stops the store actor. Idempotent.
    pub async fn close(&self) {
        let topics: Vec<Topic> = self
            .inner
            .topics
            .lock()
            .expect("connection mutex poisoned")
            .drain()
            .map(|(_, topic)| topic)
            .collect();
        for topic in topics {
            topic.close().await;
        }

        let store = self.inner.store.lock().expect("connection mutex poisoned").take();
        if let Some(store) = store {
            store.shutdown().await;
            tracing::info!(location = ?self.inner.config.location, "disconnected");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
