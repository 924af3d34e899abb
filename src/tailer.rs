//! # Live Tailer
//!
//! At most one tail loop runs per topic. It follows the entry collection with
//! a [`Tail`] and hands every entry to the [`Dispatcher`].
//!
//! The loop is started lazily by the first listener that attaches and runs
//! until the topic closes. A read failure stops it for good: the failure is
//! broadcast as [`Notice::TailError`] and later attaches are refused.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actor::StoreHandle;
use crate::dispatcher::{Attach, AttachMode, Dispatcher, ListenerFn, ListenerId};
use crate::error::Result;
use crate::reader::{Tail, TailStep};
use crate::topic::Notice;
use crate::types::{Position, TopicName};

struct TailerInner {
    topic: TopicName,
    store: StoreHandle,
    dispatcher: Arc<Dispatcher>,
    notices: broadcast::Sender<Notice>,
    poll_interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a topic's tail loop.
#[derive(Clone)]
pub struct LiveTailer {
    inner: Arc<TailerInner>,
}

impl std::fmt::Debug for LiveTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTailer")
            .field("topic", &self.inner.topic)
            .field("cursor", &self.inner.dispatcher.tail())
            .finish()
    }
}

impl LiveTailer {
    pub fn new(
        topic: TopicName,
        store: StoreHandle,
        dispatcher: Arc<Dispatcher>,
        notices: broadcast::Sender<Notice>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(TailerInner {
                topic,
                store,
                dispatcher,
                notices,
                poll_interval,
                cancel,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Newest position of the entry log, sentinels included.
    pub async fn latest(&self) -> Result<Position> {
        Ok(self
            .inner
            .store
            .latest(&self.inner.topic.entries_collection())
            .await?
            .unwrap_or(Position::ZERO))
    }

    /// Starts the tail loop after `from` without registering a listener.
    ///
    /// Returns true if this call started it.
    #[cfg(test)]
    pub(crate) fn start(&self, from: Position) -> bool {
        self.inner
            .dispatcher
            .start_tail(from, |from| self.spawn(from))
    }

    /// Registers a listener, starting the loop at `floor` if it is idle.
    pub fn attach(
        &self,
        key: &str,
        id: ListenerId,
        floor: Position,
        callback: ListenerFn,
        mode: AttachMode,
        cancel: &CancellationToken,
    ) -> Attach {
        self.inner
            .dispatcher
            .attach(key, id, floor, callback, mode, cancel, |from| self.spawn(from))
    }

    fn spawn(&self, from: Position) {
        tracing::debug!(topic = %self.inner.topic, from = %from, "starting live tail");
        let handle = tokio::spawn(run_tail(Arc::clone(&self.inner), from));
        *self.inner.task.lock().expect("tailer mutex poisoned") = Some(handle);
    }

    /// Stops the loop and waits for it to release its cursor. Idempotent.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.dispatcher.stop_tail();

        let task = self.inner.task.lock().expect("tailer mutex poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(topic = %self.inner.topic, error = %e, "live tail task failed");
            }
            tracing::debug!(topic = %self.inner.topic, "live tail stopped");
        }
    }
}

async fn run_tail(inner: Arc<TailerInner>, from: Position) {
    let collection = inner.topic.entries_collection();
    let opened = Tail::open(
        inner.store.clone(),
        collection,
        from,
        inner.poll_interval,
        inner.cancel.clone(),
    )
    .await;

    let mut tail = match opened {
        Ok(tail) => tail,
        Err(e) => {
            fail(&inner, e.to_string());
            return;
        }
    };

    loop {
        match tail.next().await {
            Ok(TailStep::Entry(entry)) => {
                let delivered = inner.dispatcher.dispatch(&entry);
                tracing::trace!(
                    topic = %inner.topic,
                    position = %entry.position,
                    event = %entry.event,
                    delivered,
                    "dispatched"
                );
            }
            Ok(TailStep::Stalled(position)) => {
                tracing::warn!(
                    topic = %inner.topic,
                    position = %position,
                    "tail woke without a readable entry"
                );
                let _ = inner.notices.send(Notice::TailStalled { position });
            }
            Ok(TailStep::Cancelled) => {
                tracing::trace!(topic = %inner.topic, cursor = %tail.cursor(), "live tail cancelled");
                break;
            }
            Err(e) => {
                fail(&inner, e.to_string());
                break;
            }
        }
    }
}

fn fail(inner: &TailerInner, message: String) {
    if inner.cancel.is_cancelled() {
        return;
    }
    tracing::error!(topic = %inner.topic, error = %message, "live tail failed");
    inner.dispatcher.stop_tail();
    let _ = inner.notices.send(Notice::TailError { message });
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::spawn_store;
    use crate::config::{CollectionOptions, ConnectionConfig, TopicOptions};
    use crate::dispatcher::TailCursor;
    use crate::schema::Database;
    use crate::types::Entry;
    use tokio::sync::mpsc;

    async fn tailer() -> (LiveTailer, StoreHandle, broadcast::Receiver<Notice>) {
        let db = Database::open_in_memory().unwrap();
        let store = spawn_store(db.into_connection(), &ConnectionConfig::in_memory()).unwrap();
        store
            .ensure_collection("t", CollectionOptions::Capped(TopicOptions::default()))
            .await
            .unwrap();
        let (notices, rx) = broadcast::channel(16);
        let tailer = LiveTailer::new(
            TopicName::new("t").unwrap(),
            store.clone(),
            Arc::new(Dispatcher::new()),
            notices,
            Duration::from_millis(50),
            CancellationToken::new(),
        );
        (tailer, store, rx)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (tailer, _store, _) = tailer().await;
        assert!(tailer.start(Position::ZERO));
        assert!(!tailer.start(Position::ZERO));
        tailer.stop().await;
        tailer.stop().await;
        assert_eq!(tailer.dispatcher().tail(), TailCursor::Stopped);
    }

    #[tokio::test]
    async fn test_attached_listener_receives_new_entries() {
        let (tailer, store, _) = tailer().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = tailer.dispatcher().allocate_id();
        let callback: ListenerFn = Arc::new(move |entry: &Entry| {
            let _ = tx.send(entry.position);
        });

        let from = store.latest_or_seed("t").await.unwrap();
        let attached = tailer.attach("e", id, from, callback, AttachMode::Exact, &CancellationToken::new());
        assert_eq!(attached, Attach::Registered { floor: from });

        let appended = store.append("t", "e", b"x".to_vec()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got, Some(appended.position));

        tailer.stop().await;
    }

    #[tokio::test]
    async fn test_store_shutdown_surfaces_tail_error() {
        let (tailer, store, mut notices) = tailer().await;
        tailer.start(Position::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.shutdown().await;
        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice, Notice::TailError { .. }));
        assert_eq!(tailer.dispatcher().tail(), TailCursor::Stopped);
    }
}
