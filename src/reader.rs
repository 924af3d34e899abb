//! # Tailing Reader
//!
//! A [`Tail`] is an endless cursor over one entry collection. It hands out
//! entries in position order and, once it has caught up, parks until the log
//! grows again.
//!
//! ## How a Tail Waits
//!
//! ```text
//!            ┌──────────────┐  batch non-empty   ┌───────────────┐
//!   next() ─►│ read_after   │───────────────────►│ pop buffered  │──► Entry
//!            │  (cursor)    │                    │ entry         │
//!            └──────┬───────┘                    └───────────────┘
//!                   │ batch empty
//!                   ▼
//!            ┌──────────────────────────────────────────────┐
//!            │ select!                                      │
//!            │   head.changed()     ← local append          │
//!            │   sleep(poll)        ← appends by others     │
//!            │   cancel.cancelled() ← stop()                │
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! Appends made through this process publish the new head on a `watch`
//! channel, so the tail wakes immediately. The poll interval only covers
//! processes that write to the same database file through their own actor.
//!
//! ## Anomalies
//!
//! If the head moved past the cursor but the range read comes back empty, the
//! tail reports [`TailStep::Stalled`] and skips to the head. This is not an
//! error: the only entries that can hide there are sentinels.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::actor::StoreHandle;
use crate::error::{Error, Result};
use crate::types::{Entry, Position};

/// One step of a tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailStep {
    /// The next entry after the cursor.
    Entry(Entry),
    /// Woken by a new head, yet nothing was readable up to it.
    Stalled(Position),
    /// The tail's token was cancelled.
    Cancelled,
}

/// An endless, cancellable cursor over an entry collection.
#[derive(Debug)]
pub struct Tail {
    store: StoreHandle,
    collection: String,
    cursor: Position,
    head: watch::Receiver<Position>,
    buffer: VecDeque<Entry>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Tail {
    /// Opens a tail that yields entries strictly after `after`.
    pub async fn open(
        store: StoreHandle,
        collection: impl Into<String>,
        after: Position,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let collection = collection.into();
        let head = store.watch_head(&collection).await?;

        Ok(Self {
            store,
            collection,
            cursor: after,
            head,
            buffer: VecDeque::new(),
            poll_interval,
            cancel,
        })
    }

    /// Position of the last entry handed out (or skipped over).
    pub fn cursor(&self) -> Position {
        self.cursor
    }

    /// Waits for the next entry.
    ///
    /// # Errors
    ///
    /// - `Error::Tail` if the store actor stopped while the tail was waiting
    /// - store errors from the range read
    pub async fn next(&mut self) -> Result<TailStep> {
        let mut woken_by_head = false;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(TailStep::Cancelled);
            }

            if let Some(entry) = self.buffer.pop_front() {
                self.cursor = entry.position;
                return Ok(TailStep::Entry(entry));
            }

            // Read the head before the range so everything up to it is visible.
            let head = *self.head.borrow_and_update();
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(TailStep::Cancelled),
                batch = self.store.read_after(
                    &self.collection,
                    self.cursor,
                    self.store.read_batch_size(),
                ) => batch?,
            };

            if !batch.is_empty() {
                self.buffer.extend(batch);
                continue;
            }

            if head > self.cursor {
                self.cursor = head;
                if woken_by_head {
                    return Ok(TailStep::Stalled(head));
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(TailStep::Cancelled),
                changed = self.head.changed() => {
                    if changed.is_err() {
                        return Err(Error::Tail(format!(
                            "store closed while tailing '{}'",
                            self.collection
                        )));
                    }
                    woken_by_head = true;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    woken_by_head = false;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
