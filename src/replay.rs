//! # Replay Engine
//!
//! Brings a durable subscriber from its last acknowledged position up to the
//! live edge, then hands it to the live tail.
//!
//! ```text
//!   offsets.get(name) = A
//!        │
//!        ▼
//!   ┌──────────────────────┐  entry  ┌───────────┐  ack()  ┌──────────────┐
//!   │ read_after(L, batch) │────────►│ callback  │────────►│ offset = pos │
//!   └──────────┬───────────┘         └───────────┘         └──────┬───────┘
//!              │ empty                      ▲    gate released     │
//!              ▼                            └──────────────────────┘
//!   ┌─────────────────────────────────────────────┐
//!   │ dispatcher lock                             │
//!   │   cancelled?          → stop                │
//!   │   tail idle?          → start tail at L     │
//!   │   tail through T ≤ L  → register, floor L   │
//!   │   tail through T > L  → read more history   │
//!   └─────────────────────────────────────────────┘
//! ```
//!
//! `L` starts at `A` (or zero) and follows every historical entry read,
//! whether or not it matched the filter. Entries above `A` are delivered at
//! least once: an entry whose ack never arrived is read again by the next
//! replay of the same subscriber.
//!
//! When the tail was seen through `T > L` and the next read still comes back
//! empty, nothing readable exists in `(L, T]` (evicted entries, or the
//! sentinel the tail started on). `L` moves up to `T` and the handoff is
//! retried; registration always requires `T ≤ L`.
//!
//! Replay waits for each ack before reading on. A dropped [`Ack`] halts this
//! subscriber's replay without affecting anyone else. An ack whose offset
//! write fails ends the replay with [`Notice::ReplayError`] and cancels the
//! subscription.
//!
//! [`Ack`]: crate::Ack

use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::actor::StoreHandle;
use crate::dispatcher::{Attach, AttachMode};
use crate::error::{Error, Result};
use crate::offsets::OffsetStore;
use crate::subscription::{live_listener, Ack, Callback, Delivery, Subscription, SubscriptionState};
use crate::tailer::LiveTailer;
use crate::topic::Notice;
use crate::types::{EventFilter, Position, SubscriberName, TopicName};

/// Everything a replay needs from its topic.
#[derive(Debug, Clone)]
pub(crate) struct ReplayContext {
    pub topic: TopicName,
    pub store: StoreHandle,
    pub offsets: OffsetStore,
    pub tailer: LiveTailer,
    pub notices: broadcast::Sender<Notice>,
}

/// Starts replaying `name` and returns its subscription.
///
/// The last acknowledged position is resolved before returning; the replay
/// itself runs in a background task.
///
/// # Errors
///
/// `Error::Replay` if the subscriber's offset cannot be read.
pub(crate) async fn replay(
    ctx: ReplayContext,
    name: SubscriberName,
    filter: EventFilter,
    callback: Callback,
    cancel: CancellationToken,
) -> Result<Subscription> {
    let acknowledged = match ctx.offsets.get(&name).await {
        Ok(position) => position,
        Err(e) => {
            tracing::error!(topic = %ctx.topic, subscriber = %name, error = %e, "cannot resolve replay position");
            let _ = ctx.notices.send(Notice::ReplayError {
                subscriber: name.clone(),
                message: e.to_string(),
            });
            return Err(Error::replay(name.as_str(), e));
        }
    };

    let dispatcher = Arc::clone(ctx.tailer.dispatcher());
    let subscription = Subscription::new(
        dispatcher.allocate_id(),
        filter.clone(),
        Some(name.clone()),
        SubscriptionState::Replaying,
        cancel,
        dispatcher,
    );

    tracing::debug!(
        topic = %ctx.topic,
        subscriber = %name,
        acknowledged = ?acknowledged.map(|p| p.as_raw()),
        "replay started"
    );

    let task = ReplayTask {
        ctx,
        subscription: subscription.clone(),
        name,
        filter,
        callback,
        last_read: acknowledged.unwrap_or(Position::ZERO),
    };
    tokio::spawn(task.run());

    Ok(subscription)
}

struct ReplayTask {
    ctx: ReplayContext,
    subscription: Subscription,
    name: SubscriberName,
    filter: EventFilter,
    callback: Callback,
    last_read: Position,
}

/// Why a replay loop ended.
enum Exit {
    Live,
    Cancelled,
    Halted,
    Failed(String),
}

impl ReplayTask {
    async fn run(mut self) {
        match self.drive().await {
            Exit::Live | Exit::Cancelled => {}
            Exit::Halted => {
                tracing::warn!(
                    topic = %self.ctx.topic,
                    subscriber = %self.name,
                    position = %self.last_read,
                    "ack dropped without acknowledging; replay halted"
                );
            }
            Exit::Failed(message) => {
                tracing::error!(topic = %self.ctx.topic, subscriber = %self.name, error = %message, "replay failed");
                let _ = self.ctx.notices.send(Notice::ReplayError {
                    subscriber: self.name.clone(),
                    message,
                });
                self.subscription.unsubscribe();
            }
        }
    }

    async fn drive(&mut self) -> Exit {
        let collection = self.ctx.topic.entries_collection();
        let cancel = self.subscription.cancellation().clone();
        // Tail position seen by the last refused handoff.
        let mut passed: Option<Position> = None;

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Exit::Cancelled,
                batch = self.ctx.store.read_after(&collection, self.last_read, self.ctx.store.read_batch_size()) => batch,
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => return Exit::Failed(e.to_string()),
            };

            if batch.is_empty() {
                // The tail dispatched through `dispatched` before this read, and
                // the read found nothing above `last_read`: everything up to it
                // was evicted or is a sentinel.
                if let Some(dispatched) = passed.take() {
                    if dispatched > self.last_read {
                        tracing::debug!(
                            topic = %self.ctx.topic,
                            subscriber = %self.name,
                            from = %self.last_read,
                            to = %dispatched,
                            "nothing readable below the tail; skipping ahead"
                        );
                        self.last_read = dispatched;
                    }
                }

                match self.handoff() {
                    Attach::Registered { floor } => {
                        self.subscription.go_live();
                        tracing::debug!(topic = %self.ctx.topic, subscriber = %self.name, floor = %floor, "replay handed off to live tail");
                        return Exit::Live;
                    }
                    Attach::Behind { dispatched } => {
                        tracing::trace!(subscriber = %self.name, dispatched = %dispatched, "tail ahead of replay");
                        passed = Some(dispatched);
                        continue;
                    }
                    Attach::Cancelled => return Exit::Cancelled,
                    Attach::Stopped => return Exit::Failed("live tail is not running".into()),
                }
            }

            for entry in batch {
                self.last_read = entry.position;
                if !self.filter.matches(&entry.event) {
                    continue;
                }

                let position = entry.position;
                let (gate, released) = oneshot::channel();
                let ack = Ack::gated(self.ctx.offsets.clone(), self.name.clone(), position, gate);
                (self.callback)(Delivery {
                    entry,
                    ack: Some(ack),
                });

                tokio::select! {
                    _ = cancel.cancelled() => return Exit::Cancelled,
                    released = released => match released {
                        Ok(Ok(())) => {}
                        Ok(Err(message)) => {
                            return Exit::Failed(format!("acknowledging {position} failed: {message}"));
                        }
                        Err(_) => return Exit::Halted,
                    },
                }
            }
        }
    }

    /// Registers the live listener at `last_read`, unless the tail is past it.
    fn handoff(&self) -> Attach {
        let cancel = self.subscription.cancellation();
        let listener = live_listener(
            Arc::clone(&self.callback),
            Some((self.ctx.offsets.clone(), self.name.clone())),
            cancel.clone(),
        );
        self.ctx.tailer.attach(
            self.filter.key(),
            self.subscription.id(),
            self.last_read,
            listener,
            AttachMode::Exact,
            cancel,
        )
    }
}
