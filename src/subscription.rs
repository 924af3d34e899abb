//! # Subscriptions
//!
//! A [`Subscription`] is the handle an application gets back from
//! [`Topic::subscribe`](crate::Topic::subscribe). It reports where the
//! subscriber is in its lifecycle and cancels it.
//!
//! ## Lifecycle
//!
//! ```text
//!   subscribe(replay) ──► Replaying ──(handoff)──► Live ──► Cancelled
//!   subscribe         ──────────────────────────► Live ──► Cancelled
//! ```
//!
//! `Replaying → Live` happens at most once. `Cancelled` is terminal and is
//! also reported once the owning topic has closed.
//!
//! ## Deliveries and Acks
//!
//! Callbacks receive a [`Delivery`]. Durable subscribers also get an [`Ack`],
//! which persists the entry's position as the subscriber's offset:
//!
//! - during replay the ack also releases the next historical entry, so replay
//!   runs at the consumer's pace
//! - on the live path acking only persists; the tail never waits for it
//!
//! ## Joining the Live Tail
//!
//! [`join`] registers a listener that starts at "now": its floor is the
//! newest position at subscribe time, so it never sees older entries even if
//! the tail loop is still working through them for other listeners.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Attach, AttachMode, Dispatcher, ListenerFn, ListenerId};
use crate::error::{Error, Result};
use crate::offsets::OffsetStore;
use crate::tailer::LiveTailer;
use crate::types::{Entry, EventFilter, Position, SubscriberName};

// =============================================================================
// Options
// =============================================================================

/// How a subscription is set up.
///
/// # Example
///
/// ```rust
/// use kafkaesque::{SubscribeOptions, SubscriberName};
///
/// let transient = SubscribeOptions::transient();
/// assert!(transient.name.is_none());
///
/// let durable = SubscribeOptions::durable(SubscriberName::new("billing").unwrap()).with_replay();
/// assert!(durable.replay);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Durable subscriber name. `None` for a transient subscription.
    pub name: Option<SubscriberName>,

    /// Replay from the last acknowledged position before going live.
    /// Ignored without a name.
    pub replay: bool,
}

impl SubscribeOptions {
    /// A subscription without identity that only sees new entries.
    pub fn transient() -> Self {
        Self::default()
    }

    /// A named subscription whose acknowledgments are persisted.
    pub fn durable(name: SubscriberName) -> Self {
        Self {
            name: Some(name),
            replay: false,
        }
    }

    pub fn with_replay(mut self) -> Self {
        self.replay = true;
        self
    }
}

// =============================================================================
// Deliveries
// =============================================================================

/// Callback invoked for every entry a subscription receives.
pub type Callback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// One entry handed to a subscriber.
#[derive(Debug)]
pub struct Delivery {
    pub entry: Entry,

    /// Present for durable subscriptions only.
    pub ack: Option<Ack>,
}

impl Delivery {
    pub fn event(&self) -> &str {
        &self.entry.event
    }

    pub fn message(&self) -> &[u8] {
        self.entry.message()
    }

    pub fn position(&self) -> Position {
        self.entry.position
    }
}

/// Releases the next replayed entry, or reports why it cannot be released.
pub(crate) type Gate = oneshot::Sender<std::result::Result<(), String>>;

/// Acknowledgment handle for one delivered entry.
///
/// Dropping a replay ack without calling [`Ack::ack`] halts that
/// subscriber's replay: nothing further is delivered until it resubscribes.
#[derive(Debug)]
pub struct Ack {
    offsets: OffsetStore,
    subscriber: SubscriberName,
    position: Position,
    gate: Option<Gate>,
}

impl Ack {
    pub(crate) fn live(offsets: OffsetStore, subscriber: SubscriberName, position: Position) -> Self {
        Self {
            offsets,
            subscriber,
            position,
            gate: None,
        }
    }

    pub(crate) fn gated(
        offsets: OffsetStore,
        subscriber: SubscriberName,
        position: Position,
        gate: Gate,
    ) -> Self {
        Self {
            offsets,
            subscriber,
            position,
            gate: Some(gate),
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn subscriber(&self) -> &SubscriberName {
        &self.subscriber
    }

    /// Persists the position and, during replay, releases the next entry.
    ///
    /// Returns the offset now stored for the subscriber.
    ///
    /// # Errors
    ///
    /// Store errors from persisting the offset. A failed replay ack ends the
    /// replay: the topic broadcasts [`Notice::ReplayError`](crate::Notice) and
    /// the subscription is cancelled.
    pub async fn ack(mut self) -> Result<Position> {
        let result = self.offsets.acknowledge(&self.subscriber, self.position).await;
        if let Some(gate) = self.gate.take() {
            let _ = gate.send(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        }
        result
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Where a subscription is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Replaying,
    Live,
    Cancelled,
}

/// A subscriber's registration on a topic.
///
/// Clones refer to the same registration; unsubscribing through any of them
/// cancels it.
#[derive(Clone)]
pub struct Subscription {
    id: ListenerId,
    filter: EventFilter,
    subscriber: Option<SubscriberName>,
    state: Arc<watch::Sender<SubscriptionState>>,
    cancel: CancellationToken,
    dispatcher: Arc<Dispatcher>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("subscriber", &self.subscriber)
            .field("state", &self.state())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        id: ListenerId,
        filter: EventFilter,
        subscriber: Option<SubscriberName>,
        initial: SubscriptionState,
        cancel: CancellationToken,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            id,
            filter,
            subscriber,
            state: Arc::new(state),
            cancel,
            dispatcher,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Durable subscriber name, if any.
    pub fn subscriber(&self) -> Option<&SubscriberName> {
        self.subscriber.as_ref()
    }

    pub fn is_durable(&self) -> bool {
        self.subscriber.is_some()
    }

    pub fn state(&self) -> SubscriptionState {
        if self.cancel.is_cancelled() {
            return SubscriptionState::Cancelled;
        }
        *self.state.borrow()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Moves `Replaying` to `Live`. Returns false if it was not replaying.
    pub(crate) fn go_live(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SubscriptionState::Replaying {
                *state = SubscriptionState::Live;
                true
            } else {
                false
            }
        })
    }

    /// Waits until the subscription receives live entries.
    ///
    /// # Errors
    ///
    /// `Error::Closed` if it is cancelled first.
    pub async fn live(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            reached = state.wait_for(|s| *s != SubscriptionState::Replaying) => {
                if matches!(reached.as_deref(), Ok(SubscriptionState::Live)) {
                    return Ok(());
                }
            }
        }
        Err(Error::Closed(format!("subscription {} was cancelled", self.id)))
    }

    /// Cancels the subscription.
    ///
    /// Stops any replay in progress, prevents a pending handoff and removes
    /// the live listener. No callback starts after this returns; one already
    /// running on another task may still finish. Safe to call from inside the
    /// subscription's own callback; calling it again is a no-op.
    pub fn unsubscribe(&self) {
        // Cancel before unregistering: an attach racing with us either sees
        // the token or registers first and is removed below.
        self.cancel.cancel();
        self.dispatcher.unregister(self.id);
        if self.state.send_replace(SubscriptionState::Cancelled) != SubscriptionState::Cancelled {
            tracing::debug!(subscription = %self.id, subscriber = ?self.subscriber, "unsubscribed");
        }
    }
}

// =============================================================================
// Live Join
// =============================================================================

/// Wraps an application callback as a dispatcher listener.
///
/// Durable listeners hand out ungated acks. Nothing is delivered once
/// `cancel` fires, even from a dispatch snapshot taken before it.
pub(crate) fn live_listener(
    callback: Callback,
    durable: Option<(OffsetStore, SubscriberName)>,
    cancel: CancellationToken,
) -> ListenerFn {
    Arc::new(move |entry: &Entry| {
        if cancel.is_cancelled() {
            return;
        }
        let ack = durable
            .as_ref()
            .map(|(offsets, name)| Ack::live(offsets.clone(), name.clone(), entry.position));
        callback(Delivery {
            entry: entry.clone(),
            ack,
        })
    })
}

/// Subscribes to entries published from now on.
///
/// Starts the tail at the current head if it is not running yet.
pub(crate) async fn join(
    tailer: &LiveTailer,
    offsets: &OffsetStore,
    filter: EventFilter,
    name: Option<SubscriberName>,
    callback: Callback,
    cancel: CancellationToken,
) -> Result<Subscription> {
    let dispatcher = Arc::clone(tailer.dispatcher());
    let id = dispatcher.allocate_id();
    let subscription = Subscription::new(
        id,
        filter.clone(),
        name.clone(),
        SubscriptionState::Live,
        cancel,
        dispatcher,
    );

    let now = tailer.latest().await?;
    let listener = live_listener(
        callback,
        name.map(|n| (offsets.clone(), n)),
        subscription.cancellation().clone(),
    );

    match tailer.attach(
        filter.key(),
        id,
        now,
        listener,
        AttachMode::FromTail,
        subscription.cancellation(),
    ) {
        Attach::Registered { floor } => {
            tracing::debug!(subscription = %id, filter = %filter, floor = %floor, "joined live tail");
            Ok(subscription)
        }
        Attach::Cancelled => Err(Error::Closed("topic is closing".into())),
        Attach::Stopped | Attach::Behind { .. } => {
            Err(Error::Tail("live tail is not running".into()))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
