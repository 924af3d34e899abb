//! # Dispatcher
//!
//! Routes tailed entries to in-process listeners. Listeners are registered
//! under an event key; the catch-all key [`WILDCARD_EVENT`] receives every
//! entry.
//!
//! ```text
//!                      ┌──────────────── Mutex ─────────────────┐
//!   tail loop ──────►  │ tail: Running(dispatched through)      │
//!   dispatch(entry)    │ listeners:                             │
//!                      │   "created" → [#1 floor 4, #3 floor 9] │
//!                      │   "message" → [#2 floor 0]             │
//!                      └────────────────────────────────────────┘
//!                         │ snapshot under lock
//!                         ▼
//!                      invoke callbacks outside the lock
//! ```
//!
//! ## Floors
//!
//! Every listener carries a floor position and only sees entries strictly
//! above it. A listener joining a tail that is still behind does not get
//! history it was never meant to see, and a replaying subscriber that hands
//! off at position `p` does not get `p` twice.
//!
//! ## Tail Cursor
//!
//! The position the tail has dispatched through lives under the same lock as
//! the listener table. [`Dispatcher::attach`] compares it with the caller's
//! floor and registers only when no entry above the floor has been dispatched
//! yet. Doing both under one lock closes the window where an entry could be
//! appended between "history exhausted" and "listener registered".
//!
//! Callbacks run outside the lock, so a callback may unregister itself (or
//! anyone else) without deadlocking.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::types::{Entry, Position, WILDCARD_EVENT};

/// Callback invoked with each entry a listener receives.
pub type ListenerFn = Arc<dyn Fn(&Entry) + Send + Sync>;

/// Registration token of one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Listener {
    id: ListenerId,
    floor: Position,
    callback: ListenerFn,
}

/// Progress of the topic's live tail as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailCursor {
    /// No tail loop has been started.
    Idle,
    /// A tail loop is running and has dispatched every entry up to this position.
    Running(Position),
    /// The tail loop stopped, either on close or after a read failure.
    Stopped,
}

/// Outcome of [`Dispatcher::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// The listener is registered and will see every entry above its floor.
    Registered { floor: Position },
    /// The tail already dispatched entries above the floor; read more history first.
    Behind { dispatched: Position },
    /// The caller's token was cancelled; nothing was registered.
    Cancelled,
    /// The tail is stopped and will never dispatch again.
    Stopped,
}

/// How [`Dispatcher::attach`] treats a floor the tail has already passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Only register if nothing above the floor was dispatched yet.
    Exact,
    /// Register anyway, raising the floor to the tail's position.
    FromTail,
}

struct DispatchState {
    listeners: HashMap<String, Vec<Listener>>,
    tail: TailCursor,
    next_id: u64,
}

/// Event-keyed multiplexer for one topic.
pub struct Dispatcher {
    state: Mutex<DispatchState>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Dispatcher")
            .field("tail", &state.tail)
            .field("listeners", &state.listeners.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DispatchState {
                listeners: HashMap::new(),
                tail: TailCursor::Idle,
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().expect("dispatcher mutex poisoned")
    }

    /// Hands out a fresh listener id without registering anything.
    pub fn allocate_id(&self) -> ListenerId {
        let mut state = self.lock();
        let id = ListenerId(state.next_id);
        state.next_id += 1;
        id
    }

    /// Registers a listener unconditionally and returns its token.
    #[cfg(test)]
    pub(crate) fn register(&self, key: &str, floor: Position, callback: ListenerFn) -> ListenerId {
        let id = self.allocate_id();
        self.lock()
            .listeners
            .entry(key.to_string())
            .or_default()
            .push(Listener { id, floor, callback });
        id
    }

    /// Registers a listener if the tail has not dispatched past its floor.
    ///
    /// `start_tail` is called with the floor, under the lock, when no tail is
    /// running yet; the cursor is set to the floor before it is called.
    pub fn attach(
        &self,
        key: &str,
        id: ListenerId,
        floor: Position,
        callback: ListenerFn,
        mode: AttachMode,
        cancel: &CancellationToken,
        start_tail: impl FnOnce(Position),
    ) -> Attach {
        let mut state = self.lock();

        if cancel.is_cancelled() {
            return Attach::Cancelled;
        }

        let floor = match state.tail {
            TailCursor::Stopped => return Attach::Stopped,
            TailCursor::Idle => {
                state.tail = TailCursor::Running(floor);
                start_tail(floor);
                floor
            }
            TailCursor::Running(dispatched) if dispatched <= floor => floor,
            TailCursor::Running(dispatched) => match mode {
                AttachMode::Exact => return Attach::Behind { dispatched },
                AttachMode::FromTail => dispatched,
            },
        };

        state
            .listeners
            .entry(key.to_string())
            .or_default()
            .push(Listener { id, floor, callback });

        Attach::Registered { floor }
    }

    /// Moves an idle tail to `Running(from)` and calls `start_tail` under the lock.
    ///
    /// Returns false, without calling it, if a tail was already started.
    #[cfg(test)]
    pub(crate) fn start_tail(&self, from: Position, start_tail: impl FnOnce(Position)) -> bool {
        let mut state = self.lock();
        if state.tail != TailCursor::Idle {
            return false;
        }
        state.tail = TailCursor::Running(from);
        start_tail(from);
        true
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let mut removed = false;
        state.listeners.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|l| l.id != id);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }

    /// Delivers an entry to every listener of its event and of the catch-all key.
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, entry: &Entry) -> usize {
        let targets: Vec<ListenerFn> = {
            let mut state = self.lock();
            if let TailCursor::Running(through) = state.tail {
                if entry.position > through {
                    state.tail = TailCursor::Running(entry.position);
                }
            }

            let named = (entry.event != WILDCARD_EVENT)
                .then(|| state.listeners.get(entry.event.as_str()))
                .flatten();
            let all = state.listeners.get(WILDCARD_EVENT);

            named
                .into_iter()
                .chain(all)
                .flatten()
                .filter(|l| entry.position > l.floor)
                .map(|l| Arc::clone(&l.callback))
                .collect()
        };

        for callback in &targets {
            callback(entry);
        }
        targets.len()
    }

    /// Current tail cursor.
    pub fn tail(&self) -> TailCursor {
        self.lock().tail
    }

    /// Marks the tail as stopped. Later attaches fail with [`Attach::Stopped`].
    pub fn stop_tail(&self) {
        self.lock().tail = TailCursor::Stopped;
    }

    /// Drops every listener.
    pub fn clear(&self) {
        self.lock().listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.values().map(Vec::len).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
