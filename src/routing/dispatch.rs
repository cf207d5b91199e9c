//! Dispatch glue between inbound messages and waiting exchanges.
//!
//! [`Dispatcher`] wraps the shared [`EventSpace`] behind a short critical
//! section: listeners are collected under the lock and run after it is
//! released, so a listener may freely register or cancel other keys.
//!
//! A [`Waiter`] is the async side of a pending exchange. It forwards every
//! signal fired at its keys into a channel and cancels its registrations
//! when dropped, so timeouts and early returns clean up by scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::event_key;
use crate::event_space::{EventKey, EventSpace, ListenerId};
use crate::protocol::{Message, MessageType};

/// What a listener is fired with.
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    /// An inbound message matched the listener's key.
    Message(Arc<Message>),
    /// The logical connection closed.
    Closed,
}

/// A registered callback.
pub(crate) type Listener = Arc<dyn Fn(Signal) + Send + Sync>;

/// Shared, lock-guarded listener registry of one engine.
#[derive(Clone, Default)]
pub(crate) struct Dispatcher {
    space: Arc<Mutex<EventSpace<Listener>>>,
    next_waiter: Arc<AtomicU64>,
}

fn fire(listeners: Vec<Listener>, signal: &Signal) -> usize {
    let count = listeners.len();
    for listener in listeners {
        listener(signal.clone());
    }
    count
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EventSpace<Listener>> {
        self.space.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, key: &EventKey, listener: Listener) -> ListenerId {
        self.lock().register(key, listener)
    }

    pub(crate) fn cancel(&self, key: &EventKey, id: Option<ListenerId>) -> bool {
        self.lock().cancel(key, id)
    }

    pub(crate) fn has(&self, key: &EventKey) -> bool {
        self.lock().has(key)
    }

    /// Fire the listeners at exactly `key`. Returns `false` if there were none.
    pub(crate) fn trigger(&self, key: &EventKey, signal: Signal) -> bool {
        let listeners = self.lock().trigger(key);
        fire(listeners, &signal) > 0
    }

    pub(crate) fn has_ancestors(&self, key: &EventKey, include_self: bool) -> bool {
        self.lock().has_ancestors(key, include_self)
    }

    /// Fire the listeners at every prefix of `key`, most specific first.
    pub(crate) fn trigger_ancestors(
        &self,
        key: &EventKey,
        include_self: bool,
        signal: Signal,
    ) -> usize {
        let listeners = self.lock().trigger_ancestors(key, include_self);
        fire(listeners, &signal)
    }

    pub(crate) fn cancel_ancestors(&self, key: &EventKey, include_self: bool) {
        self.lock().cancel_ancestors(key, include_self);
    }

    /// Fire every listener at or below `key`.
    pub(crate) fn trigger_descendants(&self, key: &EventKey, signal: Signal) -> usize {
        let listeners = self.lock().trigger_descendants(key, true);
        fire(listeners, &signal)
    }

    pub(crate) fn cancel_descendants(&self, key: &EventKey) {
        self.lock().cancel_descendants(key, true);
    }

    /// Keys at or below `prefix` that have listeners.
    pub(crate) fn keys(&self, prefix: &EventKey) -> Vec<EventKey> {
        self.lock().keys(prefix)
    }

    /// Start waiting for signals at `keys` and for connection close.
    pub(crate) fn waiter(&self, keys: Vec<EventKey>) -> Waiter {
        let (tx, rx) = mpsc::unbounded_channel::<Signal>();
        let close_key = event_key![
            MessageType::OnClose,
            self.next_waiter.fetch_add(1, Ordering::Relaxed)
        ];

        let mut space = self.lock();
        let entries = keys
            .into_iter()
            .chain(std::iter::once(close_key))
            .map(|key| {
                let tx = tx.clone();
                let listener: Listener = Arc::new(move |signal: Signal| {
                    let _ = tx.send(signal);
                });
                let id = space.register(&key, listener);
                (key, id)
            })
            .collect();
        drop(space);

        Waiter {
            dispatcher: self.clone(),
            entries,
            rx,
        }
    }
}

/// Pending-exchange registrations that are cancelled on drop.
pub(crate) struct Waiter {
    dispatcher: Dispatcher,
    entries: Vec<(EventKey, ListenerId)>,
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl Waiter {
    /// Next signal fired at one of the keys.
    pub(crate) async fn recv(&mut self) -> Signal {
        self.rx.recv().await.unwrap_or(Signal::Closed)
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut space = self.dispatcher.lock();
        for (key, id) in &self.entries {
            space.cancel(key, Some(*id));
        }
    }
}

/// Resolves once `deadline` passes; never resolves for `None`.
pub(crate) async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves on the next activity notification; never resolves for `None`.
pub(crate) async fn activity(notify: Option<&Arc<Notify>>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}
