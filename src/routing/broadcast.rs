//! Broadcast subscriptions.
//!
//! Local subscriptions live at `[broadcast, sender, ...path]`. The first
//! subscription on a path sends `broadcast_open`, the last cancellation
//! sends `broadcast_close`; both are retransmitted every retry interval
//! until acknowledged or the connection closes.
//!
//! The peer's interest lives in the whitelist at
//! `[_broadcast_white_list, sender, ...path]`. A publish goes on the wire
//! only if the whitelist holds its path or an ancestor of it.

use std::sync::{Arc, PoisonError};

use serde_json::Value;

use super::dispatch::{Listener, Signal};
use super::Engine;
use crate::error::Result;
use crate::event_key;
use crate::event_space::{EventKey, KeySegment, ListenerId};
use crate::protocol::{
    check_path, BroadcastCloseFinishMessage, BroadcastCloseMessage, BroadcastMessage,
    BroadcastOpenFinishMessage, BroadcastOpenMessage, Message, MessageType, PATH_SEPARATOR,
};

fn subscription_key(sender: &str, path: &str) -> EventKey {
    event_key![MessageType::Broadcast, sender].with_path(path)
}

fn whitelist_key(sender: &str, path: &str) -> EventKey {
    event_key![MessageType::BroadcastWhiteList, sender].with_path(path)
}

/// Split a subscription key back into `(sender, path)`.
fn subscription_of(key: &EventKey) -> Option<(String, String)> {
    let mut texts = key.segments().iter().skip(1).map(|segment| match segment {
        KeySegment::Text(text) => Some(text.as_str()),
        _ => None,
    });
    let sender = texts.next()??.to_string();
    let path = texts
        .collect::<Option<Vec<&str>>>()?
        .join(&PATH_SEPARATOR.to_string());
    Some((sender, path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Open,
    Close,
}

impl Engine {
    /// Subscribe `handler` to broadcasts of `sender` at or below `path`.
    pub(crate) fn receive<F>(
        self: &Arc<Self>,
        sender: &str,
        path: &str,
        handler: F,
    ) -> Result<ListenerId>
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        check_path(path, self.config().max_path_length)?;
        let key = subscription_key(sender, path);
        let listener: Listener = Arc::new(move |signal: Signal| {
            if let Signal::Message(message) = signal {
                if let Message::Broadcast(broadcast) = &*message {
                    handler(broadcast);
                }
            }
        });

        let first = !self.dispatcher().has(&key);
        let id = self.dispatcher().register(&key, listener);
        if first && self.connected() {
            self.start_handshake(Handshake::Open, sender, path);
        }
        Ok(id)
    }

    /// Remove one subscription (`Some(id)`) or all of them at `path`.
    ///
    /// Returns `false` if nothing was removed.
    pub(crate) fn cancel_receive(
        self: &Arc<Self>,
        sender: &str,
        path: &str,
        id: Option<ListenerId>,
    ) -> bool {
        let key = subscription_key(sender, path);
        let removed = self.dispatcher().cancel(&key, id);
        if removed && !self.dispatcher().has(&key) {
            if self.connected() {
                self.start_handshake(Handshake::Close, sender, path);
            } else {
                self.stop_handshake(&key);
            }
        }
        removed
    }

    /// Publish `data` at `path` if the peer subscribed to it.
    ///
    /// Returns `false` when nobody listens and nothing was sent.
    pub(crate) async fn broadcast(&self, path: &str, data: Value) -> Result<bool> {
        check_path(path, self.config().max_path_length)?;
        if !self
            .dispatcher()
            .has_ancestors(&whitelist_key(self.name(), path), true)
        {
            tracing::debug!("No subscriber for broadcast `{}`", path);
            return Ok(false);
        }
        self.send_message(Message::Broadcast(BroadcastMessage {
            sender: self.name().to_string(),
            path: path.to_string(),
            data,
        }))
        .await?;
        Ok(true)
    }

    pub(crate) fn on_broadcast(self: &Arc<Self>, message: Arc<Message>) {
        let Message::Broadcast(broadcast) = &*message else {
            return;
        };
        let key = subscription_key(&broadcast.sender, &broadcast.path);
        if self.dispatcher().has_ancestors(&key, true) {
            self.dispatcher()
                .trigger_ancestors(&key, true, Signal::Message(message.clone()));
            return;
        }

        tracing::debug!(
            "Unexpected broadcast `{}` from `{}`, closing",
            broadcast.path,
            broadcast.sender
        );
        let close = Message::BroadcastClose(BroadcastCloseMessage {
            sender: self.name().to_string(),
            receiver: broadcast.sender.clone(),
            message_id: self.next_message_id(),
            broadcast_sender: broadcast.sender.clone(),
            path: broadcast.path.clone(),
            include_ancestor: true,
        });
        self.send_detached(close);
    }

    pub(crate) fn on_broadcast_open(self: &Arc<Self>, open: &BroadcastOpenMessage) {
        let key = whitelist_key(&open.broadcast_sender, &open.path);
        let dispatcher = self.dispatcher();
        if !dispatcher.has(&key) {
            dispatcher.register(&key, Arc::new(|_: Signal| {}));
        }
        self.send_detached(Message::BroadcastOpenFinish(BroadcastOpenFinishMessage {
            sender: self.name().to_string(),
            receiver: open.sender.clone(),
            message_id: open.message_id,
        }));
    }

    pub(crate) fn on_broadcast_close(self: &Arc<Self>, close: &BroadcastCloseMessage) {
        let key = whitelist_key(&close.broadcast_sender, &close.path);
        if close.include_ancestor {
            self.dispatcher().cancel_ancestors(&key, true);
        } else {
            self.dispatcher().cancel(&key, None);
        }
        self.send_detached(Message::BroadcastCloseFinish(BroadcastCloseFinishMessage {
            sender: self.name().to_string(),
            receiver: close.sender.clone(),
            message_id: close.message_id,
        }));
    }

    /// Open every current subscription again after reconnecting.
    pub(crate) fn reannounce_subscriptions(self: &Arc<Self>) {
        let keys = self
            .dispatcher()
            .keys(&EventKey::new(MessageType::Broadcast));
        for key in keys {
            if let Some((sender, path)) = subscription_of(&key) {
                self.start_handshake(Handshake::Open, &sender, &path);
            }
        }
    }

    /// Forget the peer's subscriptions and stop every retransmission.
    pub(crate) fn reset_broadcast_state(&self) {
        self.dispatcher()
            .cancel_descendants(&EventKey::new(MessageType::BroadcastWhiteList));
        let tasks: Vec<_> = self
            .handshakes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, (_, task)) in tasks {
            task.abort();
        }
    }

    fn stop_handshake(&self, key: &EventKey) {
        let task = self
            .handshakes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some((_, task)) = task {
            task.abort();
        }
    }

    /// Send `broadcast_open`/`broadcast_close` until it is acknowledged.
    ///
    /// Replaces any handshake still running for the same path.
    fn start_handshake(self: &Arc<Self>, kind: Handshake, sender: &str, path: &str) {
        let key = subscription_key(sender, path);
        let message_id = self.next_message_id();
        let base = (self.name().to_string(), sender.to_string(), path.to_string());
        let (finish_type, message) = match kind {
            Handshake::Open => (
                MessageType::BroadcastOpenFinish,
                Message::BroadcastOpen(BroadcastOpenMessage {
                    sender: base.0,
                    receiver: base.1.clone(),
                    message_id,
                    broadcast_sender: base.1,
                    path: base.2,
                }),
            ),
            Handshake::Close => (
                MessageType::BroadcastCloseFinish,
                Message::BroadcastClose(BroadcastCloseMessage {
                    sender: base.0,
                    receiver: base.1.clone(),
                    message_id,
                    broadcast_sender: base.1,
                    path: base.2,
                    include_ancestor: false,
                }),
            ),
        };

        let interval = self.config().broadcast_retry_interval();
        let mut waiter = self
            .dispatcher()
            .waiter(vec![event_key![finish_type, message_id]]);
        let engine = Arc::downgrade(self);
        let task_key = key.clone();

        // Held until the task is recorded.
        let mut handshakes = self
            .handshakes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(async move {
            loop {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if let Err(e) = engine.send_message(message.clone()).await {
                    engine.report_error(&e);
                }
                drop(engine);

                tokio::select! {
                    _ = waiter.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        tracing::debug!("Retransmitting {:?} handshake for {}", kind, task_key);
                    }
                }
            }

            if let Some(engine) = engine.upgrade() {
                let mut handshakes = engine
                    .handshakes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if handshakes.get(&task_key).is_some_and(|(id, _)| *id == message_id) {
                    handshakes.remove(&task_key);
                }
            }
        });

        if let Some((_, previous)) = handshakes.insert(key, (message_id, task)) {
            previous.abort();
        }
    }

    #[cfg(test)]
    fn pending_handshakes(&self) -> usize {
        self.handshakes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
