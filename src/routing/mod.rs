//! Routing engine.
//!
//! The [`Engine`] owns the state of one module instance: its configuration,
//! its exports, the [`Dispatcher`] keyed listener registry and the
//! [`SendingManager`] of its ports. Inbound messages are parsed and routed
//! to the listener waiting on their key:
//!
//! | message                 | key                                         |
//! |-------------------------|---------------------------------------------|
//! | `invoke_response`       | `[invoke_response, requestMessageID]`       |
//! | `invoke_failed`         | `[invoke_failed, requestMessageID]`         |
//! | `invoke_finish`         | `[invoke_finish, sender, responseMessageID]`|
//! | `invoke_file_*`         | `[type, sender, messageID, id]`             |
//! | `broadcast`             | every prefix of `[broadcast, sender, ...path]` |
//! | `broadcast_*_finish`    | `[type, messageID]`                         |
//!
//! `invoke_request`, `broadcast_open` and `broadcast_close` are handled
//! directly. When the last port closes, every pending exchange is woken
//! through the `[_onClose]` subtree.

mod broadcast;
mod dispatch;
mod files;
mod invoke;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::RemoteInvokeConfig;
use crate::error::{RemoteInvokeError, Result};
use crate::event_key;
use crate::event_space::EventKey;
use crate::handler::{ExportHandler, ExportRegistry};
use crate::protocol::{InvokeFileFailedMessage, Message, MessageType};
use crate::sending_manager::{PortEvents, SendingManager};
use crate::transport::ConnectionPort;

use dispatch::{Dispatcher, Signal};
use files::FILE_NOT_FOUND;

pub use files::{IncomingFile, OutgoingFile, ReceivedFile};
pub use invoke::{InvokeRequest, InvokeResult};

/// Callback for internal errors.
pub(crate) type ErrorListener = Arc<dyn Fn(&RemoteInvokeError) + Send + Sync>;

/// State of one module instance.
pub(crate) struct Engine {
    config: RemoteInvokeConfig,
    dispatcher: Dispatcher,
    ports: Arc<SendingManager>,
    exports: Mutex<ExportRegistry>,
    handler_slots: Arc<Semaphore>,
    next_message_id: AtomicU64,
    error_listener: Mutex<Option<ErrorListener>>,
    /// Running broadcast open/close retransmissions by subscription key.
    handshakes: Mutex<HashMap<EventKey, (u64, JoinHandle<()>)>>,
}

/// Forwards port events to an engine without keeping it alive.
struct EngineLink(Weak<Engine>);

impl PortEvents for EngineLink {
    fn on_open(&self) {
        if let Some(engine) = self.0.upgrade() {
            engine.connection_opened();
        }
    }

    fn on_close(&self) {
        if let Some(engine) = self.0.upgrade() {
            engine.connection_closed();
        }
    }

    fn on_message(&self, header: String, body: Bytes) {
        if let Some(engine) = self.0.upgrade() {
            engine.on_message(header, body);
        }
    }
}

impl Engine {
    pub(crate) fn new(config: RemoteInvokeConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Engine>| Engine {
            dispatcher: Dispatcher::new(),
            ports: SendingManager::new(config.load_balance, Arc::new(EngineLink(weak.clone()))),
            exports: Mutex::new(ExportRegistry::new()),
            handler_slots: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            next_message_id: AtomicU64::new(0),
            error_listener: Mutex::new(None),
            handshakes: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Module name of this instance.
    pub(crate) fn name(&self) -> &str {
        &self.config.module_name
    }

    pub(crate) fn config(&self) -> &RemoteInvokeConfig {
        &self.config
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn ports(&self) -> &Arc<SendingManager> {
        &self.ports
    }

    pub(crate) fn connected(&self) -> bool {
        self.ports.connected()
    }

    pub(crate) fn next_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn exports(&self) -> MutexGuard<'_, ExportRegistry> {
        self.exports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn export(&self, path: &str) -> Option<Arc<dyn ExportHandler>> {
        self.exports().get(path)
    }

    pub(crate) fn handler_slots(&self) -> Arc<Semaphore> {
        self.handler_slots.clone()
    }

    pub(crate) fn set_error_listener(&self, listener: Option<ErrorListener>) {
        *self
            .error_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = listener;
    }

    /// Attach a port to this instance.
    pub(crate) fn add_port(&self, port: Arc<dyn ConnectionPort>) -> Result<()> {
        self.ports.add_port(port)
    }

    /// Serialize `message` and send it on one of the ports.
    pub(crate) async fn send_message(&self, message: Message) -> Result<()> {
        let (header, body) = message.pack()?;
        if self.config.print_message {
            tracing::info!("[{}] send {}", self.name(), message);
        }
        self.ports.send(header, body).await
    }

    /// Send `message` from a spawned task, reporting failures.
    pub(crate) fn send_detached(self: &Arc<Self>, message: Message) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.send_message(message).await {
                engine.report_error(&e);
            }
        });
    }

    /// Hand an internal error to the error listener, or log it.
    pub(crate) fn report_error(&self, error: &RemoteInvokeError) {
        let listener = self
            .error_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match listener {
            Some(listener) => {
                if self.config.print_error {
                    tracing::warn!("[{}] {}", self.name(), error);
                }
                listener(error);
            }
            None => tracing::error!("[{}] {}", self.name(), error),
        }
    }

    fn on_message(self: &Arc<Self>, header: String, body: Bytes) {
        let parsed = Message::parse(self.name(), &header, &body, self.config.max_path_length);
        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                self.report_error(&e);
                return;
            }
        };
        if self.config.print_message {
            tracing::info!("[{}] recv {}", self.name(), message);
        }

        match message {
            Message::InvokeRequest(request) => {
                tokio::spawn(self.clone().handle_invoke_request(request));
            }
            Message::BroadcastOpen(open) => self.on_broadcast_open(&open),
            Message::BroadcastClose(close) => self.on_broadcast_close(&close),
            Message::Broadcast(broadcast) => {
                self.on_broadcast(Arc::new(Message::Broadcast(broadcast)))
            }
            other => self.route(Arc::new(other)),
        }
    }

    /// Fire the listener waiting on the key of a reply message.
    fn route(self: &Arc<Self>, message: Arc<Message>) {
        let key = match &*message {
            Message::InvokeResponse(m) => {
                event_key![MessageType::InvokeResponse, m.request_message_id]
            }
            Message::InvokeFailed(m) => {
                event_key![MessageType::InvokeFailed, m.request_message_id]
            }
            Message::InvokeFinish(m) => event_key![
                MessageType::InvokeFinish,
                m.sender.as_str(),
                m.response_message_id
            ],
            Message::InvokeFileRequest(m) => event_key![
                MessageType::InvokeFileRequest,
                m.sender.as_str(),
                m.message_id,
                m.id
            ],
            Message::InvokeFileResponse(m) => event_key![
                MessageType::InvokeFileResponse,
                m.sender.as_str(),
                m.message_id,
                m.id
            ],
            Message::InvokeFileFailed(m) => event_key![
                MessageType::InvokeFileFailed,
                m.sender.as_str(),
                m.message_id,
                m.id
            ],
            Message::InvokeFileFinish(m) => event_key![
                MessageType::InvokeFileFinish,
                m.sender.as_str(),
                m.message_id,
                m.id
            ],
            Message::BroadcastOpenFinish(m) => {
                event_key![MessageType::BroadcastOpenFinish, m.message_id]
            }
            Message::BroadcastCloseFinish(m) => {
                event_key![MessageType::BroadcastCloseFinish, m.message_id]
            }
            Message::InvokeRequest(_)
            | Message::Broadcast(_)
            | Message::BroadcastOpen(_)
            | Message::BroadcastClose(_) => return,
        };

        if self.dispatcher.trigger(&key, Signal::Message(message.clone())) {
            return;
        }

        if let Message::InvokeFileRequest(request) = &*message {
            tracing::debug!("File request {} has no source", key);
            self.send_detached(Message::InvokeFileFailed(InvokeFileFailedMessage {
                sender: self.name().to_string(),
                receiver: request.sender.clone(),
                message_id: request.message_id,
                id: request.id,
                error: FILE_NOT_FOUND.to_string(),
            }));
        } else {
            tracing::debug!("Dropping {} with no listener", key);
        }
    }

    fn connection_opened(self: &Arc<Self>) {
        tracing::info!("[{}] connection open", self.name());
        self.reannounce_subscriptions();
    }

    fn connection_closed(&self) {
        tracing::info!("[{}] connection closed", self.name());
        let woken = self
            .dispatcher
            .trigger_descendants(&EventKey::new(MessageType::OnClose), Signal::Closed);
        if woken > 0 {
            tracing::debug!("Reset {} pending exchanges", woken);
        }
        self.reset_broadcast_state();
    }

    /// Close every port and stop background work.
    pub(crate) fn close(&self) {
        self.ports.close_all();
        self.reset_broadcast_state();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let tasks = self
            .handshakes
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, (_, task)) in tasks.drain() {
            task.abort();
        }
    }
}
