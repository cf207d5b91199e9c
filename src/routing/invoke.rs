//! Invoke exchanges, caller and callee side.
//!
//! Caller: `SENT -> RESOLVED | REJECTED`. The request waits on
//! `[invoke_response, id]` and `[invoke_failed, id]`; the timer restarts
//! whenever the callee pulls a piece of a request file. A response carrying
//! files is resolved only after every file has been pulled, after which the
//! caller sends `invoke_finish`.
//!
//! Callee: look up the export, run it, answer with `invoke_response` or
//! `invoke_failed`. Files attached to the reply are served until the caller
//! sends `invoke_finish` or the transfer goes idle for one timeout.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::dispatch::{activity, deadline_elapsed, Signal};
use super::files::{FileServer, IncomingFile, OutgoingFile, ReceivedFile, TransferClock};
use super::Engine;
use crate::config::normalize_timeout;
use crate::error::{RemoteInvokeError, Result};
use crate::event_key;
use crate::handler::InvokeContext;
use crate::protocol::{
    check_path, InvokeFailedMessage, InvokeFinishMessage, InvokeRequestMessage,
    InvokeResponseMessage, Message, MessageType,
};

/// Error sent when nothing is exported at the invoked path.
pub(crate) const METHOD_NOT_FOUND: &str = "method not found";

/// Error sent when the handler concurrency limit is reached.
pub(crate) const TOO_MANY_INVOKES: &str = "too many concurrent invokes";

/// Arguments of one invoke.
#[derive(Debug, Default)]
pub struct InvokeRequest {
    /// Request data.
    pub data: Value,
    /// Files the callee may pull.
    pub files: Vec<OutgoingFile>,
    /// Per-call timeout. `None` uses the configured one; zero waits forever.
    pub timeout: Option<Duration>,
}

impl InvokeRequest {
    /// Request with `data`.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Request with serialized `value` as data.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Attach a file.
    pub fn with_file(mut self, file: OutgoingFile) -> Self {
        self.files.push(file);
        self
    }

    /// Override the timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a successful invoke.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResult {
    /// Response data.
    pub data: Value,
    /// Files attached to the response, fully pulled.
    pub files: Vec<ReceivedFile>,
}

impl InvokeResult {
    /// Deserialize the response data.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Contents of the file named `name`.
    pub fn file(&self, name: &str) -> Option<&Bytes> {
        self.files.iter().find(|f| f.name == name).map(|f| &f.data)
    }
}

impl Engine {
    /// Invoke `path` on `target` and wait for the result.
    pub(crate) async fn invoke(
        self: &Arc<Self>,
        target: &str,
        path: &str,
        request: InvokeRequest,
    ) -> Result<InvokeResult> {
        check_path(path, self.config().max_path_length)?;
        let timeout = match request.timeout {
            Some(timeout) => normalize_timeout(timeout),
            None => self.config().timeout,
        };

        let message_id = self.next_message_id();
        let mut waiter = self.dispatcher().waiter(vec![
            event_key![MessageType::InvokeResponse, message_id],
            event_key![MessageType::InvokeFailed, message_id],
        ]);

        let (server, files) = if request.files.is_empty() {
            (None, Vec::new())
        } else {
            let (server, files) = FileServer::start(self, target, message_id, request.files);
            (Some(server), files)
        };
        let served = server.as_ref().map(|server| server.activity());

        self.send_message(Message::InvokeRequest(InvokeRequestMessage {
            sender: self.name().to_string(),
            receiver: target.to_string(),
            path: path.to_string(),
            request_message_id: message_id,
            data: request.data,
            files,
        }))
        .await?;

        let mut deadline = timeout.map(|t| Instant::now() + t);
        let signal = loop {
            tokio::select! {
                signal = waiter.recv() => break signal,
                _ = deadline_elapsed(deadline) => {
                    tracing::debug!(
                        "Invoke {} of `{}` on `{}` timed out",
                        message_id,
                        path,
                        target
                    );
                    return Err(RemoteInvokeError::Timeout(format!(
                        "invoke `{}` on `{}` timed out",
                        path, target
                    )));
                }
                _ = activity(served.as_ref()) => {
                    deadline = timeout.map(|t| Instant::now() + t);
                }
            }
        };
        drop(waiter);
        drop(server);

        let message = match signal {
            Signal::Closed => return Err(RemoteInvokeError::ConnectionReset),
            Signal::Message(message) => message,
        };
        if message.sender() != target {
            return Err(RemoteInvokeError::SenderMismatch {
                expected: target.to_string(),
                actual: message.sender().to_string(),
            });
        }

        match &*message {
            Message::InvokeResponse(response) => self.collect_response(response).await,
            Message::InvokeFailed(failed) => Err(RemoteInvokeError::Remote {
                message: failed.error.clone(),
                stack: failed.stack.clone(),
            }),
            other => Err(RemoteInvokeError::protocol(format!(
                "unexpected {} for invoke {}",
                other.message_type(),
                message_id
            ))),
        }
    }

    /// Pull every file of `response`, then release the callee.
    async fn collect_response(
        self: &Arc<Self>,
        response: &InvokeResponseMessage,
    ) -> Result<InvokeResult> {
        if response.files.is_empty() {
            return Ok(InvokeResult {
                data: response.data.clone(),
                files: Vec::new(),
            });
        }

        let clock = TransferClock::new(self.config().timeout);
        let mut files = Vec::with_capacity(response.files.len());
        let mut outcome = Ok(());
        for descriptor in &response.files {
            let mut file = IncomingFile::new(
                self,
                &response.sender,
                response.response_message_id,
                descriptor.clone(),
                clock.clone(),
            );
            match file.read_all().await {
                Ok(data) => files.push(ReceivedFile {
                    name: descriptor.name.clone(),
                    data,
                }),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let finish = Message::InvokeFinish(InvokeFinishMessage {
            sender: self.name().to_string(),
            receiver: response.sender.clone(),
            response_message_id: response.response_message_id,
        });
        if let Err(e) = self.send_message(finish).await {
            self.report_error(&e);
        }

        outcome.map(|()| InvokeResult {
            data: response.data.clone(),
            files,
        })
    }

    /// Run the export for `request` and answer the caller.
    pub(crate) async fn handle_invoke_request(self: Arc<Self>, request: InvokeRequestMessage) {
        let Some(handler) = self.export(&request.path) else {
            tracing::debug!("No export at `{}` for `{}`", request.path, request.sender);
            self.send_failed(&request, METHOD_NOT_FOUND.to_string(), None).await;
            return;
        };

        let Ok(_permit) = self.handler_slots().try_acquire_owned() else {
            tracing::warn!(
                "Handler capacity reached, rejecting invoke {} of `{}`",
                request.request_message_id,
                request.path
            );
            self.send_failed(&request, TOO_MANY_INVOKES.to_string(), None).await;
            return;
        };

        let clock = TransferClock::new(self.config().timeout);
        let files = request
            .files
            .iter()
            .map(|descriptor| {
                IncomingFile::new(
                    &self,
                    &request.sender,
                    request.request_message_id,
                    descriptor.clone(),
                    clock.clone(),
                )
            })
            .collect();
        let ctx = InvokeContext::new(
            request.sender.clone(),
            request.path.clone(),
            request.data.clone(),
            files,
        );

        let reply = match handler.call(ctx).await {
            Ok(reply) => reply,
            Err(e) => {
                let stack = self.config().report_error_stack.then(|| format!("{:?}", e));
                self.send_failed(&request, e.to_string(), stack).await;
                return;
            }
        };

        let response_message_id = self.next_message_id();
        if reply.files.is_empty() {
            let response = self.response(&request, response_message_id, reply.data, Vec::new());
            if let Err(e) = self.send_message(response).await {
                self.report_error(&e);
            }
            return;
        }

        let mut finish = self.dispatcher().waiter(vec![event_key![
            MessageType::InvokeFinish,
            request.sender.as_str(),
            response_message_id
        ]]);
        let (server, files) =
            FileServer::start(&self, &request.sender, response_message_id, reply.files);
        let served = server.activity();

        let response = self.response(&request, response_message_id, reply.data, files);
        if let Err(e) = self.send_message(response).await {
            self.report_error(&e);
            return;
        }

        let timeout = self.config().timeout;
        let mut deadline = timeout.map(|t| Instant::now() + t);
        loop {
            tokio::select! {
                _ = finish.recv() => break,
                _ = deadline_elapsed(deadline) => {
                    tracing::debug!(
                        "Files of response {} to `{}` expired",
                        response_message_id,
                        request.sender
                    );
                    break;
                }
                _ = served.notified() => {
                    deadline = timeout.map(|t| Instant::now() + t);
                }
            }
        }
        server.release();
    }

    fn response(
        &self,
        request: &InvokeRequestMessage,
        response_message_id: u64,
        data: Value,
        files: Vec<crate::protocol::FileDescriptor>,
    ) -> Message {
        Message::InvokeResponse(InvokeResponseMessage {
            sender: self.name().to_string(),
            receiver: request.sender.clone(),
            request_message_id: request.request_message_id,
            response_message_id,
            data,
            files,
        })
    }

    async fn send_failed(
        &self,
        request: &InvokeRequestMessage,
        error: String,
        stack: Option<String>,
    ) {
        let failed = Message::InvokeFailed(InvokeFailedMessage {
            sender: self.name().to_string(),
            receiver: request.sender.clone(),
            request_message_id: request.request_message_id,
            error,
            stack,
        });
        if let Err(e) = self.send_message(failed).await {
            self.report_error(&e);
        }
    }
}
