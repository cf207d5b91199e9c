//! Pull-based file transfer.
//!
//! The side that attaches files runs a [`FileServer`]: one listener per file
//! at `[invoke_file_request, peer, messageID, id]`, answering each request
//! with exactly one piece, a finish or a failure. The other side pulls with
//! [`IncomingFile::next_chunk`], one request at a time, so the receiver
//! drives the pace.
//!
//! All files of one exchange share a [`TransferClock`]: every round trip
//! pushes its deadline out, and once it passes every file of the exchange
//! fails with a timeout.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::dispatch::{Listener, Signal};
use super::Engine;
use crate::error::{BoxError, RemoteInvokeError, Result};
use crate::event_key;
use crate::event_space::{EventKey, ListenerId};
use crate::handler::BoxFuture;
use crate::protocol::{
    split_number, FileDescriptor, InvokeFileFailedMessage, InvokeFileFinishMessage,
    InvokeFileRequestMessage, InvokeFileResponseMessage, Message, MessageType,
};

/// Error sent for requests of unknown or released files.
pub(crate) const FILE_NOT_FOUND: &str = "file not found or expired";

type ChunkProducer =
    Box<dyn FnMut(u64) -> BoxFuture<'static, std::result::Result<Option<Bytes>, BoxError>> + Send>;

enum FileSource {
    /// Known size; pieces are zero-copy slices.
    Buffer(Bytes),
    /// Unknown size; piece `index` is produced on request.
    Producer(ChunkProducer),
}

/// A file attached to an outgoing request or reply.
pub struct OutgoingFile {
    name: String,
    source: FileSource,
}

impl OutgoingFile {
    /// A file with known contents.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            source: FileSource::Buffer(data.into()),
        }
    }

    /// A file of unknown size produced piece by piece.
    ///
    /// The producer is called with increasing indices and returns
    /// `Ok(None)` once there is no more data.
    pub fn from_producer<F, Fut>(name: impl Into<String>, mut producer: F) -> Self
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Option<Bytes>, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            source: FileSource::Producer(Box::new(move |index| Box::pin(producer(index)))),
        }
    }

    /// File name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes, if known.
    pub fn size(&self) -> Option<u64> {
        match &self.source {
            FileSource::Buffer(data) => Some(data.len() as u64),
            FileSource::Producer(_) => None,
        }
    }

    fn descriptor(&self, id: u64, piece_size: usize) -> FileDescriptor {
        let size = self.size();
        FileDescriptor {
            id,
            size,
            split_number: size.map(|size| split_number(size, piece_size)),
            name: self.name.clone(),
        }
    }
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("size", &self.size())
            .finish()
    }
}

/// A fully pulled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// File name.
    pub name: String,
    /// File contents.
    pub data: Bytes,
}

struct ServedFile {
    source: FileSource,
    last_index: Option<u64>,
    closed: bool,
}

enum Piece {
    Data(u64, Bytes),
    Finish,
    Failed(String),
}

/// Serves the files of one message to one peer.
pub(crate) struct FileServer {
    engine: Weak<Engine>,
    peer: String,
    message_id: u64,
    piece_size: usize,
    files: Vec<Arc<tokio::sync::Mutex<ServedFile>>>,
    listeners: Mutex<Vec<Option<(EventKey, ListenerId)>>>,
    activity: Arc<Notify>,
}

impl FileServer {
    /// Start serving `files` of message `message_id` to `peer`.
    ///
    /// Returns the server and the descriptors to put on the wire.
    pub(crate) fn start(
        engine: &Arc<Engine>,
        peer: &str,
        message_id: u64,
        files: Vec<OutgoingFile>,
    ) -> (Arc<FileServer>, Vec<FileDescriptor>) {
        let piece_size = engine.config().file_piece_size;
        let descriptors = files
            .iter()
            .zip(0u64..)
            .map(|(file, id)| file.descriptor(id, piece_size))
            .collect();

        let server = Arc::new(FileServer {
            engine: Arc::downgrade(engine),
            peer: peer.to_string(),
            message_id,
            piece_size,
            files: files
                .into_iter()
                .map(|file| {
                    Arc::new(tokio::sync::Mutex::new(ServedFile {
                        source: file.source,
                        last_index: None,
                        closed: false,
                    }))
                })
                .collect(),
            listeners: Mutex::new(Vec::new()),
            activity: Arc::new(Notify::new()),
        });

        let dispatcher = engine.dispatcher();
        let registrations = (0..server.files.len() as u64)
            .map(|id| {
                let key = event_key![MessageType::InvokeFileRequest, peer, message_id, id];
                let weak = Arc::downgrade(&server);
                let listener: Listener = Arc::new(move |signal: Signal| {
                    let Signal::Message(message) = signal else {
                        return;
                    };
                    let Message::InvokeFileRequest(request) = &*message else {
                        return;
                    };
                    if let Some(server) = weak.upgrade() {
                        tokio::spawn(server.serve(id, request.index));
                    }
                });
                let listener_id = dispatcher.register(&key, listener);
                Some((key, listener_id))
            })
            .collect();
        *server.lock_listeners() = registrations;

        (server, descriptors)
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Option<(EventKey, ListenerId)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Notified after every served request.
    pub(crate) fn activity(&self) -> Arc<Notify> {
        self.activity.clone()
    }

    /// Stop accepting requests for file `id`.
    fn revoke(&self, id: u64) {
        let registration = self
            .lock_listeners()
            .get_mut(id as usize)
            .and_then(Option::take);
        if let (Some((key, listener_id)), Some(engine)) = (registration, self.engine.upgrade()) {
            engine.dispatcher().cancel(&key, Some(listener_id));
        }
    }

    /// Stop serving every file.
    pub(crate) fn release(&self) {
        let registrations: Vec<_> = self.lock_listeners().drain(..).flatten().collect();
        if let Some(engine) = self.engine.upgrade() {
            let dispatcher = engine.dispatcher();
            for (key, listener_id) in registrations {
                dispatcher.cancel(&key, Some(listener_id));
            }
        }
    }

    async fn serve(self: Arc<Self>, id: u64, index: u64) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let Some(file) = self.files.get(id as usize) else {
            return;
        };

        let mut file = file.lock().await;
        if file.closed {
            return;
        }

        let piece = match file.last_index {
            Some(last) if index <= last => Piece::Failed(format!(
                "file piece index {} is not after {}",
                index, last
            )),
            _ => {
                file.last_index = Some(index);
                self.produce(&mut file.source, index).await
            }
        };

        let message = match piece {
            Piece::Data(index, data) => Message::InvokeFileResponse(InvokeFileResponseMessage {
                sender: engine.name().to_string(),
                receiver: self.peer.clone(),
                message_id: self.message_id,
                id,
                index,
                data,
            }),
            Piece::Finish => {
                file.closed = true;
                self.revoke(id);
                Message::InvokeFileFinish(InvokeFileFinishMessage {
                    sender: engine.name().to_string(),
                    receiver: self.peer.clone(),
                    message_id: self.message_id,
                    id,
                })
            }
            Piece::Failed(error) => {
                tracing::debug!("Failing file {} of message {}: {}", id, self.message_id, error);
                file.closed = true;
                self.revoke(id);
                Message::InvokeFileFailed(InvokeFileFailedMessage {
                    sender: engine.name().to_string(),
                    receiver: self.peer.clone(),
                    message_id: self.message_id,
                    id,
                    error,
                })
            }
        };

        if let Err(e) = engine.send_message(message).await {
            engine.report_error(&e);
        }
        drop(file);
        self.activity.notify_one();
    }

    async fn produce(&self, source: &mut FileSource, index: u64) -> Piece {
        match source {
            FileSource::Buffer(data) => {
                let size = data.len() as u64;
                if index >= split_number(size, self.piece_size) {
                    return Piece::Finish;
                }
                let piece = self.piece_size as u64;
                let start = index * piece;
                let end = (start + piece).min(size);
                Piece::Data(index, data.slice(start as usize..end as usize))
            }
            FileSource::Producer(producer) => match producer(index).await {
                Ok(Some(data)) => Piece::Data(index, data),
                Ok(None) => Piece::Finish,
                Err(e) => Piece::Failed(e.to_string()),
            },
        }
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
struct ClockState {
    deadline: Option<Instant>,
    expired: bool,
}

/// Resettable deadline shared by every file of one exchange.
#[derive(Debug)]
pub(crate) struct TransferClock {
    timeout: Option<Duration>,
    state: Mutex<ClockState>,
}

impl TransferClock {
    pub(crate) fn new(timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            state: Mutex::new(ClockState {
                deadline: timeout.map(|t| Instant::now() + t),
                expired: false,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push the deadline out by one timeout.
    pub(crate) fn touch(&self) {
        let mut state = self.lock();
        if !state.expired {
            state.deadline = self.timeout.map(|t| Instant::now() + t);
        }
    }

    /// Resolves once the deadline passes without being pushed out.
    pub(crate) async fn expired(&self) {
        loop {
            let deadline = {
                let state = self.lock();
                if state.expired {
                    return;
                }
                state.deadline
            };
            let Some(deadline) = deadline else {
                return std::future::pending().await;
            };
            tokio::time::sleep_until(deadline).await;

            let mut state = self.lock();
            if state.deadline.is_some_and(|d| d <= Instant::now()) {
                state.expired = true;
                return;
            }
        }
    }
}

/// A file announced by the peer, pulled on demand.
pub struct IncomingFile {
    descriptor: FileDescriptor,
    peer: String,
    message_id: u64,
    engine: Weak<Engine>,
    clock: Arc<TransferClock>,
    next_index: u64,
    downloaded: u64,
    finished: bool,
    failure: Option<String>,
}

impl IncomingFile {
    pub(crate) fn new(
        engine: &Arc<Engine>,
        peer: &str,
        message_id: u64,
        descriptor: FileDescriptor,
        clock: Arc<TransferClock>,
    ) -> Self {
        Self {
            descriptor,
            peer: peer.to_string(),
            message_id,
            engine: Arc::downgrade(engine),
            clock,
            next_index: 0,
            downloaded: 0,
            finished: false,
            failure: None,
        }
    }

    /// File name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Declared size, if the sender knows it.
    pub fn size(&self) -> Option<u64> {
        self.descriptor.size
    }

    /// Declared number of pieces, if the sender knows it.
    pub fn split_number(&self) -> Option<u64> {
        self.descriptor.split_number
    }

    /// Bytes received so far.
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Pull the next piece. Returns `Ok(None)` once the file is complete.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        if let Some(failure) = &self.failure {
            return Err(RemoteInvokeError::FileTransfer(failure.clone()));
        }
        match self.pull().await {
            Err(e) => {
                self.failure = Some(e.to_string());
                Err(e)
            }
            ok => ok,
        }
    }

    /// Pull the remaining pieces and concatenate them.
    pub async fn read_all(&mut self) -> Result<Bytes> {
        // The declared size is untrusted; reserve at most one piece up front.
        let piece = self
            .engine
            .upgrade()
            .map_or(0, |engine| engine.config().file_piece_size as u64);
        let remaining = self.size().unwrap_or(0).saturating_sub(self.downloaded);
        let mut buf = BytesMut::with_capacity(remaining.min(piece) as usize);
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    async fn pull(&mut self) -> Result<Option<Bytes>> {
        let engine = self
            .engine
            .upgrade()
            .ok_or(RemoteInvokeError::ConnectionReset)?;
        let index = self.next_index;
        let (peer, message_id, id) = (self.peer.as_str(), self.message_id, self.descriptor.id);

        let mut waiter = engine.dispatcher().waiter(vec![
            event_key![MessageType::InvokeFileResponse, peer, message_id, id],
            event_key![MessageType::InvokeFileFailed, peer, message_id, id],
            event_key![MessageType::InvokeFileFinish, peer, message_id, id],
        ]);

        self.clock.touch();
        engine
            .send_message(Message::InvokeFileRequest(InvokeFileRequestMessage {
                sender: engine.name().to_string(),
                receiver: peer.to_string(),
                message_id,
                id,
                index,
            }))
            .await?;
        drop(engine);

        let signal = tokio::select! {
            signal = waiter.recv() => signal,
            _ = self.clock.expired() => {
                return Err(RemoteInvokeError::Timeout(format!(
                    "file `{}` timed out at piece {}",
                    self.descriptor.name, index
                )));
            }
        };

        let message = match signal {
            Signal::Closed => return Err(RemoteInvokeError::ConnectionReset),
            Signal::Message(message) => message,
        };

        match &*message {
            Message::InvokeFileResponse(response) => {
                if response.index != index {
                    return Err(RemoteInvokeError::FileTransfer(format!(
                        "expected piece {} of `{}`, got {}",
                        index, self.descriptor.name, response.index
                    )));
                }
                let downloaded = self.downloaded + response.data.len() as u64;
                if let Some(size) = self.descriptor.size {
                    if downloaded > size {
                        return Err(RemoteInvokeError::FileTransfer(format!(
                            "`{}` exceeds its declared size of {} bytes",
                            self.descriptor.name, size
                        )));
                    }
                }
                self.downloaded = downloaded;
                self.next_index += 1;
                self.clock.touch();
                Ok(Some(response.data.clone()))
            }
            Message::InvokeFileFinish(_) => {
                self.finished = true;
                self.clock.touch();
                Ok(None)
            }
            Message::InvokeFileFailed(failed) => {
                Err(RemoteInvokeError::FileTransfer(failed.error.clone()))
            }
            other => Err(RemoteInvokeError::protocol(format!(
                "unexpected {} during file transfer",
                other.message_type()
            ))),
        }
    }
}

impl fmt::Debug for IncomingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingFile")
            .field("name", &self.descriptor.name)
            .field("size", &self.descriptor.size)
            .field("downloaded", &self.downloaded)
            .field("finished", &self.finished)
            .finish()
    }
}
