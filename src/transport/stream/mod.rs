//! Connection ports over byte streams.
//!
//! [`StreamPort`] carries messages as length-prefixed frames (see
//! [`FrameHeader`]) over any `AsyncRead + AsyncWrite` stream: TCP sockets,
//! Unix sockets, pipes or `tokio::io::duplex` in tests.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use remote_invoke::transport::{StreamPort, StreamPortConfig};
//!
//! let port = StreamPort::connect_tcp("127.0.0.1:7000", StreamPortConfig::default()).await?;
//! client.add_connection_port(Arc::new(port))?;
//! ```

mod frame;
mod frame_buffer;
mod writer;

pub use frame::{build_frame, Frame, FrameHeader, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
pub use frame_buffer::FrameBuffer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;

use self::writer::{spawn_writer_task, OutboundFrame, WriterHandle};
use super::{ConnectionPort, PortCallbacks};
use crate::error::{RemoteInvokeError, Result};
use crate::handler::BoxFuture;

/// Default writer queue capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default time a send may wait for queue space.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for a [`StreamPort`].
#[derive(Debug, Clone)]
pub struct StreamPortConfig {
    /// Largest accepted `header + body` size of an inbound frame.
    pub max_frame_size: u64,
    /// Capacity of the writer queue.
    pub channel_capacity: usize,
    /// Time a send may wait for queue space before failing.
    pub send_timeout: Duration,
}

impl Default for StreamPortConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

struct Shared {
    open: AtomicBool,
    close_fired: AtomicBool,
    callbacks: Mutex<Option<PortCallbacks>>,
}

impl Shared {
    fn callbacks(&self) -> Option<PortCallbacks> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fire_close(&self) {
        self.open.store(false, Ordering::Release);
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_close)();
        }
    }
}

type BoxedReader = ReadHalf<Box<dyn Stream>>;

/// Object-safe alias for a duplex byte stream.
trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A [`ConnectionPort`] over a byte stream.
///
/// The port is connected from construction. Reading starts at the first
/// [`bind`](ConnectionPort::bind), so no inbound message is lost before the
/// engine attaches.
pub struct StreamPort {
    shared: Arc<Shared>,
    writer: Mutex<Option<WriterHandle>>,
    reader: Mutex<Option<BoxedReader>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    max_frame_size: u64,
}

impl StreamPort {
    /// Wrap a connected stream.
    ///
    /// Must be called within a tokio runtime; the writer task is spawned
    /// immediately.
    pub fn new<S>(stream: S, config: StreamPortConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let boxed: Box<dyn Stream> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let (writer, task) =
            spawn_writer_task(write_half, config.channel_capacity, config.send_timeout);

        let shared = Arc::new(Shared {
            open: AtomicBool::new(true),
            close_fired: AtomicBool::new(false),
            callbacks: Mutex::new(None),
        });
        tokio::spawn(watch_writer(task, shared.clone()));

        Self {
            shared,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(read_half)),
            read_task: Mutex::new(None),
            max_frame_size: config.max_frame_size,
        }
    }

    /// Connect to a TCP endpoint.
    pub async fn connect_tcp<A: ToSocketAddrs>(addr: A, config: StreamPortConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!("Connected stream port to {:?}", stream.peer_addr().ok());
        Ok(Self::new(stream, config))
    }

    fn start_reading(&self) {
        let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let task = tokio::spawn(read_loop(reader, self.shared.clone(), self.max_frame_size));
        *self.read_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }
}

/// Read frames until EOF or error, delivering each to `on_message`.
async fn read_loop(mut reader: BoxedReader, shared: Arc<Shared>, max_frame_size: u64) {
    let mut frames = FrameBuffer::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Stream port reached EOF");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Stream port read failed: {}", e);
                break;
            }
        };

        let batch = match frames.push(&buf[..n]) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("Stream port framing error: {}", e);
                break;
            }
        };

        if batch.is_empty() {
            continue;
        }
        let Some(callbacks) = shared.callbacks() else {
            continue;
        };
        for frame in batch {
            let (header, body) = frame.into_parts();
            (callbacks.on_message)(header, body);
        }
    }

    shared.fire_close();
}

/// Close the port once the writer task stops on a write failure.
async fn watch_writer(task: JoinHandle<Result<()>>, shared: Arc<Shared>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => shared.fire_close(),
        Err(e) => {
            tracing::warn!("Stream writer task failed: {}", e);
            shared.fire_close();
        }
    }
}

impl ConnectionPort for StreamPort {
    fn send(&self, header: String, body: Bytes) -> BoxFuture<'static, Result<()>> {
        let writer = if self.shared.open.load(Ordering::Acquire) {
            self.writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        } else {
            None
        };

        Box::pin(async move {
            let writer = writer.ok_or(RemoteInvokeError::ConnectionClosed)?;
            let frame = OutboundFrame::new(header, body)?;
            writer.send(frame).await
        })
    }

    fn close(&self) {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Closing stream port");
        // Dropping the last handle lets the writer flush and shut down.
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.fire_close();
    }

    fn connected(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn bind(&self, callbacks: PortCallbacks) {
        *self
            .shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callbacks);
        self.start_reading();
    }
}

impl Drop for StreamPort {
    fn drop(&mut self) {
        if let Some(task) = self
            .read_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
