//! Dedicated writer task for stream ports.
//!
//! Senders hand frames to the task through an mpsc channel; the task batches
//! whatever is ready into vectored writes and then completes each frame's
//! oneshot so `send` resolves only once the bytes are written.
//!
//! ```text
//! send() ─┐
//! send() ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► AsyncWrite
//! send() ─┘
//! ```

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::frame::{FrameHeader, FRAME_HEADER_SIZE};
use crate::error::{RemoteInvokeError, Result};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    prefix: [u8; FRAME_HEADER_SIZE],
    header: Bytes,
    body: Bytes,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl OutboundFrame {
    /// Create a frame from a message header and body.
    pub(crate) fn new(header: String, body: Bytes) -> Result<Self> {
        let prefix = FrameHeader::for_parts(&header, &body)?.encode();
        Ok(Self {
            prefix,
            header: Bytes::from(header),
            body,
            done: None,
        })
    }

    /// Total size of this frame.
    #[inline]
    fn size(&self) -> usize {
        FRAME_HEADER_SIZE + self.header.len() + self.body.len()
    }

    fn parts(&self) -> [&[u8]; 3] {
        [&self.prefix, &self.header, &self.body]
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame and wait until it has been written.
    ///
    /// Fails with `Timeout` if the queue stays full longer than the
    /// configured send timeout.
    pub(crate) async fn send(&self, mut frame: OutboundFrame) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        frame.done = Some(done_tx);

        match tokio::time::timeout(self.timeout, self.tx.send(frame)).await {
            Err(_) => {
                return Err(RemoteInvokeError::Timeout(
                    "stream writer queue is full".into(),
                ))
            }
            Ok(Err(_)) => return Err(RemoteInvokeError::ConnectionClosed),
            Ok(Ok(())) => {}
        }

        done_rx
            .await
            .unwrap_or(Err(RemoteInvokeError::ConnectionClosed))
    }
}

/// Spawn the writer task and return a handle for sending frames.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    channel_capacity: usize,
    send_timeout: Duration,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity.max(1));
    let handle = WriterHandle {
        tx,
        timeout: send_timeout,
    };
    let task = tokio::spawn(writer_loop(rx, writer));
    (handle, task)
}

/// Receive frames and write them in batches until the channel closes or a
/// write fails.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let result = write_batch(&mut writer, &batch).await;
        let failed = result.is_err();
        let message = result.as_ref().err().map(|e| e.to_string());

        for frame in &mut batch {
            if let Some(done) = frame.done.take() {
                let outcome = match &message {
                    None => Ok(()),
                    Some(msg) => Err(RemoteInvokeError::Transport(msg.clone())),
                };
                let _ = done.send(outcome);
            }
        }

        if failed {
            tracing::warn!("Stream writer stopped: {}", message.unwrap_or_default());
            rx.close();
            return result;
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RemoteInvokeError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for frame in batch {
        for part in frame.parts() {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
