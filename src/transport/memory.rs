//! In-process connection ports.
//!
//! [`MemoryPort::pair`] returns two connected ends. Each direction is an
//! ordered channel drained by a delivery task, so messages are delivered
//! asynchronously and in send order. Closing either end closes both.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use remote_invoke::transport::MemoryPort;
//!
//! let (a, b) = MemoryPort::pair();
//! client.add_connection_port(Arc::new(a))?;
//! server.add_connection_port(Arc::new(b))?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{ConnectionPort, PortCallbacks};
use crate::error::{RemoteInvokeError, Result};
use crate::handler::BoxFuture;

/// State shared by both ends of a pair.
struct Link {
    open: AtomicBool,
    ends: [Arc<End>; 2],
}

/// One end's callbacks.
struct End {
    callbacks: Mutex<Option<PortCallbacks>>,
    close_fired: AtomicBool,
}

impl End {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(None),
            close_fired: AtomicBool::new(false),
        }
    }

    fn callbacks(&self) -> Option<PortCallbacks> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fire_close(&self) {
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_close)();
        }
    }
}

/// One end of an in-process connection.
pub struct MemoryPort {
    link: Arc<Link>,
    side: usize,
    outbox: mpsc::UnboundedSender<(String, Bytes)>,
}

impl MemoryPort {
    /// Create two connected ports.
    ///
    /// Must be called within a tokio runtime; one delivery task is spawned
    /// per direction.
    pub fn pair() -> (MemoryPort, MemoryPort) {
        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            ends: [Arc::new(End::new()), Arc::new(End::new())],
        });

        let (to_b, rx_b) = mpsc::unbounded_channel();
        let (to_a, rx_a) = mpsc::unbounded_channel();

        tokio::spawn(deliver(link.clone(), 0, rx_a));
        tokio::spawn(deliver(link.clone(), 1, rx_b));

        let a = MemoryPort {
            link: link.clone(),
            side: 0,
            outbox: to_b,
        };
        let b = MemoryPort {
            link,
            side: 1,
            outbox: to_a,
        };
        (a, b)
    }
}

/// Deliver every queued message to `side`'s `on_message`.
async fn deliver(link: Arc<Link>, side: usize, mut rx: mpsc::UnboundedReceiver<(String, Bytes)>) {
    while let Some((header, body)) = rx.recv().await {
        if !link.open.load(Ordering::Acquire) {
            break;
        }
        if let Some(callbacks) = link.ends[side].callbacks() {
            (callbacks.on_message)(header, body);
        }
    }
}

impl ConnectionPort for MemoryPort {
    fn send(&self, header: String, body: Bytes) -> BoxFuture<'static, Result<()>> {
        let result = if self.link.open.load(Ordering::Acquire) {
            self.outbox
                .send((header, body))
                .map_err(|_| RemoteInvokeError::ConnectionClosed)
        } else {
            Err(RemoteInvokeError::ConnectionClosed)
        };
        Box::pin(async move { result })
    }

    fn close(&self) {
        if !self.link.open.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Memory port closed from side {}", self.side);
        self.link.ends[self.side].fire_close();
        self.link.ends[1 - self.side].fire_close();
    }

    fn connected(&self) -> bool {
        self.link.open.load(Ordering::Acquire)
    }

    fn bind(&self, callbacks: PortCallbacks) {
        *self.link.ends[self.side]
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callbacks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn recording(
        received: Arc<Mutex<Vec<String>>>,
        closes: Arc<AtomicUsize>,
    ) -> PortCallbacks {
        PortCallbacks {
            on_open: Arc::new(|| {}),
            on_close: Arc::new(move || {
                closes.fetch_add(1, Ordering::SeqCst);
            }),
            on_message: Arc::new(move |header, _body| {
                received.lock().unwrap().push(header);
            }),
        }
    }

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryPort::pair();
        let received = Arc::new(Mutex::new(Vec::new()));
        b.bind(recording(received.clone(), Arc::new(AtomicUsize::new(0))));

        for i in 0..5 {
            a.send(format!("h{}", i), Bytes::new()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*received.lock().unwrap(), vec!["h0", "h1", "h2", "h3", "h4"]);
    }

    #[tokio::test]
    async fn test_close_fires_both_ends_once() {
        let (a, b) = MemoryPort::pair();
        let closes_a = Arc::new(AtomicUsize::new(0));
        let closes_b = Arc::new(AtomicUsize::new(0));
        a.bind(recording(Arc::new(Mutex::new(Vec::new())), closes_a.clone()));
        b.bind(recording(Arc::new(Mutex::new(Vec::new())), closes_b.clone()));

        assert!(a.connected() && b.connected());
        b.close();
        a.close();

        assert!(!a.connected());
        assert_eq!(closes_a.load(Ordering::SeqCst), 1);
        assert_eq!(closes_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, _b) = MemoryPort::pair();
        a.close();
        let err = a.send("h".into(), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RemoteInvokeError::ConnectionClosed));
    }
}
