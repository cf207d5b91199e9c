//! Sending manager - the set of connection ports of one module instance.
//!
//! Each outgoing message is sent on one port. With load balancing on, the
//! manager scans forward from the last used port for one that is not
//! currently sending, and falls back to the next port if all are busy.
//!
//! Inbound messages from every port are forwarded to one [`PortEvents`]
//! sink. The sink also learns when the first port opens and when the last
//! open port closes, which is when the logical connection opens or drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;

use crate::error::{RemoteInvokeError, Result};
use crate::transport::{ConnectionPort, PortCallbacks};

/// Receiver of the manager's connection events.
pub(crate) trait PortEvents: Send + Sync + 'static {
    /// The first port opened.
    fn on_open(&self);
    /// The last open port closed.
    fn on_close(&self);
    /// A message arrived on any port.
    fn on_message(&self, header: String, body: Bytes);
}

/// An open port and its busy flag.
struct PortSlot {
    port: Arc<dyn ConnectionPort>,
    sending: Arc<AtomicBool>,
}

#[derive(Default)]
struct Ports {
    /// Every added port still alive, open or not.
    attached: Vec<Arc<dyn ConnectionPort>>,
    /// Ports eligible for sends, in open order.
    open: Vec<PortSlot>,
    /// Index of the last port used.
    last: usize,
}

/// Clears a port's busy flag when the send completes or is dropped.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn same_port(a: &Arc<dyn ConnectionPort>, b: &Arc<dyn ConnectionPort>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn is_port(a: &Arc<dyn ConnectionPort>, b: &Weak<dyn ConnectionPort>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), b.as_ptr() as *const ())
}

/// Owns the connection ports of one module instance.
pub(crate) struct SendingManager {
    load_balance: bool,
    ports: Mutex<Ports>,
    events: Arc<dyn PortEvents>,
}

impl SendingManager {
    pub(crate) fn new(load_balance: bool, events: Arc<dyn PortEvents>) -> Arc<Self> {
        Arc::new(Self {
            load_balance,
            ports: Mutex::new(Ports::default()),
            events,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ports> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a port. It becomes eligible for sends once it is open.
    pub(crate) fn add_port(self: &Arc<Self>, port: Arc<dyn ConnectionPort>) -> Result<()> {
        {
            let mut ports = self.lock();
            if ports.attached.iter().any(|p| same_port(p, &port)) {
                return Err(RemoteInvokeError::DuplicatePort);
            }
            ports.attached.push(port.clone());
        }

        let weak_port = Arc::downgrade(&port);
        let on_open = {
            let manager = Arc::downgrade(self);
            let weak_port = weak_port.clone();
            Arc::new(move || {
                if let (Some(manager), Some(port)) = (manager.upgrade(), weak_port.upgrade()) {
                    manager.port_opened(&port);
                }
            })
        };
        let on_close = {
            let manager = Arc::downgrade(self);
            let weak_port = weak_port.clone();
            Arc::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.port_closed(&weak_port);
                }
            })
        };
        let on_message = {
            let manager: Weak<Self> = Arc::downgrade(self);
            Arc::new(move |header: String, body: Bytes| {
                if let Some(manager) = manager.upgrade() {
                    manager.events.on_message(header, body);
                }
            })
        };

        port.bind(PortCallbacks {
            on_open,
            on_close,
            on_message,
        });

        if port.connected() {
            self.port_opened(&port);
        }
        Ok(())
    }

    fn port_opened(&self, port: &Arc<dyn ConnectionPort>) {
        let first = {
            let mut ports = self.lock();
            if ports.open.iter().any(|slot| same_port(&slot.port, port)) {
                return;
            }
            ports.open.push(PortSlot {
                port: port.clone(),
                sending: Arc::new(AtomicBool::new(false)),
            });
            ports.open.len() == 1
        };
        tracing::debug!("Connection port opened");
        if first {
            self.events.on_open();
        }
    }

    fn port_closed(&self, port: &Weak<dyn ConnectionPort>) {
        let last = {
            let mut ports = self.lock();
            let before = ports.open.len();
            ports.open.retain(|slot| !is_port(&slot.port, port));
            ports.attached.retain(|p| !is_port(p, port));
            if ports.last >= ports.open.len() {
                ports.last = 0;
            }
            before > 0 && ports.open.is_empty()
        };
        tracing::debug!("Connection port closed");
        if last {
            self.events.on_close();
        }
    }

    /// Choose a port for the next send.
    fn pick(&self) -> Result<(Arc<dyn ConnectionPort>, Arc<AtomicBool>)> {
        let mut ports = self.lock();
        let n = ports.open.len();
        if n == 0 {
            return Err(RemoteInvokeError::NoAvailablePort);
        }

        let index = if n == 1 || !self.load_balance {
            0
        } else {
            let last = ports.last;
            (1..n)
                .map(|step| (last + step) % n)
                .find(|&i| !ports.open[i].sending.load(Ordering::Acquire))
                .unwrap_or((last + 1) % n)
        };
        ports.last = index;

        let slot = &ports.open[index];
        slot.sending.store(true, Ordering::Release);
        Ok((slot.port.clone(), slot.sending.clone()))
    }

    /// Send one message on the chosen port.
    pub(crate) async fn send(&self, header: String, body: Bytes) -> Result<()> {
        let (port, sending) = self.pick()?;
        let _busy = BusyGuard(sending);
        port.send(header, body).await
    }

    /// Number of open ports.
    pub(crate) fn port_count(&self) -> usize {
        self.lock().open.len()
    }

    /// Check if at least one port is open.
    pub(crate) fn connected(&self) -> bool {
        !self.lock().open.is_empty()
    }

    /// Close every port.
    pub(crate) fn close_all(&self) {
        let ports: Vec<Arc<dyn ConnectionPort>> = self.lock().attached.clone();
        for port in ports {
            port.close();
        }
    }
}
