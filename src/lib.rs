//! # remote-invoke
//!
//! Transport-agnostic RPC between named modules, with pull-based file
//! transfer and hierarchical broadcast subscriptions.
//!
//! ## Architecture
//!
//! - **Facade**: [`RemoteInvoke`] exports handlers, invokes the peer,
//!   subscribes to and publishes broadcasts
//! - **Routing engine**: invoke, file-transfer and broadcast state machines
//!   correlated through a hierarchical [`event_space`]
//! - **Protocol**: typed messages packed to a JSON header and a JSON or
//!   binary body
//! - **Transport**: [`ConnectionPort`]s, load-balanced when there are several
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use remote_invoke::{MemoryPort, RemoteInvoke};
//!
//! #[tokio::main]
//! async fn main() -> remote_invoke::Result<()> {
//!     let (a, b) = MemoryPort::pair();
//!
//!     let _server = RemoteInvoke::builder("server")
//!         .export("ping", |_: (), _ctx| async { Ok::<_, std::io::Error>("pong") })
//!         .port(Arc::new(a))
//!         .build()?;
//!
//!     let client = RemoteInvoke::builder("client").port(Arc::new(b)).build()?;
//!     let reply = client.invoke("server", "ping", &()).await?;
//!     assert_eq!(reply.data, "pong");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod event_space;
pub mod handler;
pub mod protocol;
pub mod transport;

mod remote_invoke;
mod routing;
mod sending_manager;

pub use config::RemoteInvokeConfig;
pub use error::{BoxError, RemoteInvokeError, Result};
pub use event_space::{EventKey, ListenerId};
pub use handler::{InvokeContext, InvokeReply};
pub use protocol::BroadcastMessage;
pub use remote_invoke::{RemoteInvoke, RemoteInvokeBuilder};
pub use routing::{IncomingFile, InvokeRequest, InvokeResult, OutgoingFile, ReceivedFile};
pub use transport::{ConnectionPort, MemoryPort, PortCallbacks, StreamPort, StreamPortConfig};
