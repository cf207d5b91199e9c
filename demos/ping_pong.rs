//! Ping Pong - request/response between two modules over TCP.
//!
//! This example demonstrates:
//! - Building a module with typed exports
//! - Connecting two modules with stream ports over a local TCP socket
//! - Remote errors and per-call timeouts
//!
//! Run with `RUST_LOG=remote_invoke=debug` to see protocol traffic.

use std::sync::Arc;
use std::time::Duration;

use remote_invoke::{BoxError, InvokeRequest, RemoteInvoke, StreamPort, StreamPortConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Input of the `greet` export.
#[derive(Serialize, Deserialize, Debug)]
struct Greeting {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let client_port = StreamPort::connect_tcp(addr, StreamPortConfig::default()).await?;
    let (socket, _) = listener.accept().await?;
    socket.set_nodelay(true)?;
    let server_port = StreamPort::new(socket, StreamPortConfig::default());

    let _server = RemoteInvoke::builder("server")
        .print_message(true)
        .export("ping", |_: (), _ctx| async { Ok::<_, BoxError>("pong") })
        .export("greet", |input: Greeting, ctx| async move {
            Ok::<_, BoxError>(format!("hello {}, from {}", input.name, ctx.sender()))
        })
        .export("fail", |_: (), _ctx| async {
            Err::<(), BoxError>("this export always fails".into())
        })
        .export("sleep", |ms: u64, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, BoxError>(ms)
        })
        .port(Arc::new(server_port))
        .build()?;

    let client = RemoteInvoke::builder("client")
        .port(Arc::new(client_port))
        .build()?;

    let pong = client.invoke("server", "ping", &()).await?;
    println!("ping -> {}", pong.data);

    let greeting: String = client
        .invoke("server", "greet", &Greeting { name: "world".into() })
        .await?
        .data_as()?;
    println!("greet -> {}", greeting);

    match client.invoke("server", "fail", &()).await {
        Ok(result) => println!("fail -> unexpected {}", result.data),
        Err(e) => println!("fail -> {}", e),
    }

    let request = InvokeRequest::json(&500u64)?.with_timeout(Duration::from_millis(100));
    match client.invoke_with("server", "sleep", request).await {
        Ok(result) => println!("sleep -> {}", result.data),
        Err(e) => println!("sleep -> {}", e),
    }

    let missing = client.invoke("server", "missing", &Value::Null).await;
    println!("missing -> {:?}", missing.map(|r| r.data));

    client.close();
    Ok(())
}
