//! Broadcast - hierarchical subscriptions.
//!
//! This example demonstrates:
//! - Subscribing to a namespace and receiving everything below it
//! - Publishing only where the peer subscribed
//! - Unsubscribing and re-subscribing after a reconnect

use std::sync::Arc;
use std::time::Duration;

use remote_invoke::{BroadcastMessage, ConnectionPort, MemoryPort, RemoteInvoke};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

fn print_event(message: &BroadcastMessage) {
    println!("[{}] {} = {}", message.sender, message.path, message.data);
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let sensors = RemoteInvoke::builder("sensors").build()?;
    let dashboard = RemoteInvoke::builder("dashboard").build()?;

    let (a, b) = MemoryPort::pair();
    let link = Arc::new(a);
    sensors.add_connection_port(link.clone())?;
    dashboard.add_connection_port(Arc::new(b))?;

    let all_rooms = dashboard.receive("sensors", "room", print_event)?;
    dashboard.receive("sensors", "power.total", print_event)?;
    settle().await;

    for (path, value) in [
        ("room.kitchen.temperature", json!(21.5)),
        ("room.office.humidity", json!(40)),
        ("power.total", json!(1200)),
        ("power.kitchen", json!(300)),
    ] {
        let sent = sensors.broadcast(path, &value).await?;
        println!("publish {} -> {}", path, if sent { "sent" } else { "skipped" });
    }
    settle().await;

    dashboard.cancel_receive("sensors", "room", all_rooms);
    settle().await;
    let sent = sensors.broadcast("room.kitchen.temperature", &json!(22)).await?;
    println!("after unsubscribe -> {}", if sent { "sent" } else { "skipped" });

    link.close();
    let (a, b) = MemoryPort::pair();
    sensors.add_connection_port(Arc::new(a))?;
    dashboard.add_connection_port(Arc::new(b))?;
    settle().await;

    let sent = sensors.broadcast("power.total", &json!(1250)).await?;
    println!("after reconnect -> {}", if sent { "sent" } else { "skipped" });
    settle().await;

    Ok(())
}
