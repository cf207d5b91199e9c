//! File Transfer - pull-based file pieces in both directions.
//!
//! This example demonstrates:
//! - Attaching a buffer file to an invoke request
//! - Reading request files piece by piece inside an export
//! - Replying with a file produced on demand

use std::sync::Arc;

use bytes::Bytes;
use remote_invoke::handler::HandlerResult;
use remote_invoke::{
    BoxError, InvokeContext, InvokeReply, InvokeRequest, MemoryPort, OutgoingFile, RemoteInvoke,
};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (a, b) = MemoryPort::pair();

    let _storage = RemoteInvoke::builder("storage")
        .file_piece_size(64 * 1024)
        .export_raw("checksum", |mut ctx: InvokeContext| async move {
            let mut report = Vec::new();
            for mut file in ctx.take_files() {
                let mut sum: u64 = 0;
                let mut pieces = 0;
                while let Some(chunk) = file.next_chunk().await? {
                    sum = chunk.iter().fold(sum, |acc, b| acc.wrapping_add(*b as u64));
                    pieces += 1;
                }
                report.push(json!({
                    "name": file.name(),
                    "bytes": file.downloaded(),
                    "pieces": pieces,
                    "sum": sum,
                }));
            }
            HandlerResult::Ok(InvokeReply::new(json!(report)))
        })
        .export_raw("countdown", |ctx: InvokeContext| async move {
            let from: u64 = ctx.data_as()?;
            let lines = OutgoingFile::from_producer("countdown.txt", move |index| async move {
                let line = (index <= from).then(|| Bytes::from(format!("{}\n", from - index)));
                Ok::<_, BoxError>(line)
            });
            HandlerResult::Ok(InvokeReply::new(Value::Null).with_file(lines))
        })
        .port(Arc::new(a))
        .build()?;

    let app = RemoteInvoke::builder("app")
        .file_piece_size(64 * 1024)
        .port(Arc::new(b))
        .build()?;

    let blob: Vec<u8> = (0..1_000_000u32).map(|i| (i % 256) as u8).collect();
    let request = InvokeRequest::new(Value::Null)
        .with_file(OutgoingFile::from_bytes("blob.bin", blob))
        .with_file(OutgoingFile::from_bytes("hello.txt", "hello world"));
    let report = app.invoke_with("storage", "checksum", request).await?;
    println!("checksum -> {}", report.data);

    let countdown = app.invoke("storage", "countdown", &5).await?;
    if let Some(text) = countdown.file("countdown.txt") {
        print!("countdown.txt:\n{}", String::from_utf8_lossy(text));
    }

    Ok(())
}
