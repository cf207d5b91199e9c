//! Integration tests for remote-invoke.
//!
//! Two module instances talk over in-process port pairs or over stream
//! ports on `tokio::io::duplex`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use remote_invoke::handler::{BoxFuture, HandlerResult};
use remote_invoke::protocol::{
    BroadcastCloseMessage, BroadcastOpenMessage, FileDescriptor, InvokeFileRequestMessage,
    InvokeFileResponseMessage, InvokeRequestMessage, InvokeResponseMessage, Message,
};
use remote_invoke::{
    BoxError, BroadcastMessage, ConnectionPort, InvokeContext, InvokeReply, InvokeRequest,
    MemoryPort, OutgoingFile, PortCallbacks, RemoteInvoke, RemoteInvokeError, StreamPort,
    StreamPortConfig,
};

/// Connect two instances with a fresh memory port pair.
fn connect(a: &RemoteInvoke, b: &RemoteInvoke) -> (Arc<MemoryPort>, Arc<MemoryPort>) {
    let (left, right) = MemoryPort::pair();
    let (left, right) = (Arc::new(left), Arc::new(right));
    a.add_connection_port(left.clone()).unwrap();
    b.add_connection_port(right.clone()).unwrap();
    (left, right)
}

/// Poll `check` until it returns true or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while !check() {
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Publish once the peer has subscribed to `path`.
async fn publish_when_subscribed(publisher: &RemoteInvoke, path: &str, data: Value) {
    let start = Instant::now();
    while !publisher.broadcast(path, &data).await.unwrap() {
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "`{}` was never subscribed",
            path
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until publishing at `path` is skipped for lack of subscribers.
async fn wait_unsubscribed(publisher: &RemoteInvoke, path: &str) {
    let start = Instant::now();
    while publisher.broadcast(path, &Value::Null).await.unwrap() {
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "`{}` was never unsubscribed",
            path
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn collector() -> (
    impl Fn(&BroadcastMessage) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<(String, Value)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: &BroadcastMessage| {
        let _ = tx.send((message.path.clone(), message.data.clone()));
    };
    (handler, rx)
}

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// A peer driven message by message from the test.
struct ScriptedPeer {
    port: Arc<MemoryPort>,
    inbox: mpsc::UnboundedReceiver<Message>,
}

impl ScriptedPeer {
    /// Connect a peer named `name` to `module`.
    fn attach(name: &'static str, module: &RemoteInvoke) -> Self {
        let (left, right) = MemoryPort::pair();
        let (tx, inbox) = mpsc::unbounded_channel();
        right.bind(PortCallbacks {
            on_message: Arc::new(move |header: String, body: Bytes| {
                if let Ok(message) = Message::parse(name, &header, &body, 256) {
                    let _ = tx.send(message);
                }
            }),
            ..PortCallbacks::noop()
        });
        module.add_connection_port(Arc::new(left)).unwrap();
        Self {
            port: Arc::new(right),
            inbox,
        }
    }

    async fn send(&self, message: Message) {
        let (header, body) = message.pack().unwrap();
        self.port.send(header, body).await.unwrap();
    }

    async fn next(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(2), self.inbox.recv())
            .await
            .expect("peer received nothing")
            .expect("peer inbox closed")
    }

    async fn next_file_request(&mut self) -> InvokeFileRequestMessage {
        match self.next().await {
            Message::InvokeFileRequest(request) => request,
            other => panic!("expected a file request, got {}", other),
        }
    }

    async fn next_response(&mut self) -> InvokeResponseMessage {
        loop {
            if let Message::InvokeResponse(response) = self.next().await {
                return response;
            }
        }
    }
}

fn descriptor(id: u64, name: &str, size: Option<u64>) -> FileDescriptor {
    FileDescriptor {
        id,
        size,
        split_number: size.map(|_| 1),
        name: name.into(),
    }
}

/// `invoke_request` from `client` to `server` at `path` carrying `files`.
fn upload(path: &str, files: Vec<FileDescriptor>) -> Message {
    Message::InvokeRequest(InvokeRequestMessage {
        sender: "client".into(),
        receiver: "server".into(),
        path: path.into(),
        request_message_id: 1,
        data: Value::Null,
        files,
    })
}

fn piece(request: &InvokeFileRequestMessage, index: u64, data: &'static [u8]) -> Message {
    Message::InvokeFileResponse(InvokeFileResponseMessage {
        sender: request.receiver.clone(),
        receiver: request.sender.clone(),
        message_id: request.message_id,
        id: request.id,
        index,
        data: Bytes::from_static(data),
    })
}

/// Server whose `pull` export reads the first file and replies with the
/// outcome as text.
fn file_puller() -> RemoteInvoke {
    RemoteInvoke::builder("server")
        .export_raw("pull", |mut ctx: InvokeContext| async move {
            let text = match ctx.take_files()[0].read_all().await {
                Ok(data) => format!("ok {}", data.len()),
                Err(e) => e.to_string(),
            };
            HandlerResult::Ok(InvokeReply::new(json!(text)))
        })
        .build()
        .unwrap()
}

// ============================================================================
// Invoke
// ============================================================================

#[tokio::test]
async fn test_ping_pong() {
    let server = RemoteInvoke::builder("server")
        .export("ping", |_: (), _ctx| async { Ok::<_, BoxError>("pong") })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let result = client.invoke("server", "ping", &()).await.unwrap();
    assert_eq!(result.data, json!("pong"));
    assert!(result.files.is_empty());
}

#[tokio::test]
async fn test_typed_arguments_and_context() {
    let server = RemoteInvoke::builder("server")
        .export("add", |(x, y): (i64, i64), ctx: InvokeContext| async move {
            assert_eq!(ctx.sender(), "client");
            assert_eq!(ctx.path(), "add");
            Ok::<_, BoxError>(x + y)
        })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let sum: i64 = client
        .invoke("server", "add", &(40, 2))
        .await
        .unwrap()
        .data_as()
        .unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn test_handler_error_is_reported_to_caller() {
    let server = RemoteInvoke::builder("server")
        .export("explode", |_: (), _ctx| async {
            Err::<(), BoxError>("boom".into())
        })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let err = client.invoke("server", "explode", &()).await.unwrap_err();
    match err {
        RemoteInvokeError::Remote { message, stack } => {
            assert_eq!(message, "boom");
            assert_eq!(stack, None);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_error_stack_is_sent_when_enabled() {
    let server = RemoteInvoke::builder("server")
        .report_error_stack(true)
        .export("explode", |_: (), _ctx| async {
            Err::<(), BoxError>("boom".into())
        })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let err = client.invoke("server", "explode", &()).await.unwrap_err();
    assert!(matches!(
        err,
        RemoteInvokeError::Remote { stack: Some(_), .. }
    ));
}

#[tokio::test]
async fn test_method_not_found() {
    let server = RemoteInvoke::builder("server").build().unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let err = client.invoke("server", "missing", &()).await.unwrap_err();
    assert!(matches!(
        err,
        RemoteInvokeError::Remote { ref message, .. } if message == "method not found"
    ));
}

#[tokio::test]
async fn test_reexport_replaces_and_cancel_export() {
    let server = RemoteInvoke::builder("server").build().unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    server
        .export("v", |_: (), _ctx| async { Ok::<_, BoxError>(1) })
        .unwrap();
    server
        .export("v", |_: (), _ctx| async { Ok::<_, BoxError>(2) })
        .unwrap();
    let result = client.invoke("server", "v", &()).await.unwrap();
    assert_eq!(result.data, json!(2));

    assert!(server.cancel_export("v"));
    assert!(!server.cancel_export("v"));
    assert!(client.invoke("server", "v", &()).await.unwrap_err().is_remote());
}

#[tokio::test]
async fn test_timeout_and_late_response_ignored() {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let server = RemoteInvoke::builder("server")
        .export("slow", move |_: (), _ctx| {
            let done_tx = done_tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                let _ = done_tx.send(());
                Ok::<_, BoxError>("late")
            }
        })
        .export("fast", |_: (), _ctx| async { Ok::<_, BoxError>("fast") })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let start = Instant::now();
    let request = InvokeRequest::new(Value::Null).with_timeout(Duration::from_millis(50));
    let err = client.invoke_with("server", "slow", request).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() >= Duration::from_millis(50));

    // The late response arrives with no listener and is dropped.
    done_rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = client.invoke("server", "fast", &()).await.unwrap();
    assert_eq!(result.data, json!("fast"));
}

#[tokio::test]
async fn test_handler_limit_rejects_extra_invokes() {
    let server = RemoteInvoke::builder("server")
        .max_concurrent_handlers(1)
        .export("slow", |_: (), _ctx| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, BoxError>(())
        })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let (first, second) = tokio::join!(
        client.invoke("server", "slow", &()),
        client.invoke("server", "slow", &()),
    );
    let failures: Vec<_> = [first, second].into_iter().filter_map(|r| r.err()).collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        RemoteInvokeError::Remote { message, .. } if message == "too many concurrent invokes"
    ));
}

#[tokio::test]
async fn test_response_from_wrong_sender_is_rejected() {
    let client = RemoteInvoke::builder("client").build().unwrap();
    let (left, right) = MemoryPort::pair();
    let right = Arc::new(right);

    // A hand-driven peer that answers every request as someone else.
    let peer = right.clone();
    right.bind(PortCallbacks {
        on_message: Arc::new(move |header: String, body: Bytes| {
            let Ok(Message::InvokeRequest(request)) = Message::parse("server", &header, &body, 256)
            else {
                return;
            };
            let response = Message::InvokeResponse(InvokeResponseMessage {
                sender: "impostor".into(),
                receiver: request.sender,
                request_message_id: request.request_message_id,
                response_message_id: 0,
                data: json!(1),
                files: Vec::new(),
            });
            let (header, body) = response.pack().unwrap();
            tokio::spawn(peer.send(header, body));
        }),
        ..PortCallbacks::noop()
    });
    client.add_connection_port(Arc::new(left)).unwrap();

    let err = client.invoke("server", "p", &()).await.unwrap_err();
    match err {
        RemoteInvokeError::SenderMismatch { expected, actual } => {
            assert_eq!(expected, "server");
            assert_eq!(actual, "impostor");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_message_goes_to_error_listener() {
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let client = RemoteInvoke::builder("client")
        .on_error(move |e| {
            let _ = err_tx.send(e.to_string());
        })
        .build()
        .unwrap();
    let (left, right) = MemoryPort::pair();
    right.bind(PortCallbacks::noop());
    client.add_connection_port(Arc::new(left)).unwrap();

    right
        .send("[0,\"server\",\"somebody-else\",\"p\",1]".into(), Bytes::from_static(b"[null,null]"))
        .await
        .unwrap();
    right
        .send("not json".into(), Bytes::new())
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.contains("somebody-else"), "{}", first);
    let second = tokio::time::timeout(Duration::from_secs(1), err_rx.recv())
        .await
        .unwrap();
    assert!(second.is_some());
}

// ============================================================================
// Files
// ============================================================================

#[tokio::test]
async fn test_request_files_are_pulled_by_handler() {
    let server = RemoteInvoke::builder("server")
        .export_raw("upload", |mut ctx: InvokeContext| async move {
            let mut sizes = Vec::new();
            for mut file in ctx.take_files() {
                let data = file.read_all().await?;
                assert_eq!(data, pattern(data.len()));
                sizes.push(json!([file.name(), data.len()]));
            }
            HandlerResult::Ok(InvokeReply::new(json!(sizes)))
        })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client")
        .file_piece_size(1000)
        .build()
        .unwrap();
    connect(&server, &client);

    let request = InvokeRequest::new(Value::Null)
        .with_file(OutgoingFile::from_bytes("big", pattern(10_500)))
        .with_file(OutgoingFile::from_bytes("empty", Bytes::new()));
    let result = client.invoke_with("server", "upload", request).await.unwrap();
    assert_eq!(result.data, json!([["big", 10_500], ["empty", 0]]));
}

#[tokio::test]
async fn test_response_files_buffer_and_producer() {
    let server = RemoteInvoke::builder("server")
        .file_piece_size(4096)
        .export_raw("download", |_ctx: InvokeContext| async move {
            let stream = OutgoingFile::from_producer("stream", |index| async move {
                if index < 3 {
                    Ok(Some(Bytes::from(format!("chunk{};", index))))
                } else {
                    Ok::<_, BoxError>(None)
                }
            });
            HandlerResult::Ok(
                InvokeReply::new(json!("files"))
                    .with_file(OutgoingFile::from_bytes("buffer", pattern(20_000)))
                    .with_file(stream),
            )
        })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let result = client.invoke("server", "download", &()).await.unwrap();
    assert_eq!(result.data, json!("files"));
    assert_eq!(result.file("buffer").unwrap(), &pattern(20_000));
    assert_eq!(
        result.file("stream").unwrap(),
        &Bytes::from_static(b"chunk0;chunk1;chunk2;")
    );
}

#[tokio::test]
async fn test_incoming_file_reports_progress() {
    let server = RemoteInvoke::builder("server")
        .export_raw("inspect", |mut ctx: InvokeContext| async move {
            let mut files = ctx.take_files();
            let file = &mut files[0];
            assert_eq!(file.size(), Some(2500));
            assert_eq!(file.split_number(), Some(3));

            let mut pieces = 0;
            while let Some(chunk) = file.next_chunk().await? {
                assert!(chunk.len() <= 1000);
                pieces += 1;
            }
            assert_eq!(file.downloaded(), 2500);
            assert!(file.next_chunk().await?.is_none());
            HandlerResult::Ok(InvokeReply::new(json!(pieces)))
        })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client")
        .file_piece_size(1000)
        .build()
        .unwrap();
    connect(&server, &client);

    let request =
        InvokeRequest::new(Value::Null).with_file(OutgoingFile::from_bytes("f", pattern(2500)));
    let result = client.invoke_with("server", "inspect", request).await.unwrap();
    assert_eq!(result.data, json!(3));
}

#[tokio::test]
async fn test_served_pieces_keep_invoke_alive() {
    let server = RemoteInvoke::builder("server")
        .export_raw("consume", |mut ctx: InvokeContext| async move {
            let data = ctx.take_files()[0].read_all().await?;
            HandlerResult::Ok(InvokeReply::new(json!(data.len())))
        })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let slow = OutgoingFile::from_producer("slow", |index| async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok::<_, BoxError>((index < 5).then(|| Bytes::from_static(b"0123456789")))
    });
    let request = InvokeRequest::new(Value::Null)
        .with_file(slow)
        .with_timeout(Duration::from_millis(150));

    let result = client.invoke_with("server", "consume", request).await.unwrap();
    assert_eq!(result.data, json!(50));
}

#[tokio::test]
async fn test_connection_drop_resets_invoke_and_file_pull() {
    let (pull_tx, mut pull_rx) = mpsc::unbounded_channel();
    let server = RemoteInvoke::builder("server")
        .export_raw("hang", move |mut ctx: InvokeContext| {
            let pull_tx = pull_tx.clone();
            async move {
                let mut files = ctx.take_files();
                let first = files[0].next_chunk().await;
                let _ = pull_tx.send(first.map(|c| c.is_some()).map_err(|e| e.to_string()));
                let second = files[0].next_chunk().await;
                let _ = pull_tx.send(second.map(|c| c.is_some()).map_err(|e| e.to_string()));
                HandlerResult::Ok(InvokeReply::default())
            }
        })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    let (port, _) = connect(&server, &client);

    let stalled = OutgoingFile::from_producer("stalled", |index| async move {
        if index > 0 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok::<_, BoxError>(Some(Bytes::from_static(b"first")))
    });
    let request = InvokeRequest::new(Value::Null).with_file(stalled);
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.invoke_with("server", "hang", request).await }
    });

    assert_eq!(pull_rx.recv().await.unwrap(), Ok(true));
    // Let the second piece request reach the stalled producer.
    tokio::time::sleep(Duration::from_millis(20)).await;
    port.close();

    let invoke = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(invoke, Err(RemoteInvokeError::ConnectionReset)));

    let pull = tokio::time::timeout(Duration::from_secs(1), pull_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pull, Err(RemoteInvokeError::ConnectionReset.to_string()));
    assert!(!client.connected());
    assert!(!server.connected());
}

#[tokio::test]
async fn test_repeated_piece_index_revokes_file() {
    let client = RemoteInvoke::builder("client").build().unwrap();
    let mut peer = ScriptedPeer::attach("server", &client);

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            let request = InvokeRequest::new(Value::Null)
                .with_file(OutgoingFile::from_bytes("data", pattern(10)));
            client.invoke_with("server", "store", request).await
        }
    });

    let Message::InvokeRequest(request) = peer.next().await else {
        panic!("expected the invoke request");
    };
    assert_eq!(request.files, vec![descriptor(0, "data", Some(10))]);
    let file_request = |index| {
        Message::InvokeFileRequest(InvokeFileRequestMessage {
            sender: "server".into(),
            receiver: "client".into(),
            message_id: request.request_message_id,
            id: 0,
            index,
        })
    };

    peer.send(file_request(0)).await;
    match peer.next().await {
        Message::InvokeFileResponse(response) => {
            assert_eq!(response.index, 0);
            assert_eq!(response.data, pattern(10));
        }
        other => panic!("expected a piece, got {}", other),
    }

    peer.send(file_request(0)).await;
    match peer.next().await {
        Message::InvokeFileFailed(failed) => assert!(failed.error.contains("not after")),
        other => panic!("expected a failure, got {}", other),
    }

    // The file was revoked by the failure.
    peer.send(file_request(1)).await;
    match peer.next().await {
        Message::InvokeFileFailed(failed) => assert_eq!(failed.error, "file not found or expired"),
        other => panic!("expected a failure, got {}", other),
    }

    peer.send(Message::InvokeResponse(InvokeResponseMessage {
        sender: "server".into(),
        receiver: "client".into(),
        request_message_id: request.request_message_id,
        response_message_id: 0,
        data: json!("stored"),
        files: Vec::new(),
    }))
    .await;
    let result = pending.await.unwrap().unwrap();
    assert_eq!(result.data, json!("stored"));
}

#[tokio::test]
async fn test_unknown_file_request_is_answered_with_failure() {
    let client = RemoteInvoke::builder("client").build().unwrap();
    let mut peer = ScriptedPeer::attach("server", &client);

    peer.send(Message::InvokeFileRequest(InvokeFileRequestMessage {
        sender: "server".into(),
        receiver: "client".into(),
        message_id: 42,
        id: 3,
        index: 0,
    }))
    .await;

    match peer.next().await {
        Message::InvokeFileFailed(failed) => {
            assert_eq!(failed.message_id, 42);
            assert_eq!(failed.id, 3);
            assert_eq!(failed.error, "file not found or expired");
        }
        other => panic!("expected a failure, got {}", other),
    }
}

#[tokio::test]
async fn test_piece_with_wrong_index_fails_the_file() {
    let server = file_puller();
    let mut peer = ScriptedPeer::attach("client", &server);

    peer.send(upload("pull", vec![descriptor(0, "f", Some(4))])).await;
    let request = peer.next_file_request().await;
    assert_eq!(request.index, 0);
    peer.send(piece(&request, 5, b"abcd")).await;

    let response = peer.next_response().await;
    let text = response.data.as_str().unwrap();
    assert!(text.contains("expected piece 0 of `f`, got 5"), "{}", text);
}

#[tokio::test]
async fn test_piece_beyond_declared_size_fails_the_file() {
    let server = file_puller();
    let mut peer = ScriptedPeer::attach("client", &server);

    peer.send(upload("pull", vec![descriptor(0, "f", Some(4))])).await;
    let request = peer.next_file_request().await;
    peer.send(piece(&request, 0, b"0123456789")).await;

    let response = peer.next_response().await;
    let text = response.data.as_str().unwrap();
    assert!(text.contains("exceeds its declared size of 4 bytes"), "{}", text);
}

#[tokio::test]
async fn test_file_timer_expiry_fails_every_file() {
    let server = RemoteInvoke::builder("server")
        .timeout(Duration::from_millis(100))
        .export_raw("pull", |mut ctx: InvokeContext| async move {
            let mut files = ctx.take_files();
            let first = files[0].read_all().await;
            let start = Instant::now();
            let second = files[1].read_all().await;
            HandlerResult::Ok(InvokeReply::new(json!([
                first.is_err_and(|e| e.is_timeout()),
                second.is_err_and(|e| e.is_timeout()),
                start.elapsed() < Duration::from_millis(50),
            ])))
        })
        .build()
        .unwrap();
    let mut peer = ScriptedPeer::attach("client", &server);

    // Requests are never answered.
    peer.send(upload(
        "pull",
        vec![descriptor(0, "a", Some(4)), descriptor(1, "b", Some(4))],
    ))
    .await;

    let response = peer.next_response().await;
    assert_eq!(response.data, json!([true, true, true]));
}
// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test]
async fn test_broadcast_reaches_ancestor_subscription_only() {
    let server = RemoteInvoke::builder("server").build().unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let (namespace, mut namespace_rx) = collector();
    let (exact, mut exact_rx) = collector();
    client.receive("server", "a", namespace).unwrap();
    client.receive("server", "x.y.z", exact).unwrap();

    publish_when_subscribed(&server, "a.b.c", json!(1)).await;
    let (path, data) = namespace_rx.recv().await.unwrap();
    assert_eq!(path, "a.b.c");
    assert_eq!(data, json!(1));

    publish_when_subscribed(&server, "x.y.z", json!(3)).await;
    // Nobody listens at "x" itself, so nothing is sent.
    assert!(!server.broadcast("x", &json!(2)).await.unwrap());
    assert_eq!(exact_rx.recv().await.unwrap().1, json!(3));
    assert!(namespace_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_several_handlers_on_one_path() {
    let server = RemoteInvoke::builder("server").build().unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let hits = Arc::new(AtomicUsize::new(0));
    let ids: Vec<_> = (0..2)
        .map(|_| {
            let hits = hits.clone();
            client
                .receive("server", "topic", move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        })
        .collect();

    publish_when_subscribed(&server, "topic", json!("x")).await;
    eventually(|| hits.load(Ordering::SeqCst) == 2).await;

    assert!(client.cancel_receive("server", "topic", ids[0]));
    assert!(!client.cancel_receive("server", "topic", ids[0]));
    assert!(server.broadcast("topic", &"y").await.unwrap());
    eventually(|| hits.load(Ordering::SeqCst) == 3).await;
}

#[tokio::test]
async fn test_unsubscribed_topic_is_not_sent() {
    let server = RemoteInvoke::builder("server").build().unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    connect(&server, &client);

    let (handler, _rx) = collector();
    client.receive("server", "topic", handler).unwrap();
    publish_when_subscribed(&server, "topic", json!(1)).await;

    assert!(client.cancel_receive_all("server", "topic"));
    assert!(!client.cancel_receive_all("server", "topic"));
    wait_unsubscribed(&server, "topic").await;
}

#[tokio::test]
async fn test_subscriptions_are_reannounced_after_reconnect() {
    let server = RemoteInvoke::builder("server").build().unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();
    let (port, _) = connect(&server, &client);

    let (handler, mut rx) = collector();
    client.receive("server", "news", handler).unwrap();
    publish_when_subscribed(&server, "news", json!("first")).await;
    assert_eq!(rx.recv().await.unwrap().1, json!("first"));

    port.close();
    assert!(!server.connected());
    assert!(!server.broadcast("news", &"dropped").await.unwrap());

    connect(&server, &client);
    publish_when_subscribed(&server, "news", json!("second")).await;
    assert_eq!(rx.recv().await.unwrap().1, json!("second"));
}

#[tokio::test]
async fn test_subscribe_before_connecting() {
    let server = RemoteInvoke::builder("server").build().unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();

    let (handler, mut rx) = collector();
    client.receive("server", "early", handler).unwrap();
    connect(&server, &client);

    publish_when_subscribed(&server, "early", json!(true)).await;
    assert_eq!(rx.recv().await.unwrap().1, json!(true));
}

#[tokio::test]
async fn test_unexpected_broadcast_is_closed_with_ancestors() {
    let client = RemoteInvoke::builder("client").build().unwrap();
    let mut peer = ScriptedPeer::attach("server", &client);

    peer.send(Message::Broadcast(BroadcastMessage {
        sender: "server".into(),
        path: "news.today".into(),
        data: json!(1),
    }))
    .await;

    match peer.next().await {
        Message::BroadcastClose(close) => {
            assert_eq!(close.broadcast_sender, "server");
            assert_eq!(close.path, "news.today");
            assert!(close.include_ancestor);
        }
        other => panic!("expected a close, got {}", other),
    }
}

#[tokio::test]
async fn test_close_with_ancestors_prunes_whitelist() {
    let server = RemoteInvoke::builder("server").build().unwrap();
    let mut peer = ScriptedPeer::attach("client", &server);

    for (message_id, path) in [(1, "news"), (2, "news.today.local")] {
        peer.send(Message::BroadcastOpen(BroadcastOpenMessage {
            sender: "client".into(),
            receiver: "server".into(),
            message_id,
            broadcast_sender: "server".into(),
            path: path.into(),
        }))
        .await;
        assert!(matches!(
            peer.next().await,
            Message::BroadcastOpenFinish(f) if f.message_id == message_id
        ));
    }
    assert!(server.broadcast("news.today", &1).await.unwrap());
    assert!(matches!(peer.next().await, Message::Broadcast(b) if b.path == "news.today"));

    peer.send(Message::BroadcastClose(BroadcastCloseMessage {
        sender: "client".into(),
        receiver: "server".into(),
        message_id: 3,
        broadcast_sender: "server".into(),
        path: "news.today".into(),
        include_ancestor: true,
    }))
    .await;
    assert!(matches!(peer.next().await, Message::BroadcastCloseFinish(f) if f.message_id == 3));

    assert!(!server.broadcast("news", &2).await.unwrap());
    assert!(!server.broadcast("news.today", &2).await.unwrap());
    assert!(server.broadcast("news.today.local", &3).await.unwrap());
}

// ============================================================================
// Transports and load balancing
// ============================================================================

/// Memory port that counts its sends.
struct CountingPort {
    inner: MemoryPort,
    sent: AtomicUsize,
}

impl ConnectionPort for CountingPort {
    fn send(&self, header: String, body: Bytes) -> BoxFuture<'static, remote_invoke::Result<()>> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.inner.send(header, body)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn connected(&self) -> bool {
        self.inner.connected()
    }

    fn bind(&self, callbacks: PortCallbacks) {
        self.inner.bind(callbacks);
    }
}

#[tokio::test]
async fn test_load_balance_across_ports() {
    let server = RemoteInvoke::builder("server")
        .export("echo", |value: Value, _ctx| async move { Ok::<_, BoxError>(value) })
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client").build().unwrap();

    let mut counters = Vec::new();
    for _ in 0..2 {
        let (left, right) = MemoryPort::pair();
        let counting = Arc::new(CountingPort {
            inner: left,
            sent: AtomicUsize::new(0),
        });
        counters.push(counting.clone());
        client.add_connection_port(counting).unwrap();
        server.add_connection_port(Arc::new(right)).unwrap();
    }
    assert_eq!(client.port_count(), 2);

    for i in 0..20 {
        let result = client.invoke("server", "echo", &i).await.unwrap();
        assert_eq!(result.data, json!(i));
    }
    for counter in &counters {
        let sent = counter.sent.load(Ordering::SeqCst);
        assert!((9..=11).contains(&sent), "sent {}", sent);
    }

    counters[0].close();
    assert_eq!(client.port_count(), 1);
    assert!(client.connected());
    let result = client.invoke("server", "echo", &"still").await.unwrap();
    assert_eq!(result.data, json!("still"));
}

#[tokio::test]
async fn test_duplicate_port_is_rejected() {
    let client = RemoteInvoke::builder("client").build().unwrap();
    let (left, _right) = MemoryPort::pair();
    let left: Arc<dyn ConnectionPort> = Arc::new(left);

    client.add_connection_port(left.clone()).unwrap();
    assert!(matches!(
        client.add_connection_port(left),
        Err(RemoteInvokeError::DuplicatePort)
    ));
}

#[tokio::test]
async fn test_invoke_and_files_over_stream_ports() {
    let (a, b) = tokio::io::duplex(16 * 1024);
    let server = RemoteInvoke::builder("server")
        .file_piece_size(3000)
        .export_raw("reverse", |mut ctx: InvokeContext| async move {
            let mut data = ctx.take_files()[0].read_all().await?.to_vec();
            data.reverse();
            HandlerResult::Ok(
                InvokeReply::new(json!(data.len()))
                    .with_file(OutgoingFile::from_bytes("reversed", data)),
            )
        })
        .port(Arc::new(StreamPort::new(a, StreamPortConfig::default())))
        .build()
        .unwrap();
    let client = RemoteInvoke::builder("client")
        .file_piece_size(3000)
        .port(Arc::new(StreamPort::new(b, StreamPortConfig::default())))
        .build()
        .unwrap();
    assert!(server.connected() && client.connected());

    let input = pattern(50_000);
    let request =
        InvokeRequest::new(Value::Null).with_file(OutgoingFile::from_bytes("in", input.clone()));
    let result = client.invoke_with("server", "reverse", request).await.unwrap();

    let mut expected = input.to_vec();
    expected.reverse();
    assert_eq!(result.data, json!(50_000));
    assert_eq!(&result.file("reversed").unwrap()[..], &expected[..]);

    client.close();
    eventually(|| !server.connected()).await;
}
