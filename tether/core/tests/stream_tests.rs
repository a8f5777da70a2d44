//! Stream Multiplexer Integration Tests
//!
//! Streams served by a real worker process (JSON-only channel, binary goes
//! as base64) and by a thread worker (binary goes as attachments).

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::NamedTempFile;

use tether_core::transport::thread_entry;
use tether_core::{
    create_supervisor_transport, load_config_from_path, Chunk, RestartPolicy, RpcBus,
    StreamConfig, StreamError, StreamMultiplexer, StreamSource, StreamState, SupervisorTransport,
    ThreadWorkerTransport, Transport, TransportType,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("operation timed out")
}

fn process_streams(config: StreamConfig) -> StreamMultiplexer {
    let transport = SupervisorTransport::spawn_process(
        "streams",
        tether_core::ProcessCommand::new(env!("CARGO_BIN_EXE_tether-worker")),
        RestartPolicy::Immediate,
    )
    .expect("worker should spawn");
    let bus = Arc::new(RpcBus::new(Arc::new(transport)));
    StreamMultiplexer::with_config(bus, config)
}

fn thread_streams() -> StreamMultiplexer {
    let entry = thread_entry(|worker: ThreadWorkerTransport| async move {
        let worker = Arc::new(worker);
        let bus = Arc::new(RpcBus::new(Arc::clone(&worker) as Arc<dyn Transport>));
        let streams = StreamMultiplexer::new(bus);
        streams.register_stream_handler("frames", |options: Value| async move {
            let count = options["count"].as_u64().unwrap_or(3);
            let frames = (0..count).map(|i| {
                #[allow(clippy::cast_possible_truncation)]
                let frame = Bytes::from(vec![i as u8; 4]);
                anyhow::Ok(Chunk::Binary(frame))
            });
            anyhow::Ok(
                StreamSource::new(futures::stream::iter(frames))
                    .with_context(json!({ "count": count })),
            )
        });
        worker.closed().await;
        anyhow::Ok(())
    });

    let transport = SupervisorTransport::spawn_thread("frames", entry, RestartPolicy::Immediate)
        .expect("thread should spawn");
    StreamMultiplexer::new(Arc::new(RpcBus::new(Arc::new(transport))))
}

// =============================================================================
// Process Worker Streams
// =============================================================================

#[tokio::test]
async fn test_process_echo_stream() {
    let streams = process_streams(StreamConfig::default());

    let mut stream = streams
        .open_stream(
            "echo",
            json!({"items": ["alpha", {"beta": 2}], "context": {"total": 2}}),
        )
        .unwrap();

    let context = within(stream.context(Some(Duration::from_secs(5))))
        .await
        .unwrap();
    assert_eq!(context, Some(json!({"total": 2})));
    assert_ne!(stream.state(), StreamState::AwaitingContext);

    let chunks: Vec<Chunk> = within((&mut stream).map(Result::unwrap).collect()).await;
    assert_eq!(
        chunks,
        vec![Chunk::from("alpha"), Chunk::Json(json!({"beta": 2}))]
    );
    assert_eq!(stream.state(), StreamState::Ended);

    streams.bus().close().await.unwrap();
}

#[tokio::test]
async fn test_process_binary_stream_uses_base64() {
    let streams = process_streams(StreamConfig::default());
    assert!(!streams.bus().supports_buffer());

    let stream = streams
        .open_stream("bytes", json!({"size": 1000, "chunk_size": 128}))
        .unwrap();
    let chunks: Vec<_> = within(stream.collect()).await;
    assert_eq!(chunks.len(), 8);

    let mut received = Vec::new();
    for chunk in chunks {
        match chunk.unwrap() {
            Chunk::Binary(bytes) => received.extend_from_slice(&bytes),
            other => panic!("expected binary chunk, got {other:?}"),
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    let expected: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
    assert_eq!(received, expected);

    streams.bus().close().await.unwrap();
}

#[tokio::test]
async fn test_process_factory_error() {
    let streams = process_streams(StreamConfig::default());

    let stream = streams
        .open_stream("bytes", json!({"size": 10, "chunk_size": 0}))
        .unwrap();
    let err = within(stream.context(None)).await.unwrap_err();
    assert!(
        matches!(err, StreamError::Remote { ref message, .. } if message.contains("chunk_size")),
        "unexpected error: {err}"
    );

    streams.bus().close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_stream_times_out_waiting_for_context() {
    let streams = process_streams(StreamConfig::default());

    let stream = streams.open_stream("no-such-stream", Value::Null).unwrap();
    let err = stream
        .context(Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::ContextTimeout { .. }));
    assert!(err.caller_backtrace().is_some());

    streams.bus().close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_stream_leaves_worker_usable() {
    let streams = process_streams(StreamConfig::default());

    let mut stream = streams
        .open_stream("count", json!({"to": 10_000, "delay_ms": 5}))
        .unwrap();
    for expected in 0..3 {
        let chunk = within(stream.next()).await.unwrap().unwrap();
        assert_eq!(chunk, Chunk::Json(json!(expected)));
    }
    drop(stream);

    let pong = within(streams.bus().request("ping", Value::Null))
        .await
        .unwrap();
    assert_eq!(pong, json!("pong"));

    streams.bus().close().await.unwrap();
}

#[tokio::test]
async fn test_process_slow_consumer_overflows() {
    let streams = process_streams(StreamConfig { buffer_capacity: 4 });

    let mut stream = streams
        .open_stream("count", json!({"to": 500}))
        .unwrap();
    within(stream.context(None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let items: Vec<_> = within((&mut stream).collect()).await;
    let last = items.last().expect("at least the overflow error");
    assert!(matches!(
        last,
        Err(StreamError::UnsupportedBackpressure { capacity: 4, .. })
    ));
    assert!(items.len() <= 5);
    assert_eq!(stream.state(), StreamState::Errored);

    streams.bus().close().await.unwrap();
}

// =============================================================================
// Thread Worker Streams
// =============================================================================

#[tokio::test]
async fn test_thread_binary_stream_uses_attachments() {
    let streams = thread_streams();
    assert!(streams.bus().supports_buffer());

    let mut stream = streams.open_stream("frames", json!({"count": 5})).unwrap();
    let context = within(stream.context(None)).await.unwrap();
    assert_eq!(context, Some(json!({"count": 5})));

    let frames: Vec<Chunk> = within((&mut stream).map(Result::unwrap).collect()).await;
    let expected: Vec<Chunk> = (0u8..5)
        .map(|i| Chunk::Binary(Bytes::from(vec![i; 4])))
        .collect();
    assert_eq!(frames, expected);

    streams.bus().close().await.unwrap();
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_config_file_drives_factory() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
service_name = "configured"

[transport]
kind = "process"
program = "{}"

[restart]
policy = "backoff"
initial_delay_ms = 10
max_delay_ms = 100

[stream]
buffer_capacity = 16
"#,
        env!("CARGO_BIN_EXE_tether-worker")
    )
    .unwrap();

    let config = load_config_from_path(Some(file.path())).unwrap();
    assert!(matches!(config.transport, TransportType::Process { .. }));

    let transport =
        create_supervisor_transport(&config.service_name, &config.transport_config(), None)
            .unwrap();
    let streams = StreamMultiplexer::with_config(Arc::new(RpcBus::new(transport)), config.stream);

    let whoami = within(streams.bus().request("whoami", Value::Null))
        .await
        .unwrap();
    assert_eq!(whoami["service"], json!("configured"));

    let items: Vec<_> = within(
        streams
            .open_stream("echo", json!({"items": ["one"]}))
            .unwrap()
            .collect(),
    )
    .await;
    assert_eq!(items.len(), 1);

    streams.bus().close().await.unwrap();
}
