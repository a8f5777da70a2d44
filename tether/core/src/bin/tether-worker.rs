//! Tether Worker - Reference Worker Process
//!
//! A small service meant to be spawned by a supervisor through the process
//! transport. It speaks frames on stdin/stdout, so all logging goes to
//! stderr.
//!
//! # Methods
//!
//! | Method     | Params          | Result                          |
//! |------------|-----------------|---------------------------------|
//! | `ping`     | -               | `"pong"`                        |
//! | `echo`     | any             | the params                      |
//! | `add`      | `{a, b}`        | `a + b`                         |
//! | `sleep`    | `{ms}`          | `ms`, after sleeping            |
//! | `whoami`   | -               | `{service, pid}`                |
//! | `ask_host` | `{method, params}` | result of calling back into the supervisor |
//! | `fail`     | `{message}`     | always an error                 |
//! | `crash`    | -               | never answers; exits with 101   |
//!
//! The `shutdown` notification closes the transport and exits cleanly.
//!
//! # Streams
//!
//! - `echo`: `{items, context}` sends each item back
//! - `bytes`: `{size, chunk_size}` sends `size` bytes `0, 1, 2, ...`
//! - `count`: `{to, delay_ms}` sends the numbers `0..to`
//!
//! # Usage
//!
//! ```bash
//! TETHER_SERVICE_NAME=calc RUST_LOG=debug tether-worker
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use tether_core::{
    Chunk, ProcessWorkerTransport, RpcBus, RpcErrorObject, StreamMultiplexer, StreamSource,
    Transport,
};

/// Exit code used by the `crash` method
const CRASH_EXIT_CODE: i32 = 101;

/// JSON-RPC "invalid params" code
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
struct AddParams {
    a: i64,
    b: i64,
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
}

#[derive(Debug, Deserialize)]
struct AskHostParams {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EchoStreamOptions {
    items: Vec<Value>,
    context: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BytesStreamOptions {
    size: usize,
    chunk_size: usize,
}

impl Default for BytesStreamOptions {
    fn default() -> Self {
        Self {
            size: 1024,
            chunk_size: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CountStreamOptions {
    to: u64,
    delay_ms: u64,
}

/// Initialize logging to stderr
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tether_worker=info,tether_core=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

async fn add(params: Value) -> Result<Value> {
    let AddParams { a, b } = serde_json::from_value(params).context("add expects {a, b}")?;
    let sum = a
        .checked_add(b)
        .ok_or_else(|| RpcErrorObject::new(INVALID_PARAMS, "add overflowed"))?;
    Ok(json!(sum))
}

async fn sleep(params: Value) -> Result<Value> {
    let SleepParams { ms } = serde_json::from_value(params).context("sleep expects {ms}")?;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(json!(ms))
}

async fn fail(params: Value) -> Result<Value> {
    let message = params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("requested failure");
    anyhow::bail!("{message}")
}

async fn crash(_params: Value) -> Result<Value> {
    error!("Crash requested, exiting with {CRASH_EXIT_CODE}");
    std::process::exit(CRASH_EXIT_CODE)
}

async fn ask_host(host: Option<Arc<RpcBus>>, params: Value) -> Result<Value> {
    let AskHostParams { method, params } =
        serde_json::from_value(params).context("ask_host expects {method, params}")?;
    let host = host.context("bus is shutting down")?;
    Ok(host.request(&method, params).await?)
}

async fn shutdown(transport: Arc<ProcessWorkerTransport>) -> Result<()> {
    info!("Shutdown requested");
    transport.close().await?;
    Ok(())
}

fn register_methods(bus: &Arc<RpcBus>, transport: &Arc<ProcessWorkerTransport>) {
    bus.set_request_handler("ping", |_| async { anyhow::Ok(json!("pong")) });
    bus.set_request_handler("echo", |params| async move { anyhow::Ok(params) });
    bus.set_request_handler("add", add);
    bus.set_request_handler("sleep", sleep);
    bus.set_request_handler("fail", fail);
    bus.set_request_handler("crash", crash);

    let whoami = json!({ "service": bus.service_name(), "pid": std::process::id() });
    bus.set_request_handler("whoami", move |_| {
        let whoami = whoami.clone();
        async move { anyhow::Ok(whoami) }
    });

    let host: Weak<RpcBus> = Arc::downgrade(bus);
    bus.set_request_handler("ask_host", move |params| ask_host(host.upgrade(), params));

    let transport = Arc::clone(transport);
    bus.add_notification_handler("shutdown", move |_| shutdown(Arc::clone(&transport)));
}

async fn echo_stream(options: Value) -> Result<StreamSource> {
    let options: EchoStreamOptions = serde_json::from_value(options)?;
    let chunks = options.items.into_iter().map(|item| {
        anyhow::Ok(match item {
            Value::String(text) => Chunk::Text(text),
            other => Chunk::Json(other),
        })
    });
    let source = StreamSource::new(futures::stream::iter(chunks));
    Ok(match options.context {
        Some(context) => source.with_context(context),
        None => source,
    })
}

async fn bytes_stream(options: Value) -> Result<StreamSource> {
    let options: BytesStreamOptions = serde_json::from_value(options)?;
    anyhow::ensure!(options.chunk_size > 0, "chunk_size must be positive");

    #[allow(clippy::cast_possible_truncation)]
    let payload: Vec<u8> = (0..options.size).map(|i| (i % 256) as u8).collect();
    let chunks: Vec<Result<Chunk>> = payload
        .chunks(options.chunk_size)
        .map(|chunk| Ok(Chunk::Binary(Bytes::copy_from_slice(chunk))))
        .collect();

    Ok(StreamSource::new(futures::stream::iter(chunks))
        .with_context(json!({ "size": options.size })))
}

async fn count_stream(options: Value) -> Result<StreamSource> {
    let options: CountStreamOptions = serde_json::from_value(options)?;
    let delay = Duration::from_millis(options.delay_ms);
    let to = options.to;
    let numbers = futures::stream::unfold(0u64, move |n| async move {
        if n >= to {
            return None;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Some((anyhow::Ok(Chunk::Json(json!(n))), n + 1))
    });
    Ok(StreamSource::new(numbers).with_context(json!({ "to": to })))
}

fn register_streams(streams: &StreamMultiplexer) {
    streams.register_stream_handler("echo", echo_stream);
    streams.register_stream_handler("bytes", bytes_stream);
    streams.register_stream_handler("count", count_stream);
}

// Every handler is registered before the bus dispatcher first runs
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();

    let transport = Arc::new(ProcessWorkerTransport::from_env()?);
    info!(
        service = %transport.service_name(),
        pid = std::process::id(),
        "Worker starting"
    );

    let bus = Arc::new(RpcBus::new(Arc::clone(&transport) as Arc<dyn Transport>));
    let streams = StreamMultiplexer::new(Arc::clone(&bus));

    register_methods(&bus, &transport);
    register_streams(&streams);

    transport.closed().await;
    info!(service = %transport.service_name(), "Supervisor went away, exiting");
    Ok(())
}
