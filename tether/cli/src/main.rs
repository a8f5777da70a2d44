//! Tether CLI - Talk to a Supervised Worker
//!
//! Spawns a worker process under supervision, performs one operation on its
//! bus, prints the outcome to stdout and shuts the worker down.
//!
//! # Usage
//!
//! ```bash
//! # Call a method
//! tether --worker ./target/debug/tether-worker call add '{"a": 1, "b": 2}'
//!
//! # Send a notification
//! tether --worker ./target/debug/tether-worker notify shutdown
//!
//! # Consume a stream, one chunk per line
//! tether --worker ./target/debug/tether-worker stream count '{"to": 5}'
//!
//! # With config file
//! tether --config /etc/tether/worker.toml call ping
//!
//! # Verbose logging
//! RUST_LOG=debug tether call ping
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info};

use tether_core::{
    create_supervisor_transport, load_config_from_path, Chunk, ConfigOverrides, RestartPolicy,
    RpcBus, StreamMultiplexer, TetherConfig,
};

/// Tether - drive a supervised JSON-RPC worker from the command line
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker executable (selects the process transport)
    #[arg(short = 'w', long, env = "TETHER_WORKER_PROGRAM", value_name = "PATH")]
    worker: Option<PathBuf>,

    /// Extra argument passed to the worker (repeatable)
    #[arg(long = "worker-arg", value_name = "ARG")]
    worker_args: Vec<String>,

    /// Logical service name announced to the worker
    #[arg(short = 's', long, value_name = "NAME")]
    service: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "TETHER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Restart policy for the worker
    #[arg(short = 'r', long, value_enum)]
    restart: Option<RestartArg>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "TETHER_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a request and print its result
    Call {
        /// Method name
        method: String,
        /// Parameters as JSON
        #[arg(default_value = "null")]
        params: String,
        /// Give up after this many milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Send a notification
    Notify {
        /// Method name
        method: String,
        /// Parameters as JSON
        #[arg(default_value = "null")]
        params: String,
    },

    /// Open a stream and print every chunk
    Stream {
        /// Stream name
        name: String,
        /// Options as JSON
        #[arg(default_value = "null")]
        options: String,
        /// Chunks buffered before the stream is abandoned
        #[arg(long, value_name = "N")]
        buffer: Option<usize>,
        /// Give up waiting for the stream context after this many milliseconds
        #[arg(long, value_name = "MS", default_value_t = 5_000)]
        context_timeout_ms: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RestartArg {
    Immediate,
    Backoff,
    Disabled,
}

impl From<RestartArg> for RestartPolicy {
    fn from(arg: RestartArg) -> Self {
        match arg {
            RestartArg::Immediate => Self::Immediate,
            RestartArg::Backoff => Self::Backoff {
                initial_delay_ms: 100,
                max_delay_ms: 30_000,
                max_restarts: None,
            },
            RestartArg::Disabled => Self::Disabled,
        }
    }
}

/// Initialize logging to stderr with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("tether={level},tether_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_json(text: &str, what: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("{what} is not valid JSON: {text}"))
}

fn resolve_config(args: &Args) -> Result<TetherConfig> {
    let mut config = load_config_from_path(args.config.as_deref())
        .context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(service) = &args.service {
        overrides = overrides.with_service_name(service.clone());
    }
    if let Some(worker) = &args.worker {
        overrides = overrides.with_worker_program(worker.clone());
    }
    if !args.worker_args.is_empty() {
        overrides = overrides.with_worker_args(args.worker_args.clone());
    }
    if let Some(restart) = args.restart {
        overrides = overrides.with_restart(restart.into());
    }
    if let Command::Stream {
        buffer: Some(buffer),
        ..
    } = &args.command
    {
        overrides = overrides.with_buffer_capacity(*buffer);
    }
    overrides.apply(&mut config);
    config.validate()?;

    debug!(source = %config.source, "Configuration resolved");
    Ok(config)
}

fn render_chunk(chunk: &Chunk) -> String {
    match chunk {
        Chunk::Text(text) => text.clone(),
        Chunk::Json(value) => value.to_string(),
        Chunk::Binary(bytes) => format!("<{} bytes>", bytes.len()),
    }
}

async fn run(command: Command, streams: &StreamMultiplexer) -> Result<()> {
    let bus = streams.bus();

    match command {
        Command::Call {
            method,
            params,
            timeout_ms,
        } => {
            let params = parse_json(&params, "params")?;
            let call = bus.request(&method, params);
            let result = match timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                    .await
                    .with_context(|| format!("{method} did not answer within {ms}ms"))??,
                None => call.await?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Notify { method, params } => {
            let params = parse_json(&params, "params")?;
            bus.notify(&method, params)?;
            info!(%method, "Notification sent");
        }

        Command::Stream {
            name,
            options,
            context_timeout_ms,
            ..
        } => {
            let options = parse_json(&options, "options")?;
            let mut stream = streams.open_stream(&name, options)?;

            let context = stream
                .context(Some(Duration::from_millis(context_timeout_ms)))
                .await?;
            if let Some(context) = context {
                info!(%context, "Stream context");
            }

            while let Some(chunk) = stream.next().await {
                println!("{}", render_chunk(&chunk?));
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = resolve_config(&args)?;
    if config.transport_config().is_thread() {
        anyhow::bail!(
            "No worker program configured; pass --worker, set TETHER_WORKER_PROGRAM, or configure [transport] in a config file"
        );
    }

    let transport =
        create_supervisor_transport(&config.service_name, &config.transport_config(), None)
            .context("Failed to start worker")?;
    let bus = Arc::new(RpcBus::new(transport));
    let streams = StreamMultiplexer::with_config(Arc::clone(&bus), config.stream.clone());

    let outcome = run(args.command, &streams).await;

    if let Err(e) = bus.close().await {
        debug!(error = %e, "Worker did not shut down cleanly");
    }
    outcome
}
