//! Tether Core - Resilient JSON-RPC over Restartable Workers
//!
//! This crate lets a supervisor talk to work that runs in isolation, either
//! in a child process or on a dedicated thread, through a JSON-RPC style bus
//! that outlives any single worker. When a worker crashes, in-flight calls
//! fail and the worker is respawned according to its restart policy; the bus
//! and every handler registered on it stay in place.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── supervisor ─────────────────────────────┐
//! │  ┌───────────────────┐   ┌──────────┐   ┌─────────────────────────┐ │
//! │  │ StreamMultiplexer │──►│  RpcBus  │──►│   SupervisorTransport   │ │
//! │  └───────────────────┘   └──────────┘   │  (restart policy loop)  │ │
//! │                                          └────────────┬────────────┘ │
//! └───────────────────────────────────────────────────────┼──────────────┘
//!                        frames over stdio  /  channels    │
//! ┌───────────────────────────────────────────────────────┼──────────────┐
//! │  ┌───────────────────┐   ┌──────────┐   ┌────────────┴────────────┐ │
//! │  │ StreamMultiplexer │──►│  RpcBus  │──►│ Process/ThreadWorker    │ │
//! │  └───────────────────┘   └──────────┘   │       Transport         │ │
//! │                                          └─────────────────────────┘ │
//! └──────────────────────────── worker ──────────────────────────────────┘
//! ```
//!
//! Both ends run the same [`RpcBus`]; either side may call the other.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_core::{RpcBus, transport::{RestartPolicy, ProcessCommand, SupervisorTransport}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = SupervisorTransport::spawn_process(
//!         "calc",
//!         ProcessCommand::new("/usr/local/bin/tether-worker"),
//!         RestartPolicy::Immediate,
//!     )?;
//!     let bus = RpcBus::new(Arc::new(transport));
//!
//!     let sum: i64 = bus.call("add", &serde_json::json!({"a": 2, "b": 3})).await?;
//!     assert_eq!(sum, 5);
//!
//!     bus.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`transport`]: Envelope delivery, process and thread isolation, supervision
//! - [`protocol`]: Wire message classification and error objects
//! - [`bus`]: Requests, responses, notifications and handler registries
//! - [`stream`]: Chunked streams multiplexed over bus notifications
//! - [`config`]: TOML and environment configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod config;
pub mod protocol;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use bus::{BusError, HandlerId, Notification, RpcBus, Subscription};
pub use config::{load_config_from_path, ConfigError, ConfigOverrides, TetherConfig};
pub use protocol::{
    RequestId, RpcErrorObject, RpcMessage, METHOD_NOT_FOUND, PROTOCOL_TAG, PROTOCOL_VERSION,
    SERVER_ERROR,
};
pub use stream::{
    Chunk, RpcStream, StreamConfig, StreamError, StreamMultiplexer, StreamSource, StreamState,
};
pub use transport::{
    create_supervisor_transport, Envelope, InProcessTransport, ProcessCommand,
    ProcessWorkerTransport, RestartPolicy, SupervisorTransport, ThreadWorkerTransport, Transport,
    TransportConfig, TransportError, TransportType,
};
