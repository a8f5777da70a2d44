//! Transport Layer
//!
//! Moves [`Envelope`]s between a supervisor and an isolated worker:
//! - `Process`: worker is a child process, frames over stdin/stdout
//! - `Thread`: worker is a dedicated thread with its own runtime
//! - `InProcess`: loopback pair with no isolation (tests, embedding)
//!
//! # Design Philosophy
//!
//! The transport knows nothing about RPC. It delivers messages in order to a
//! single handler and reports when the connection goes away. Supervisor
//! sides additionally respawn their worker according to a
//! [`RestartPolicy`], so the channel outlives any single worker.
//!
//! Worker sides never respawn anything; when their supervisor goes away
//! they report closure and the embedding code decides whether to exit.

pub mod config;
pub mod factory;
pub mod frame;
mod handlers;
pub mod in_process;
pub mod process;
pub mod supervisor;
pub mod thread;
pub mod traits;

// Re-exports for convenience
pub use config::{RestartPolicy, TransportConfig, TransportType};
pub use factory::create_supervisor_transport;
pub use frame::{FrameDecoder, MAX_FRAME_SIZE};
pub use in_process::InProcessTransport;
pub use process::{ProcessCommand, ProcessWorkerTransport, SERVICE_NAME_ENV};
pub use supervisor::SupervisorTransport;
pub use thread::{thread_entry, ThreadEntry, ThreadWorkerTransport};
pub use traits::{ClosedHandler, Envelope, MessageHandler, Transport, TransportError};
