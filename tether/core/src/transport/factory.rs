//! Transport Factory
//!
//! Builds the supervisor side of a transport from configuration, so callers
//! can switch isolation primitives without touching code.

use std::sync::Arc;

use super::config::{TransportConfig, TransportType};
use super::process::ProcessCommand;
use super::supervisor::SupervisorTransport;
use super::thread::ThreadEntry;
use super::traits::{Transport, TransportError};

/// Create a supervisor transport based on configuration
///
/// A thread worker cannot be named in configuration, so `thread_entry` must
/// be supplied when `config` selects the thread primitive. It is ignored for
/// process workers.
///
/// Must be called from within a tokio runtime; the worker is spawned right
/// away.
///
/// # Errors
///
/// Returns `TransportError::InvalidState` if a thread transport is requested
/// without an entry point, and `TransportError::SpawnFailed` if the worker
/// cannot be started.
///
/// # Example
///
/// ```ignore
/// use tether_core::transport::{create_supervisor_transport, TransportConfig};
///
/// let config = TransportConfig::process("/usr/local/bin/tether-worker");
/// let transport = create_supervisor_transport("calc", &config, None)?;
/// let bus = RpcBus::new(transport);
/// ```
pub fn create_supervisor_transport(
    service_name: &str,
    config: &TransportConfig,
    thread_entry: Option<ThreadEntry>,
) -> Result<Arc<dyn Transport>, TransportError> {
    match &config.transport {
        TransportType::Thread => {
            let entry = thread_entry.ok_or_else(|| {
                TransportError::InvalidState(
                    "Thread transport requires a worker entry point; pass one or use SupervisorTransport::spawn_thread directly".into(),
                )
            })?;
            let transport =
                SupervisorTransport::spawn_thread(service_name, entry, config.restart.clone())?;
            Ok(Arc::new(transport))
        }

        TransportType::Process { program, args } => {
            let command = ProcessCommand::new(program.clone()).args(args.iter().cloned());
            let transport =
                SupervisorTransport::spawn_process(service_name, command, config.restart.clone())?;
            Ok(Arc::new(transport))
        }
    }
}
