//! Process Transport
//!
//! Worker runs as a child OS process. Envelopes travel as checksummed frames
//! (see [`super::frame`]) over the child's stdin and stdout; the child's
//! stderr is inherited so its logs end up next to the supervisor's.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────┐          ┌───────────────────────────┐
//! │ SupervisorTransport       │  stdin   │ ProcessWorkerTransport    │
//! │   writer task ────────────┼─────────►│   reader task             │
//! │   reader task ◄───────────┼──────────┤   writer task             │
//! │   wait task (exit status) │  stdout  │                           │
//! └───────────────────────────┘          └───────────────────────────┘
//! ```
//!
//! Pipes cannot carry binary attachments, so `supports_buffer()` is false on
//! both sides.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::config::RestartPolicy;
use super::frame::{read_frames, write_frames};
use super::handlers::HandlerSlots;
use super::supervisor::{SpawnedUnit, SupervisorTransport, UnitEvent, UnitHandle, UnitSpawner};
use super::traits::{
    ensure_encodable, ClosedHandler, Envelope, MessageHandler, Transport, TransportError,
};

/// Environment variable carrying the service name into the worker process
pub const SERVICE_NAME_ENV: &str = "TETHER_SERVICE_NAME";

/// How long a worker gets to exit on its own after stdin closes
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for stdout to drain once the child has exited
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Command line used to start a worker process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessCommand {
    /// Command running `program` with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the worker
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Executable path
    #[must_use]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

struct ProcessSpawner {
    command: ProcessCommand,
}

impl UnitSpawner for ProcessSpawner {
    fn supports_buffer(&self) -> bool {
        false
    }

    fn spawn(&self, service_name: &str) -> Result<SpawnedUnit, TransportError> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .envs(self.command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(SERVICE_NAME_ENV, service_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            TransportError::SpawnFailed(format!("{}: {e}", self.command.program.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("child stdout not piped".into()))?;
        let pid = child.id().unwrap_or_default();

        tracing::info!(service = %service_name, pid, program = %self.command.program.display(), "Spawned worker process");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Err(e) = write_frames(stdin, outbound_rx).await {
                tracing::debug!(pid, error = %e, "Worker stdin closed");
            }
        });

        let reader_events = event_tx.clone();
        let reader = tokio::spawn(async move {
            read_frames(stdout, |envelope| {
                let _ = reader_events.send(UnitEvent::Message(envelope));
            })
            .await
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        tokio::spawn(async move {
            let event = watch_child(child, pid, reader, kill_rx).await;
            if let Some(event) = event {
                let _ = event_tx.send(event);
            }
            let _ = exited_tx.send(());
        });

        Ok(SpawnedUnit {
            outbound: outbound_tx,
            events: event_rx,
            handle: Box::new(ProcessHandle {
                pid,
                kill: kill_tx,
                exited: exited_rx,
            }),
        })
    }
}

/// Wait for the child to go away and classify how it went
///
/// Returns `None` when the supervisor asked for the kill.
async fn watch_child(
    mut child: Child,
    pid: u32,
    mut reader: JoinHandle<Result<(), TransportError>>,
    mut kill: oneshot::Receiver<()>,
) -> Option<UnitEvent> {
    tokio::select! {
        status = child.wait() => {
            let read = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, &mut reader).await;
            let read = match read {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(TransportError::Io(join.to_string())),
                Err(_) => {
                    reader.abort();
                    Ok(())
                }
            };
            Some(classify_exit(pid, status, read))
        }
        read = &mut reader => {
            match read {
                Ok(Ok(())) => {
                    // stdout closed; the exit status decides
                    let status = tokio::select! {
                        status = child.wait() => status,
                        _ = &mut kill => {
                            kill_child(&mut child, pid).await;
                            return None;
                        }
                    };
                    Some(classify_exit(pid, status, Ok(())))
                }
                Ok(Err(e)) => {
                    tracing::warn!(pid, error = %e, "Unreadable worker output, killing worker");
                    kill_child(&mut child, pid).await;
                    Some(UnitEvent::Failed(e))
                }
                Err(join) => {
                    kill_child(&mut child, pid).await;
                    Some(UnitEvent::Failed(TransportError::Io(join.to_string())))
                }
            }
        }
        _ = &mut kill => {
            reader.abort();
            kill_child(&mut child, pid).await;
            None
        }
    }
}

fn classify_exit(
    pid: u32,
    status: std::io::Result<ExitStatus>,
    read: Result<(), TransportError>,
) -> UnitEvent {
    match (status, read) {
        (Err(e), _) => UnitEvent::Failed(TransportError::Io(e.to_string())),
        (Ok(_), Err(e)) => UnitEvent::Failed(e),
        (Ok(status), Ok(())) if status.success() => {
            tracing::debug!(pid, "Worker process exited cleanly");
            UnitEvent::Exited
        }
        (Ok(status), Ok(())) => UnitEvent::Failed(TransportError::WorkerCrashed(format!(
            "process {pid} exited with {status}"
        ))),
    }
}

async fn kill_child(child: &mut Child, pid: u32) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(pid, error = %e, "Failed to kill worker process");
    }
    if let Err(e) = child.wait().await {
        tracing::debug!(pid, error = %e, "Failed to reap worker process");
    }
}

struct ProcessHandle {
    pid: u32,
    kill: oneshot::Sender<()>,
    exited: oneshot::Receiver<()>,
}

#[async_trait]
impl UnitHandle for ProcessHandle {
    fn detach(self: Box<Self>) {
        tracing::debug!(pid = self.pid, "Detaching worker process");
        let _ = self.kill.send(());
    }

    async fn terminate(self: Box<Self>) {
        let Self { pid, kill, mut exited } = *self;

        // stdin is already closed; give the worker a chance to exit on its own
        if tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, &mut exited)
            .await
            .is_ok()
        {
            return;
        }

        tracing::debug!(pid, "Worker ignored stdin EOF, killing it");
        let _ = kill.send(());
        let _ = exited.await;
    }
}

impl SupervisorTransport {
    /// Supervise a worker running as a child process
    ///
    /// The child is spawned right away with [`SERVICE_NAME_ENV`] set to
    /// `service_name`. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SpawnFailed` if the first spawn fails.
    pub fn spawn_process(
        service_name: impl Into<String>,
        command: ProcessCommand,
        policy: RestartPolicy,
    ) -> Result<Self, TransportError> {
        Self::start(
            Arc::new(ProcessSpawner { command }),
            service_name.into(),
            policy,
        )
    }
}

/// Worker side of the process transport
///
/// Reads frames from the process's stdin and writes frames to its stdout.
/// Nothing else may write to stdout in a worker process.
pub struct ProcessWorkerTransport {
    service_name: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    handlers: Arc<HandlerSlots>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    closed: watch::Receiver<bool>,
    exit_on_close: bool,
}

impl ProcessWorkerTransport {
    /// Worker transport over stdio, named from [`SERVICE_NAME_ENV`]
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidState` when the process was not
    /// started by a supervisor.
    pub fn from_env() -> Result<Self, TransportError> {
        let service_name = std::env::var(SERVICE_NAME_ENV).map_err(|_| {
            TransportError::InvalidState(format!(
                "{SERVICE_NAME_ENV} not set; this binary must be started by a supervisor"
            ))
        })?;
        Ok(Self::new(service_name))
    }

    /// Worker transport over the process's own stdin and stdout
    ///
    /// `close()` terminates the process.
    pub fn new(service_name: impl Into<String>) -> Self {
        let mut transport = Self::with_io(service_name, tokio::io::stdin(), tokio::io::stdout());
        transport.exit_on_close = true;
        transport
    }

    /// Worker transport over arbitrary pipes
    ///
    /// `close()` only stops the I/O tasks.
    pub fn with_io<R, W>(service_name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let service_name = service_name.into();
        let handlers = Arc::new(HandlerSlots::default());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let writer = tokio::spawn(async move {
            if let Err(e) = write_frames(writer, outbound_rx).await {
                tracing::debug!(error = %e, "Worker stdout closed");
            }
        });

        let inbound = Arc::clone(&handlers);
        let name = service_name.clone();
        tokio::spawn(async move {
            let result = read_frames(reader, |envelope| inbound.deliver(envelope)).await;
            closed_tx.send_replace(true);
            match result {
                Ok(()) => {
                    tracing::info!(service = %name, "Supervisor closed the pipe");
                    inbound.fire_closed(None);
                }
                Err(e) => {
                    tracing::error!(service = %name, error = %e, "Failed to read from supervisor");
                    inbound.fire_closed(Some(e));
                }
            }
        });

        Self {
            service_name,
            outbound: Mutex::new(Some(outbound_tx)),
            handlers,
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: closed_rx,
            exit_on_close: false,
        }
    }

    /// Resolves once the supervisor side has gone away
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

#[async_trait]
impl Transport for ProcessWorkerTransport {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn supports_buffer(&self) -> bool {
        false
    }

    fn send_message(&self, envelope: Envelope) -> Result<(), TransportError> {
        ensure_encodable(&envelope, false)?;
        match self.outbound.lock().as_ref() {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| TransportError::SendFailed("stdout writer stopped".to_string())),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn register_message_handler(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn register_transport_closed_handler(&self, handler: ClosedHandler) {
        self.handlers.set_closed(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.outbound.lock().take();

        if let Some(writer) = self.writer.lock().await.take() {
            let _ = writer.await;
        }

        if self.exit_on_close {
            tracing::info!(service = %self.service_name, "Worker closing, exiting process");
            std::process::exit(0);
        }
        Ok(())
    }
}
