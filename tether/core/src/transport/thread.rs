//! Thread Transport
//!
//! Worker runs on a dedicated OS thread with its own single-threaded tokio
//! runtime. The two sides share nothing but a pair of channels, so binary
//! attachments are moved across instead of copied or re-encoded.
//!
//! A panic in the worker's entry future, or an `Err` returned from it, counts
//! as a crash. Returning `Ok(())` counts as a clean exit.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::config::RestartPolicy;
use super::handlers::HandlerSlots;
use super::supervisor::{SpawnedUnit, SupervisorTransport, UnitEvent, UnitHandle, UnitSpawner};
use super::traits::{ClosedHandler, Envelope, MessageHandler, Transport, TransportError};

/// How long `close()` waits for the worker thread to finish
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Entry point run on every (re)spawned worker thread
///
/// The returned future runs on the worker's own runtime and does not need to
/// be `Send`.
pub type ThreadEntry = Arc<
    dyn Fn(ThreadWorkerTransport) -> LocalBoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

/// Wrap an async function as a [`ThreadEntry`]
pub fn thread_entry<F, Fut>(entry: F) -> ThreadEntry
where
    F: Fn(ThreadWorkerTransport) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    Arc::new(move |worker| entry(worker).boxed_local())
}

struct ThreadSpawner {
    entry: ThreadEntry,
}

impl UnitSpawner for ThreadSpawner {
    fn supports_buffer(&self) -> bool {
        true
    }

    fn spawn(&self, service_name: &str) -> Result<SpawnedUnit, TransportError> {
        let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let stop = Arc::new(stop_tx);

        let entry = Arc::clone(&self.entry);
        let name = service_name.to_string();
        let worker_stop = Arc::clone(&stop);

        let join = std::thread::Builder::new()
            .name(format!("tether-{service_name}"))
            .spawn(move || {
                let worker_events = event_tx.clone();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    run_worker(&entry, name, to_worker_rx, worker_events, worker_stop)
                }));
                let event = match outcome {
                    Ok(Ok(())) => UnitEvent::Exited,
                    Ok(Err(e)) => UnitEvent::Failed(TransportError::WorkerCrashed(format!("{e:#}"))),
                    Err(panic) => UnitEvent::Failed(TransportError::WorkerCrashed(format!(
                        "worker panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                };
                let _ = event_tx.send(event);
            })
            .map_err(|e| TransportError::SpawnFailed(e.to_string()))?;

        tracing::info!(service = %service_name, "Spawned worker thread");

        Ok(SpawnedUnit {
            outbound: to_worker_tx,
            events: event_rx,
            handle: Box::new(ThreadHandle { stop, join }),
        })
    }
}

fn run_worker(
    entry: &ThreadEntry,
    service_name: String,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<UnitEvent>,
    stop: Arc<watch::Sender<bool>>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let mut stopped = stop.subscribe();
    runtime.block_on(async move {
        let worker = ThreadWorkerTransport::start(service_name, inbound, events, stop);
        tokio::select! {
            result = entry(worker) => result,
            _ = stopped.wait_for(|stop| *stop) => Ok(()),
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct ThreadHandle {
    stop: Arc<watch::Sender<bool>>,
    join: std::thread::JoinHandle<()>,
}

#[async_trait]
impl UnitHandle for ThreadHandle {
    fn detach(self: Box<Self>) {
        self.stop.send_replace(true);
    }

    async fn terminate(self: Box<Self>) {
        self.stop.send_replace(true);
        let join = self.join;
        let joined = tokio::time::timeout(
            JOIN_TIMEOUT,
            tokio::task::spawn_blocking(move || join.join()),
        )
        .await;
        if joined.is_err() {
            tracing::warn!("Worker thread did not stop in time, leaving it behind");
        }
    }
}

impl SupervisorTransport {
    /// Supervise a worker running on a dedicated thread
    ///
    /// `entry` runs once per spawn with a fresh [`ThreadWorkerTransport`].
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SpawnFailed` if the OS refuses the thread.
    pub fn spawn_thread(
        service_name: impl Into<String>,
        entry: ThreadEntry,
        policy: RestartPolicy,
    ) -> Result<Self, TransportError> {
        Self::start(Arc::new(ThreadSpawner { entry }), service_name.into(), policy)
    }
}

/// Worker side of the thread transport
pub struct ThreadWorkerTransport {
    service_name: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<UnitEvent>>>,
    handlers: Arc<HandlerSlots>,
    stop: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
}

impl ThreadWorkerTransport {
    fn start(
        service_name: String,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        events: mpsc::UnboundedSender<UnitEvent>,
        stop: Arc<watch::Sender<bool>>,
    ) -> Self {
        let handlers = Arc::new(HandlerSlots::default());
        let (closed_tx, closed_rx) = watch::channel(false);

        let pump = Arc::clone(&handlers);
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                pump.deliver(envelope);
            }
            closed_tx.send_replace(true);
            pump.fire_closed(None);
        });

        Self {
            service_name,
            outbound: Mutex::new(Some(events)),
            handlers,
            stop,
            closed: closed_rx,
        }
    }

    /// Resolves once the supervisor side has gone away
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

#[async_trait]
impl Transport for ThreadWorkerTransport {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn supports_buffer(&self) -> bool {
        true
    }

    fn send_message(&self, envelope: Envelope) -> Result<(), TransportError> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx
                .send(UnitEvent::Message(envelope))
                .map_err(|_| TransportError::SendFailed("Supervisor channel closed".to_string())),
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
        self.stop.send_replace(true);
        Ok(())
    }
}
