//! Supervisor Lifecycle
//!
//! The supervisor side of an isolated transport owns the worker unit. It is
//! shared by the process and thread implementations, which only differ in
//! how a unit is spawned and torn down (see [`UnitSpawner`]).
//!
//! # Lifecycle
//!
//! ```text
//!  spawn ──► running ──message──► forwarded to the message handler
//!               │
//!               ├──clean exit──► closed handler(None), transport closed
//!               │
//!               └──crash/error──► detach unit
//!                                 RestartPolicy::delay_for(attempt)
//!                                   ├─ None   ──► closed handler(err), transport closed
//!                                   └─ Some(d)──► respawn, closed handler(err), re-wire
//! ```
//!
//! The closed handler runs exactly once per lost unit, before the
//! replacement is wired in. With a non-zero delay it runs before the backoff
//! so pending calls fail without waiting it out. If the respawn itself fails
//! after a zero delay, the single report carries both errors; after a
//! backoff the failure was already reported and the transport just closes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::config::RestartPolicy;
use super::handlers::HandlerSlots;
use super::traits::{
    ensure_encodable, ClosedHandler, Envelope, MessageHandler, Transport, TransportError,
};

/// Event reported by a running worker unit
#[derive(Debug)]
pub(crate) enum UnitEvent {
    /// Inbound message from the worker
    Message(Envelope),
    /// The unit crashed or reported an error
    Failed(TransportError),
    /// The unit exited cleanly
    Exited,
}

/// Control over a spawned unit
#[async_trait]
pub(crate) trait UnitHandle: Send {
    /// Let go of a unit that already failed
    fn detach(self: Box<Self>);

    /// Stop a live unit on request
    async fn terminate(self: Box<Self>);
}

/// A freshly spawned unit, wired to channels
pub(crate) struct SpawnedUnit {
    pub(crate) outbound: mpsc::UnboundedSender<Envelope>,
    pub(crate) events: mpsc::UnboundedReceiver<UnitEvent>,
    pub(crate) handle: Box<dyn UnitHandle>,
}

/// Isolation primitive that knows how to start a worker unit
pub(crate) trait UnitSpawner: Send + Sync {
    fn supports_buffer(&self) -> bool;

    fn spawn(&self, service_name: &str) -> Result<SpawnedUnit, TransportError>;
}

struct Shared {
    service_name: String,
    supports_buffer: bool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    handlers: HandlerSlots,
    restarts: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn install(&self, outbound: mpsc::UnboundedSender<Envelope>) {
        *self.outbound.lock() = Some(outbound);
    }

    fn unplug(&self) {
        self.outbound.lock().take();
    }
}

/// Supervisor side of an isolated transport
///
/// Spawns the worker on construction and respawns it according to its
/// [`RestartPolicy`] whenever it terminates abnormally. Built with
/// [`SupervisorTransport::spawn_process`] or
/// [`SupervisorTransport::spawn_thread`].
pub struct SupervisorTransport {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SupervisorTransport {
    /// Spawn the first unit and start supervising it
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn start(
        spawner: Arc<dyn UnitSpawner>,
        service_name: String,
        policy: RestartPolicy,
    ) -> Result<Self, TransportError> {
        let unit = spawner.spawn(&service_name)?;

        let shared = Arc::new(Shared {
            service_name,
            supports_buffer: spawner.supports_buffer(),
            outbound: Mutex::new(Some(unit.outbound.clone())),
            handlers: HandlerSlots::default(),
            restarts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            Arc::clone(&shared),
            spawner,
            policy,
            unit,
            shutdown_rx,
        ));

        tracing::info!(service = %shared.service_name, "Worker supervisor started");

        Ok(Self {
            shared,
            shutdown,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// Number of times the worker has been respawned
    #[must_use]
    pub fn restart_count(&self) -> u64 {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    /// Whether the transport has stopped supervising its worker
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SupervisorTransport {
    fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    fn supports_buffer(&self) -> bool {
        self.shared.supports_buffer
    }

    fn send_message(&self, envelope: Envelope) -> Result<(), TransportError> {
        ensure_encodable(&envelope, self.shared.supports_buffer)?;

        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| TransportError::SendFailed("Worker channel closed".to_string())),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn register_message_handler(&self, handler: MessageHandler) {
        self.shared.handlers.set_message(handler);
    }

    fn register_transport_closed_handler(&self, handler: ClosedHandler) {
        self.shared.handlers.set_closed(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.send_replace(true);

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(service = %self.shared.service_name, error = %e, "Supervisor task failed");
            }
        }
        Ok(())
    }
}

enum Step {
    Shutdown,
    Event(Option<UnitEvent>),
}

async fn supervise(
    shared: Arc<Shared>,
    spawner: Arc<dyn UnitSpawner>,
    policy: RestartPolicy,
    mut unit: SpawnedUnit,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = shared.service_name.clone();
    let mut attempt: u32 = 0;

    loop {
        let step = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => Step::Shutdown,
            event = unit.events.recv() => Step::Event(event),
        };

        let error = match step {
            Step::Shutdown => {
                tracing::info!(service = %service, "Shutting down worker");
                shared.unplug();
                unit.handle.terminate().await;
                shared.closed.store(true, Ordering::SeqCst);
                shared.handlers.fire_closed(None);
                return;
            }
            Step::Event(Some(UnitEvent::Message(envelope))) => {
                attempt = 0;
                shared.handlers.deliver(envelope);
                continue;
            }
            Step::Event(Some(UnitEvent::Exited)) => {
                tracing::info!(service = %service, "Worker exited cleanly");
                shared.unplug();
                unit.handle.detach();
                shared.closed.store(true, Ordering::SeqCst);
                shared.handlers.fire_closed(None);
                return;
            }
            Step::Event(Some(UnitEvent::Failed(error))) => error,
            Step::Event(None) => {
                TransportError::WorkerCrashed("worker event channel closed".to_string())
            }
        };

        tracing::warn!(service = %service, error = %error, "Worker terminated abnormally");
        shared.unplug();
        unit.handle.detach();
        attempt = attempt.saturating_add(1);

        let Some(delay) = policy.delay_for(attempt) else {
            tracing::warn!(service = %service, attempt, "Restart policy exhausted, closing transport");
            shared.closed.store(true, Ordering::SeqCst);
            shared.handlers.fire_closed(Some(error));
            return;
        };

        if !delay.is_zero() {
            shared.handlers.fire_closed(Some(error.clone()));
            tracing::info!(service = %service, ?delay, attempt, "Waiting before respawn");
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    shared.closed.store(true, Ordering::SeqCst);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        let replacement = match spawner.spawn(&service) {
            Ok(replacement) => replacement,
            Err(spawn_error) => {
                tracing::error!(service = %service, error = %spawn_error, "Failed to respawn worker");
                shared.closed.store(true, Ordering::SeqCst);
                if delay.is_zero() {
                    shared.handlers.fire_closed(Some(TransportError::SpawnFailed(format!(
                        "respawn after {error} failed: {spawn_error}"
                    ))));
                }
                return;
            }
        };

        if delay.is_zero() {
            shared.handlers.fire_closed(Some(error));
        }
        shared.install(replacement.outbound.clone());
        unit = replacement;
        shared.restarts.fetch_add(1, Ordering::SeqCst);
        tracing::info!(service = %service, attempt, "Worker respawned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Spawner whose units are driven by the test through a control channel
    struct ScriptedSpawner {
        units: Mutex<Vec<mpsc::UnboundedSender<UnitEvent>>>,
        outbound: Mutex<Vec<mpsc::UnboundedReceiver<Envelope>>>,
        fail_after: Option<usize>,
    }

    impl ScriptedSpawner {
        fn new(fail_after: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                units: Mutex::new(Vec::new()),
                outbound: Mutex::new(Vec::new()),
                fail_after,
            })
        }

        fn unit(&self, index: usize) -> mpsc::UnboundedSender<UnitEvent> {
            self.units.lock()[index].clone()
        }

        fn spawned(&self) -> usize {
            self.units.lock().len()
        }
    }

    struct NoopHandle;

    #[async_trait]
    impl UnitHandle for NoopHandle {
        fn detach(self: Box<Self>) {}
        async fn terminate(self: Box<Self>) {}
    }

    impl UnitSpawner for ScriptedSpawner {
        fn supports_buffer(&self) -> bool {
            true
        }

        fn spawn(&self, _service_name: &str) -> Result<SpawnedUnit, TransportError> {
            if self.fail_after.is_some_and(|limit| self.spawned() >= limit) {
                return Err(TransportError::SpawnFailed("scripted failure".into()));
            }
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            self.units.lock().push(event_tx);
            self.outbound.lock().push(out_rx);
            Ok(SpawnedUnit {
                outbound: out_tx,
                events: event_rx,
                handle: Box::new(NoopHandle),
            })
        }
    }

    fn closed_recorder(
        transport: &SupervisorTransport,
    ) -> mpsc::UnboundedReceiver<Option<TransportError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.register_transport_closed_handler(Arc::new(move |err| {
            let _ = tx.send(err);
        }));
        rx
    }

    async fn next_closed(
        rx: &mut mpsc::UnboundedReceiver<Option<TransportError>>,
    ) -> Option<TransportError> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_messages_are_forwarded() {
        let spawner = ScriptedSpawner::new(None);
        let transport =
            SupervisorTransport::start(spawner.clone(), "svc".into(), RestartPolicy::Immediate)
                .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.register_message_handler(Arc::new(move |envelope| {
            let _ = tx.send(envelope);
        }));

        spawner
            .unit(0)
            .send(UnitEvent::Message(Envelope::json(serde_json::json!("hi"))))
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.body, serde_json::json!("hi"));
    }

    #[tokio::test]
    async fn test_crash_respawns_and_reports_error() {
        let spawner = ScriptedSpawner::new(None);
        let transport =
            SupervisorTransport::start(spawner.clone(), "svc".into(), RestartPolicy::Immediate)
                .unwrap();
        let mut closed = closed_recorder(&transport);

        spawner
            .unit(0)
            .send(UnitEvent::Failed(TransportError::WorkerCrashed("boom".into())))
            .unwrap();

        assert_eq!(
            next_closed(&mut closed).await,
            Some(TransportError::WorkerCrashed("boom".into()))
        );
        assert_eq!(spawner.spawned(), 2);
        assert_eq!(transport.restart_count(), 1);
        assert!(!transport.is_closed());

        // Traffic goes to the replacement
        transport
            .send_message(Envelope::json(serde_json::json!(1)))
            .unwrap();
        let mut outbound = spawner.outbound.lock().pop().unwrap();
        assert_eq!(outbound.try_recv().unwrap().body, serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_clean_exit_closes_without_error() {
        let spawner = ScriptedSpawner::new(None);
        let transport =
            SupervisorTransport::start(spawner.clone(), "svc".into(), RestartPolicy::Immediate)
                .unwrap();
        let mut closed = closed_recorder(&transport);

        spawner.unit(0).send(UnitEvent::Exited).unwrap();

        assert_eq!(next_closed(&mut closed).await, None);
        assert_eq!(spawner.spawned(), 1);
        assert!(transport.is_closed());
        assert_eq!(
            transport.send_message(Envelope::json(serde_json::json!(1))),
            Err(TransportError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_disabled_policy_closes_on_crash() {
        let spawner = ScriptedSpawner::new(None);
        let transport =
            SupervisorTransport::start(spawner.clone(), "svc".into(), RestartPolicy::Disabled)
                .unwrap();
        let mut closed = closed_recorder(&transport);

        spawner
            .unit(0)
            .send(UnitEvent::Failed(TransportError::WorkerCrashed("x".into())))
            .unwrap();

        assert!(next_closed(&mut closed).await.is_some());
        assert_eq!(spawner.spawned(), 1);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_backoff_reports_before_respawning() {
        let spawner = ScriptedSpawner::new(None);
        let policy = RestartPolicy::Backoff {
            initial_delay_ms: 50,
            max_delay_ms: 50,
            max_restarts: Some(1),
        };
        let transport = SupervisorTransport::start(spawner.clone(), "svc".into(), policy).unwrap();
        let mut closed = closed_recorder(&transport);

        spawner
            .unit(0)
            .send(UnitEvent::Failed(TransportError::WorkerCrashed("a".into())))
            .unwrap();

        assert!(next_closed(&mut closed).await.is_some());
        assert_eq!(spawner.spawned(), 1, "respawn waits for the backoff delay");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(spawner.spawned(), 2);

        // Second consecutive crash exceeds max_restarts
        spawner
            .unit(1)
            .send(UnitEvent::Failed(TransportError::WorkerCrashed("b".into())))
            .unwrap();
        assert!(next_closed(&mut closed).await.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.is_closed());
        assert_eq!(spawner.spawned(), 2);
    }

    #[tokio::test]
    async fn test_respawn_failure_closes_transport() {
        let spawner = ScriptedSpawner::new(Some(1));
        let transport =
            SupervisorTransport::start(spawner.clone(), "svc".into(), RestartPolicy::Immediate)
                .unwrap();
        let mut closed = closed_recorder(&transport);

        spawner
            .unit(0)
            .send(UnitEvent::Failed(TransportError::WorkerCrashed("x".into())))
            .unwrap();

        match next_closed(&mut closed).await {
            Some(TransportError::SpawnFailed(message)) => {
                assert!(message.contains("x"), "{message}");
                assert!(message.contains("scripted failure"), "{message}");
            }
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(closed.try_recv().is_err(), "closed handler fires once");
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_failed_respawn_after_backoff_reports_once() {
        let spawner = ScriptedSpawner::new(Some(1));
        let policy = RestartPolicy::Backoff {
            initial_delay_ms: 10,
            max_delay_ms: 10,
            max_restarts: None,
        };
        let transport = SupervisorTransport::start(spawner.clone(), "svc".into(), policy).unwrap();
        let mut closed = closed_recorder(&transport);

        spawner
            .unit(0)
            .send(UnitEvent::Failed(TransportError::WorkerCrashed("y".into())))
            .unwrap();

        assert_eq!(
            next_closed(&mut closed).await,
            Some(TransportError::WorkerCrashed("y".into()))
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.is_closed());
        assert!(closed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_handler_runs_before_replacement_is_wired() {
        let spawner = ScriptedSpawner::new(None);
        let transport = Arc::new(
            SupervisorTransport::start(spawner.clone(), "svc".into(), RestartPolicy::Immediate)
                .unwrap(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&transport);
        transport.register_transport_closed_handler(Arc::new(move |_| {
            let sent = weak
                .upgrade()
                .map(|t| t.send_message(Envelope::json(serde_json::json!("late"))));
            let _ = tx.send(sent);
        }));

        spawner
            .unit(0)
            .send(UnitEvent::Failed(TransportError::WorkerCrashed("z".into())))
            .unwrap();

        let sent = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, Some(Err(TransportError::ConnectionClosed)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.restart_count(), 1);
        transport
            .send_message(Envelope::json(serde_json::json!(2)))
            .unwrap();
        let mut outbound = spawner.outbound.lock().pop().unwrap();
        assert_eq!(outbound.try_recv().unwrap().body, serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let spawner = ScriptedSpawner::new(None);
        let transport =
            SupervisorTransport::start(spawner.clone(), "svc".into(), RestartPolicy::Immediate)
                .unwrap();
        let mut closed = closed_recorder(&transport);

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(next_closed(&mut closed).await, None);
        assert!(transport.is_closed());
        assert!(closed.try_recv().is_err());
    }
}
