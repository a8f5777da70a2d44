//! RPC Bus
//!
//! Request/response and notification messaging on top of any [`Transport`].
//!
//! # Dispatch
//!
//! ```text
//! transport ──► classify ──┬── Response ─────┐
//!                          ├── Request ──────┤
//!                          └── Notification ─┴─► dispatch task (one at a time, in order)
//! closed(err) ──► snapshot pending ids ──────────► dispatch task: fail them
//! ```
//!
//! Everything inbound is applied in arrival order, so a response is only
//! delivered once the handlers of earlier requests and notifications have
//! finished. While a handler runs, responses to requests that handler issued
//! on this bus are let through ahead of the queue; a handler may therefore
//! call the peer without deadlocking the dispatcher.
//!
//! The bus survives transport restarts: a closure fails the calls that were
//! in flight and later calls go to the replacement worker.

mod error;
mod handlers;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use error::BusError;
pub use handlers::{HandlerId, Notification, NotificationHandler, RequestHandler, Subscription};

use handlers::HandlerRegistry;

use crate::protocol::{ProtocolError, RequestId, RpcErrorObject, RpcMessage};
use crate::transport::{Envelope, Transport, TransportError};

struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Result<Value, BusError>>,
    /// Issued by a handler running on this bus's dispatcher
    nested: bool,
}

enum Inbound {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification(Notification),
    Response {
        id: RequestId,
        outcome: Result<Value, RpcErrorObject>,
    },
    Closed {
        error: TransportError,
        ids: Vec<u64>,
    },
}

tokio::task_local! {
    /// Identity of the bus whose dispatcher is running the current handler
    static DISPATCHING: usize;
}

struct BusInner {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    handlers: Arc<HandlerRegistry>,
    closed: AtomicBool,
}

impl BusInner {
    fn service(&self) -> &str {
        self.transport.service_name()
    }

    fn key(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    fn route(&self, envelope: Envelope, queue: &mpsc::UnboundedSender<Inbound>) {
        let message = match RpcMessage::from_value(&envelope.body) {
            Ok(message) => message,
            Err(ProtocolError::Untagged) => {
                tracing::trace!(service = %self.service(), "Ignoring untagged message");
                return;
            }
            Err(e) => {
                tracing::debug!(service = %self.service(), error = %e, "Ignoring malformed message");
                return;
            }
        };

        let inbound = match message {
            RpcMessage::Success { id, result } => Inbound::Response {
                id,
                outcome: Ok(result),
            },
            RpcMessage::Error { id, error } => Inbound::Response {
                id,
                outcome: Err(error),
            },
            RpcMessage::Request { id, method, params } => Inbound::Request { id, method, params },
            RpcMessage::Notification { method, params } => Inbound::Notification(Notification {
                method,
                params,
                binary: envelope.binary,
            }),
        };

        if queue.send(inbound).is_err() {
            tracing::debug!(service = %self.service(), "Dispatcher stopped, dropping message");
        }
    }

    fn on_closed(&self, error: TransportError, queue: &mpsc::UnboundedSender<Inbound>) {
        let ids: Vec<u64> = self.pending.lock().keys().copied().collect();
        if let Err(mpsc::error::SendError(Inbound::Closed { error, ids })) =
            queue.send(Inbound::Closed { error, ids })
        {
            self.fail_ids(&error, &ids);
        }
    }

    /// Apply a response or closure
    ///
    /// With `nested_only`, only calls issued by the running handler are
    /// settled; the rest is handed back to be applied after it finishes.
    fn settle(&self, inbound: Inbound, nested_only: bool) -> Option<Inbound> {
        match inbound {
            Inbound::Response { id, outcome } => {
                if nested_only && !self.is_nested(&id) {
                    return Some(Inbound::Response { id, outcome });
                }
                self.complete(&id, outcome);
                None
            }
            Inbound::Closed { error, ids } if nested_only => {
                let (now, later): (Vec<u64>, Vec<u64>) = {
                    let pending = self.pending.lock();
                    ids.into_iter()
                        .partition(|id| pending.get(id).is_some_and(|p| p.nested))
                };
                self.fail_ids(&error, &now);
                (!later.is_empty()).then_some(Inbound::Closed { error, ids: later })
            }
            Inbound::Closed { error, ids } => {
                self.fail_ids(&error, &ids);
                None
            }
            other => Some(other),
        }
    }

    fn is_nested(&self, id: &RequestId) -> bool {
        id.as_u64()
            .and_then(|key| self.pending.lock().get(&key).map(|p| p.nested))
            .unwrap_or(false)
    }

    fn complete(&self, id: &RequestId, outcome: Result<Value, RpcErrorObject>) {
        let Some(key) = id.as_u64() else {
            tracing::debug!(service = %self.service(), %id, "Response for an id we never issued");
            return;
        };

        let Some(pending) = self.pending.lock().remove(&key) else {
            tracing::debug!(service = %self.service(), %id, "Response for unknown request");
            return;
        };

        let outcome = outcome.map_err(|error| BusError::Rpc {
            service: self.service().to_string(),
            method: pending.method,
            error,
        });
        let _ = pending.reply.send(outcome);
    }

    fn fail_pending(&self, error: &TransportError) {
        let pending = std::mem::take(&mut *self.pending.lock());
        self.reject(error, pending.into_values().collect());
    }

    /// Fail the calls that were in flight when a connection closed
    ///
    /// Calls made afterwards went to a replacement and are left alone.
    fn fail_ids(&self, error: &TransportError, ids: &[u64]) {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        self.reject(error, failed);
    }

    fn reject(&self, error: &TransportError, pending: Vec<PendingRequest>) {
        if pending.is_empty() {
            return;
        }

        tracing::warn!(
            service = %self.service(),
            count = pending.len(),
            error = %error,
            "Failing in-flight requests"
        );
        for request in pending {
            let _ = request.reply.send(Err(BusError::Transport {
                service: self.service().to_string(),
                method: request.method,
                source: error.clone(),
            }));
        }
    }

    fn send(&self, message: &RpcMessage, binary: Option<Bytes>) -> Result<(), TransportError> {
        let body = message.to_value();
        let envelope = match binary {
            Some(binary) => Envelope::with_binary(body, binary),
            None => Envelope::json(body),
        };
        self.transport.send_message(envelope)
    }

    async fn handle_request(&self, id: RequestId, method: String, params: Value) {
        let response = match self.handlers.request(&method) {
            None => {
                tracing::debug!(service = %self.service(), %method, "No handler for request");
                RpcMessage::Error {
                    id,
                    error: RpcErrorObject::method_not_found(&method),
                }
            }
            Some(handler) => match AssertUnwindSafe(handler(params)).catch_unwind().await {
                Ok(Ok(result)) => RpcMessage::Success { id, result },
                Ok(Err(err)) => {
                    tracing::debug!(service = %self.service(), %method, error = %err, "Request handler failed");
                    let error = match err.downcast::<RpcErrorObject>() {
                        Ok(error) => error,
                        Err(err) => RpcErrorObject::server_error(format!("{err:#}")),
                    };
                    RpcMessage::Error { id, error }
                }
                Err(_) => {
                    tracing::error!(service = %self.service(), %method, "Request handler panicked");
                    RpcMessage::Error {
                        id,
                        error: RpcErrorObject::server_error(format!(
                            "Handler for {method} panicked"
                        )),
                    }
                }
            },
        };

        if let Err(e) = self.send(&response, None) {
            tracing::warn!(service = %self.service(), error = %e, "Failed to send response");
        }
    }

    async fn handle_notification(&self, notification: Notification) {
        let handlers = self.handlers.notification_handlers(&notification.method);
        if handlers.is_empty() {
            tracing::trace!(service = %self.service(), method = %notification.method, "No handler for notification");
            return;
        }

        for handler in handlers {
            match AssertUnwindSafe(handler(notification.clone()))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(service = %self.service(), method = %notification.method, error = %e, "Notification handler failed");
                }
                Err(_) => {
                    tracing::error!(service = %self.service(), method = %notification.method, "Notification handler panicked");
                }
            }
        }
    }
}

/// Removes a pending entry if its request future is dropped early
struct PendingGuard<'a> {
    inner: &'a BusInner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

/// Request/notification bus over a transport
///
/// Owns the transport's message and closed handlers. Must be created from
/// within a tokio runtime.
pub struct RpcBus {
    inner: Arc<BusInner>,
    dispatcher: JoinHandle<()>,
}

impl RpcBus {
    /// Attach a bus to `transport`
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(BusInner {
            transport: Arc::clone(&transport),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            handlers: Arc::new(HandlerRegistry::default()),
            closed: AtomicBool::new(false),
        });

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let weak = Arc::downgrade(&inner);
        let closed_queue = queue_tx.clone();
        transport.register_message_handler(Arc::new(move |envelope| {
            if let Some(inner) = weak.upgrade() {
                inner.route(envelope, &queue_tx);
            }
        }));

        let weak = Arc::downgrade(&inner);
        transport.register_transport_closed_handler(Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.on_closed(error.unwrap_or(TransportError::ConnectionClosed), &closed_queue);
            }
        }));

        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&inner), queue_rx));

        Self { inner, dispatcher }
    }

    /// Name of the service on the other end
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.inner.service()
    }

    /// Whether the underlying transport carries binary attachments
    #[must_use]
    pub fn supports_buffer(&self) -> bool {
        self.inner.transport.supports_buffer()
    }

    /// The underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Number of requests awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Send a request and wait for its response
    ///
    /// # Errors
    ///
    /// - `BusError::Rpc` if the remote handler answered with an error
    /// - `BusError::Transport` if sending failed or the transport closed
    ///   before a response arrived
    /// - `BusError::Closed` if the bus was closed
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let nested = DISPATCHING
            .try_with(|bus| *bus == self.inner.key())
            .unwrap_or(false);
        let (reply, response) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                reply,
                nested,
            },
        );
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };

        let message = RpcMessage::Request {
            id: RequestId::from(id),
            method: method.to_string(),
            params,
        };
        tracing::trace!(service = %self.service_name(), %method, id, "Sending request");

        if let Err(source) = self.inner.send(&message, None) {
            return Err(BusError::Transport {
                service: self.service_name().to_string(),
                method: method.to_string(),
                source,
            });
        }

        response.await.unwrap_or(Err(BusError::Closed))
    }

    /// Typed wrapper around [`request`](Self::request)
    ///
    /// # Errors
    ///
    /// Same as `request`, plus `BusError::Serialization` when `params` or the
    /// result do not match their types.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, BusError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|e| BusError::Serialization(e.to_string()))?;
        let result = self.request(method, params).await?;
        serde_json::from_value(result).map_err(|e| BusError::Serialization(e.to_string()))
    }

    /// Send a notification (fire-and-forget)
    ///
    /// # Errors
    ///
    /// Returns `BusError::Transport` if the transport rejects the message.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), BusError> {
        self.notify_with(method, params, None)
    }

    /// Send a notification with a binary attachment
    ///
    /// # Errors
    ///
    /// Returns `BusError::Transport` with `TransportError::BinaryUnsupported`
    /// when the transport cannot carry attachments.
    pub fn notify_binary(&self, method: &str, params: Value, binary: Bytes) -> Result<(), BusError> {
        self.notify_with(method, params, Some(binary))
    }

    fn notify_with(
        &self,
        method: &str,
        params: Value,
        binary: Option<Bytes>,
    ) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let message = RpcMessage::Notification {
            method: method.to_string(),
            params,
        };
        self.inner
            .send(&message, binary)
            .map_err(|source| BusError::Transport {
                service: self.service_name().to_string(),
                method: method.to_string(),
                source,
            })
    }

    /// Install the handler for requests to `method`, replacing any previous one
    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.inner
            .handlers
            .set_request(method, Arc::new(move |params| handler(params).boxed()));
    }

    /// Remove the handler for `method`
    ///
    /// Returns `false` if there was none.
    pub fn remove_request_handler(&self, method: &str) -> bool {
        self.inner.handlers.remove_request(method)
    }

    /// Append a handler for notifications to `method`
    ///
    /// Handlers run in registration order.
    pub fn add_notification_handler<F, Fut>(&self, method: &str, handler: F) -> Subscription
    where
        F: Fn(Notification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.handlers.add_notification(
            method,
            Arc::new(move |notification| handler(notification).boxed()),
        );
        Subscription::new(&self.inner.handlers, method, id)
    }

    /// Remove one notification handler
    ///
    /// Returns `false` if it was not registered.
    pub fn remove_notification_handler(&self, method: &str, id: HandlerId) -> bool {
        self.inner.handlers.remove_notification(method, id)
    }

    /// Remove every notification handler for `method`
    ///
    /// Returns how many were removed.
    pub fn remove_all_notification_handlers(&self, method: &str) -> usize {
        self.inner.handlers.remove_all_notifications(method)
    }

    /// Number of notification handlers registered for `method`
    #[must_use]
    pub fn notification_handler_count(&self, method: &str) -> usize {
        self.inner.handlers.notification_count(method)
    }

    /// Close the bus and its transport
    ///
    /// Pending requests fail with `TransportError::ConnectionClosed`.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates the transport's close error.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!(service = %self.service_name(), "Closing bus");
        let result = self.inner.transport.close().await;
        self.inner.fail_pending(&TransportError::ConnectionClosed);
        self.dispatcher.abort();
        result
    }
}

impl Drop for RpcBus {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl std::fmt::Debug for RpcBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcBus")
            .field("service", &self.service_name())
            .field("pending", &self.pending_count())
            .field("handlers", &self.inner.handlers)
            .finish()
    }
}

async fn dispatch(inner: Weak<BusInner>, mut queue: mpsc::UnboundedReceiver<Inbound>) {
    let mut deferred = VecDeque::new();

    loop {
        let inbound = match deferred.pop_front() {
            Some(inbound) => inbound,
            None => match queue.recv().await {
                Some(inbound) => inbound,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let Some(work) = inner.settle(inbound, false) else {
            continue;
        };
        let key = inner.key();
        match work {
            Inbound::Request { id, method, params } => {
                let handling = DISPATCHING.scope(key, inner.handle_request(id, method, params));
                drain_while(handling, &inner, &mut queue, &mut deferred).await;
            }
            Inbound::Notification(notification) => {
                let handling = DISPATCHING.scope(key, inner.handle_notification(notification));
                drain_while(handling, &inner, &mut queue, &mut deferred).await;
            }
            Inbound::Response { .. } | Inbound::Closed { .. } => {}
        }
    }
}

/// Run a handler while settling the calls it makes on this bus
///
/// Everything else that arrives meanwhile is deferred in arrival order.
async fn drain_while<F: Future<Output = ()>>(
    handling: F,
    inner: &BusInner,
    queue: &mut mpsc::UnboundedReceiver<Inbound>,
    deferred: &mut VecDeque<Inbound>,
) {
    tokio::pin!(handling);
    let mut open = true;

    loop {
        tokio::select! {
            biased;
            () = &mut handling => return,
            inbound = queue.recv(), if open => match inbound {
                Some(inbound) => {
                    if let Some(later) = inner.settle(inbound, true) {
                        deferred.push_back(later);
                    }
                }
                None => open = false,
            },
        }
    }
}
