//! Consumer side of a stream
//!
//! An [`RpcStream`] listens on the four per-stream notifications and exposes
//! the data as a [`futures::Stream`]. Chunks are buffered in a bounded
//! channel; there is no flow control on the wire, so a consumer that falls
//! behind by more than the buffer capacity gets
//! [`StreamError::UnsupportedBackpressure`] and the producer is cancelled.

use std::backtrace::Backtrace;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use super::chunk::{decode_chunk, Chunk};
use super::{StreamError, StreamMethods};
use crate::bus::{Notification, RpcBus, Subscription};

/// Lifecycle of a consumed stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Open request sent, no context yet
    AwaitingContext,
    /// Context received, data may flow
    Active,
    /// Producer finished normally
    Ended,
    /// Producer failed, or the consumer gave up
    Errored,
}

impl StreamState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Errored)
    }
}

#[derive(Clone, Debug)]
enum ContextSlot {
    Pending,
    Ready(Option<Value>),
    Closed,
}

struct ConsumerShared {
    methods: StreamMethods,
    capacity: usize,
    bus: Weak<RpcBus>,
    state: Mutex<StreamState>,
    sender: Mutex<Option<mpsc::Sender<Chunk>>>,
    terminal_error: Mutex<Option<StreamError>>,
    context: watch::Sender<ContextSlot>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ConsumerShared {
    fn on_context(&self, params: &Value) {
        let context = params.get("context").cloned().filter(|v| !v.is_null());
        self.context.send_if_modified(|slot| {
            if matches!(slot, ContextSlot::Pending) {
                *slot = ContextSlot::Ready(context);
                true
            } else {
                false
            }
        });

        let mut state = self.state.lock();
        if *state == StreamState::AwaitingContext {
            *state = StreamState::Active;
        }
    }

    fn on_data(&self, notification: Notification) {
        let chunk = match decode_chunk(&notification.params, notification.binary) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.finish(StreamState::Errored, Some(e));
                self.cancel_remote();
                return;
            }
        };

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.try_send(chunk),
            None => return,
        };

        match sent {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(id = %self.methods.id, capacity = self.capacity, "Stream consumer fell behind, cancelling");
                self.finish(
                    StreamState::Errored,
                    Some(StreamError::UnsupportedBackpressure {
                        stream_id: self.methods.id.clone(),
                        capacity: self.capacity,
                    }),
                );
                self.cancel_remote();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.finish(StreamState::Errored, None);
                self.cancel_remote();
            }
        }
    }

    fn on_end(&self, params: &Value) {
        self.on_context(params);
        self.finish(StreamState::Ended, None);
    }

    fn on_error(&self, params: &Value) {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown stream error")
            .to_string();
        self.finish(
            StreamState::Errored,
            Some(StreamError::Remote {
                stream_id: self.methods.id.clone(),
                message,
            }),
        );
    }

    /// Move to a terminal state and release every resource
    fn finish(&self, state: StreamState, error: Option<StreamError>) {
        {
            let mut current = self.state.lock();
            if current.is_terminal() {
                return;
            }
            *current = state;
        }

        if let Some(error) = error {
            *self.terminal_error.lock() = Some(error);
        }
        self.sender.lock().take();
        self.context.send_if_modified(|slot| {
            if matches!(slot, ContextSlot::Pending) {
                *slot = ContextSlot::Closed;
                true
            } else {
                false
            }
        });
        self.unsubscribe_all();
    }

    fn unsubscribe_all(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }

    fn cancel_remote(&self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Err(e) = bus.notify(&self.methods.cancel, Value::Null) {
                tracing::debug!(id = %self.methods.id, error = %e, "Failed to send stream cancel");
            }
        }
    }
}

/// Consumer handle for one remote stream
///
/// Yields chunks in order; after the last chunk it yields the terminal
/// error, if any, then ends. Dropping it before the producer finishes
/// cancels the producer.
pub struct RpcStream {
    shared: Arc<ConsumerShared>,
    receiver: ReceiverStream<Chunk>,
    context: watch::Receiver<ContextSlot>,
}

impl RpcStream {
    /// Register the per-stream handlers and send the open request
    pub(crate) fn open(
        bus: &Arc<RpcBus>,
        name: &str,
        options: Value,
        capacity: usize,
    ) -> Result<Self, StreamError> {
        let methods = StreamMethods::new(&uuid::Uuid::new_v4().to_string());
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let (context_tx, context_rx) = watch::channel(ContextSlot::Pending);

        let shared = Arc::new(ConsumerShared {
            methods: methods.clone(),
            capacity,
            bus: Arc::downgrade(bus),
            state: Mutex::new(StreamState::AwaitingContext),
            sender: Mutex::new(Some(sender)),
            terminal_error: Mutex::new(None),
            context: context_tx,
            subscriptions: Mutex::new(Vec::new()),
        });

        let handler = Arc::clone(&shared);
        let on_context = bus.add_notification_handler(&methods.context, move |n| {
            handler.on_context(&n.params);
            async { Ok(()) }
        });
        let handler = Arc::clone(&shared);
        let on_data = bus.add_notification_handler(&methods.data, move |n| {
            handler.on_data(n);
            async { Ok(()) }
        });
        let handler = Arc::clone(&shared);
        let on_end = bus.add_notification_handler(&methods.end, move |n| {
            handler.on_end(&n.params);
            async { Ok(()) }
        });
        let handler = Arc::clone(&shared);
        let on_error = bus.add_notification_handler(&methods.error, move |n| {
            handler.on_error(&n.params);
            async { Ok(()) }
        });
        shared
            .subscriptions
            .lock()
            .extend([on_context, on_data, on_end, on_error]);

        tracing::debug!(stream = %name, id = %methods.id, "Opening remote stream");
        if let Err(e) = bus.notify(name, serde_json::json!({ "id": methods.id, "options": options }))
        {
            shared.unsubscribe_all();
            return Err(e.into());
        }

        Ok(Self {
            shared,
            receiver: ReceiverStream::new(receiver),
            context: context_rx,
        })
    }

    /// Stream id (the prefix of the per-stream notification names)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.methods.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    /// Wait for the producer's context value
    ///
    /// Resolves with `None` when the producer supplied no context.
    ///
    /// # Errors
    ///
    /// - `StreamError::ContextTimeout` if `timeout` elapses first; the error
    ///   carries a backtrace of this call site
    /// - the stream's terminal error if it failed before sending context
    pub async fn context(&self, timeout: Option<Duration>) -> Result<Option<Value>, StreamError> {
        let caller_backtrace = Arc::new(Backtrace::force_capture());
        let mut context = self.context.clone();

        let wait = async move {
            let slot = context
                .wait_for(|slot| !matches!(slot, ContextSlot::Pending))
                .await
                .map(|slot| slot.clone());
            match slot {
                Ok(ContextSlot::Ready(value)) => Ok(value),
                _ => Err(self.closed_error()),
            }
        };

        match timeout {
            None => wait.await,
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                StreamError::ContextTimeout {
                    stream_id: self.id().to_string(),
                    waited: limit,
                    caller_backtrace,
                }
            })?,
        }
    }

    fn closed_error(&self) -> StreamError {
        self.shared
            .terminal_error
            .lock()
            .clone()
            .unwrap_or_else(|| StreamError::Closed {
                stream_id: self.id().to_string(),
            })
    }
}

impl Stream for RpcStream {
    type Item = Result<Chunk, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.receiver).poll_next(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => Poll::Ready(self.shared.terminal_error.lock().take().map(Err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RpcStream {
    fn drop(&mut self) {
        let was_live = !self.state().is_terminal();
        self.shared.finish(StreamState::Errored, None);
        if was_live {
            tracing::debug!(id = %self.id(), "Stream dropped while active, cancelling producer");
            self.shared.cancel_remote();
        }
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
