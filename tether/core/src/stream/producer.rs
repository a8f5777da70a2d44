//! Producer side of a stream
//!
//! Runs the registered factory for an open request, then pumps its chunks
//! as `{id}-data` notifications until the source ends, fails, or the
//! consumer sends `{id}-cancel`.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use super::chunk::{encode_chunk, Chunk};
use super::StreamMethods;
use crate::bus::{Notification, RpcBus, Subscription};

/// What a stream factory hands back
pub struct StreamSource {
    /// Sent to the consumer as `{id}-context` before any data, and again
    /// with `{id}-end`
    pub context: Option<Value>,
    /// The data; an `Err` item ends the stream with `{id}-error`
    pub chunks: BoxStream<'static, anyhow::Result<Chunk>>,
}

impl StreamSource {
    /// Source without context
    pub fn new<S>(chunks: S) -> Self
    where
        S: Stream<Item = anyhow::Result<Chunk>> + Send + 'static,
    {
        Self {
            context: None,
            chunks: chunks.boxed(),
        }
    }

    /// Attach a context value
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Builds a [`StreamSource`] from the consumer's options
pub type StreamFactory =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<StreamSource>> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct OpenRequest {
    id: String,
    #[serde(default)]
    options: Value,
}

/// Handle an open request for a registered stream
pub(crate) async fn open(
    bus: Arc<RpcBus>,
    factory: StreamFactory,
    notification: Notification,
) -> anyhow::Result<()> {
    let request: OpenRequest = serde_json::from_value(notification.params)?;
    let methods = StreamMethods::new(&request.id);
    tracing::debug!(stream = %notification.method, id = %request.id, "Opening stream");

    let source = match factory(request.options).await {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(stream = %notification.method, id = %request.id, error = %e, "Stream factory failed");
            bus.notify(&methods.error, json!({ "message": format!("{e:#}") }))?;
            return Ok(());
        }
    };

    bus.notify(&methods.context, json!({ "context": source.context }))?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel_subscription = bus.add_notification_handler(&methods.cancel, move |_| {
        cancel_tx.send_replace(true);
        async { Ok(()) }
    });

    tokio::spawn(pump(bus, methods, source, cancel_rx, cancel_subscription));
    Ok(())
}

async fn pump(
    bus: Arc<RpcBus>,
    methods: StreamMethods,
    source: StreamSource,
    mut cancelled: watch::Receiver<bool>,
    cancel_subscription: Subscription,
) {
    let StreamSource {
        context,
        mut chunks,
    } = source;
    let supports_buffer = bus.supports_buffer();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled.wait_for(|cancelled| *cancelled) => {
                tracing::debug!(id = %methods.id, "Stream cancelled by consumer");
                break;
            }
            next = chunks.next() => next,
        };

        let sent = match next {
            Some(Ok(chunk)) => {
                let (params, binary) = encode_chunk(chunk, supports_buffer);
                match binary {
                    Some(binary) => bus.notify_binary(&methods.data, params, binary),
                    None => bus.notify(&methods.data, params),
                }
            }
            Some(Err(e)) => {
                tracing::debug!(id = %methods.id, error = %e, "Stream source failed");
                let _ = bus.notify(&methods.error, json!({ "message": format!("{e:#}") }));
                break;
            }
            None => {
                let _ = bus.notify(&methods.end, json!({ "context": context }));
                break;
            }
        };

        if let Err(e) = sent {
            tracing::warn!(id = %methods.id, error = %e, "Failed to send stream data, stopping");
            break;
        }
    }

    cancel_subscription.unsubscribe();
}
