//! In-Process Transport
//!
//! Direct channel-based loopback for embedding both ends of a bus in the
//! same runtime. There is no isolation and nothing to restart; it exists for
//! tests and for wiring components together without a worker.
//!
//! # Usage
//!
//! ```ignore
//! let (left, right) = InProcessTransport::pair("calc");
//!
//! let server = RpcBus::new(Arc::new(right));
//! server.set_request_handler("add", |params| async move { /* ... */ });
//!
//! let client = RpcBus::new(Arc::new(left));
//! let sum = client.request("add", json!([1, 2])).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::handlers::HandlerSlots;
use super::traits::{
    ensure_encodable, ClosedHandler, Envelope, MessageHandler, Transport, TransportError,
};

struct Side {
    handlers: HandlerSlots,
    closed: AtomicBool,
}

impl Side {
    fn fire_closed_once(&self, error: Option<TransportError>) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handlers.fire_closed(error);
        }
    }
}

/// One end of an in-process loopback pair
pub struct InProcessTransport {
    service_name: String,
    supports_buffer: bool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    side: Arc<Side>,
}

impl InProcessTransport {
    /// Create a connected pair that carries binary attachments
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn pair(service_name: &str) -> (Self, Self) {
        Self::pair_with_buffer_support(service_name, true)
    }

    /// Create a connected pair, choosing whether binary attachments pass
    ///
    /// With `supports_buffer = false` the pair behaves like a pipe-based
    /// transport, which is handy for exercising fallback encodings.
    #[must_use]
    pub fn pair_with_buffer_support(service_name: &str, supports_buffer: bool) -> (Self, Self) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();

        let left = Self::new_side(service_name, supports_buffer, right_tx, left_rx);
        let right = Self::new_side(service_name, supports_buffer, left_tx, right_rx);
        (left, right)
    }

    fn new_side(
        service_name: &str,
        supports_buffer: bool,
        outbound: mpsc::UnboundedSender<Envelope>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        let side = Arc::new(Side {
            handlers: HandlerSlots::default(),
            closed: AtomicBool::new(false),
        });

        let pump = Arc::clone(&side);
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                pump.handlers.deliver(envelope);
            }
            pump.fire_closed_once(None);
        });

        Self {
            service_name: service_name.to_string(),
            supports_buffer,
            outbound: Mutex::new(Some(outbound)),
            side,
        }
    }

    /// Fire this side's closed handler as if the connection dropped
    ///
    /// Messages keep flowing; only the notification is simulated.
    pub fn simulate_close(&self, error: Option<TransportError>) {
        self.side.handlers.fire_closed(error);
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn supports_buffer(&self) -> bool {
        self.supports_buffer
    }

    fn send_message(&self, envelope: Envelope) -> Result<(), TransportError> {
        ensure_encodable(&envelope, self.supports_buffer)?;

        match self.outbound.lock().as_ref() {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| TransportError::SendFailed("Channel closed".to_string())),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn register_message_handler(&self, handler: MessageHandler) {
        self.side.handlers.set_message(handler);
    }

    fn register_transport_closed_handler(&self, handler: ClosedHandler) {
        self.side.handlers.set_closed(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.outbound.lock().take();
        self.side.fire_closed_once(None);
        Ok(())
    }
}
