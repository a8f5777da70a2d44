//! Transport Traits
//!
//! The contract every transport implements, plus the error type shared by
//! all of them.
//!
//! A transport is a bidirectional message channel between two isolated
//! execution units. It knows nothing about RPC semantics: it moves
//! [`Envelope`]s, hands inbound ones to exactly one registered handler, and
//! reports when the underlying connection goes away.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Unit of traffic carried by a transport
///
/// `body` is the JSON message itself. `binary` is an optional raw attachment
/// that only buffer-capable transports (see [`Transport::supports_buffer`])
/// accept; everything else must re-encode binary data into `body`.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// JSON message body
    pub body: serde_json::Value,
    /// Raw binary attachment
    pub binary: Option<Bytes>,
}

impl Envelope {
    /// Create an envelope with a JSON body only
    #[must_use]
    pub fn json(body: serde_json::Value) -> Self {
        Self { body, binary: None }
    }

    /// Create an envelope with a binary attachment
    #[must_use]
    pub fn with_binary(body: serde_json::Value, binary: Bytes) -> Self {
        Self {
            body,
            binary: Some(binary),
        }
    }
}

/// Callback receiving every inbound envelope
pub type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Callback fired when the underlying connection closes
///
/// Receives `Some(error)` when the closure was abnormal, `None` otherwise.
pub type ClosedHandler = Arc<dyn Fn(Option<TransportError>) + Send + Sync>;

/// Errors that can occur in transport operations
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransportError {
    /// The channel is closed and will not deliver anything else
    #[error("Transport closed")]
    ConnectionClosed,

    /// A message could not be handed to the channel
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The isolated execution unit could not be started
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// The isolated execution unit terminated abnormally
    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    /// A binary attachment was sent over a transport that cannot carry one
    #[error("Transport does not support binary payloads")]
    BinaryUnsupported,

    /// A message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A frame failed integrity verification
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame header
        expected: u32,
        /// Checksum computed over the received payload
        actual: u32,
    },

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Bidirectional message channel between two isolated execution units
///
/// Implementations must preserve FIFO order of the messages they send.
/// Side effects only happen through these operations; there is no shared
/// global state between transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Logical name of the service on the other end
    fn service_name(&self) -> &str;

    /// Whether binary attachments may be sent as-is
    fn supports_buffer(&self) -> bool;

    /// Queue a message for delivery (fire-and-forget)
    ///
    /// # Errors
    ///
    /// Fails when the channel is closed or the envelope carries a binary
    /// attachment the transport cannot move.
    fn send_message(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Install the inbound message handler, replacing any previous one
    fn register_message_handler(&self, handler: MessageHandler);

    /// Install the connection-closed handler, replacing any previous one
    fn register_transport_closed_handler(&self, handler: ClosedHandler);

    /// Close the transport
    ///
    /// Idempotent and best-effort.
    async fn close(&self) -> Result<(), TransportError>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("service_name", &self.service_name())
            .field("supports_buffer", &self.supports_buffer())
            .finish()
    }
}

/// Reject envelopes a non-buffer transport cannot carry
pub(crate) fn ensure_encodable(
    envelope: &Envelope,
    supports_buffer: bool,
) -> Result<(), TransportError> {
    if envelope.binary.is_some() && !supports_buffer {
        return Err(TransportError::BinaryUnsupported);
    }
    Ok(())
}
