//! Stream Multiplexer
//!
//! Named, chunked data streams carried entirely on bus notifications, so
//! many streams share one transport.
//!
//! # Protocol
//!
//! ```text
//! consumer                                   producer
//!    │── name {id, options} ────────────────────►│ factory(options)
//!    │◄──────────────── {id}-context {context} ──│
//!    │◄──────────────── {id}-data    {chunk...} ─│  (repeated)
//!    │◄──────────────── {id}-end     {context} ──│  or {id}-error {message}
//!    │── {id}-cancel ───────────────────────────►│  (consumer gives up)
//! ```
//!
//! Stream ids are random UUIDs minted by the consumer.

mod chunk;
mod consumer;
mod producer;

use std::backtrace::Backtrace;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use chunk::{Chunk, ENCODING_BASE64, ENCODING_JSON};
pub use consumer::{RpcStream, StreamState};
pub use producer::{StreamFactory, StreamSource};

use crate::bus::{BusError, RpcBus};

/// Default number of chunks a consumer buffers before giving up
pub const DEFAULT_BUFFER_CAPACITY: usize = 64;

/// Stream multiplexer configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Chunks buffered per consumed stream
    pub buffer_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Errors surfaced by streams
#[derive(Clone, Debug, Error)]
pub enum StreamError {
    /// The producer reported a failure
    #[error("Stream {stream_id} failed: {message}")]
    Remote {
        /// Stream id
        stream_id: String,
        /// Message sent by the producer
        message: String,
    },

    /// The consumer did not keep up with the producer
    #[error("Stream {stream_id} overflowed its buffer of {capacity} chunks; backpressure is not supported")]
    UnsupportedBackpressure {
        /// Stream id
        stream_id: String,
        /// Buffer capacity that was exceeded
        capacity: usize,
    },

    /// No context arrived in time
    #[error("Timed out after {waited:?} waiting for context of stream {stream_id}")]
    ContextTimeout {
        /// Stream id
        stream_id: String,
        /// How long the caller waited
        waited: Duration,
        /// Where the caller started waiting
        caller_backtrace: Arc<Backtrace>,
    },

    /// The stream closed before the requested value arrived
    #[error("Stream {stream_id} closed")]
    Closed {
        /// Stream id
        stream_id: String,
    },

    /// A data notification could not be decoded
    #[error("Undecodable stream chunk: {0}")]
    Decode(String),

    /// The bus refused the open request
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl StreamError {
    /// Backtrace of the waiting call site, for context timeouts
    #[must_use]
    pub fn caller_backtrace(&self) -> Option<&Backtrace> {
        match self {
            Self::ContextTimeout {
                caller_backtrace, ..
            } => Some(caller_backtrace.as_ref()),
            _ => None,
        }
    }
}

/// Notification names used by one stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StreamMethods {
    pub(crate) id: String,
    pub(crate) context: String,
    pub(crate) data: String,
    pub(crate) end: String,
    pub(crate) error: String,
    pub(crate) cancel: String,
}

impl StreamMethods {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            context: format!("{id}-context"),
            data: format!("{id}-data"),
            end: format!("{id}-end"),
            error: format!("{id}-error"),
            cancel: format!("{id}-cancel"),
        }
    }
}

/// Opens and serves streams over an [`RpcBus`]
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    bus: Arc<RpcBus>,
    config: StreamConfig,
}

impl StreamMultiplexer {
    /// Multiplexer with default configuration
    #[must_use]
    pub fn new(bus: Arc<RpcBus>) -> Self {
        Self::with_config(bus, StreamConfig::default())
    }

    /// Multiplexer with explicit configuration
    #[must_use]
    pub fn with_config(bus: Arc<RpcBus>, config: StreamConfig) -> Self {
        Self { bus, config }
    }

    /// The underlying bus
    #[must_use]
    pub fn bus(&self) -> &Arc<RpcBus> {
        &self.bus
    }

    /// Serve streams named `name` using `factory`
    ///
    /// Replaces any earlier registration for the same name.
    pub fn register_stream_handler<F, Fut>(&self, name: &str, factory: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StreamSource>> + Send + 'static,
    {
        let factory: StreamFactory = Arc::new(move |options| factory(options).boxed());
        let bus = Arc::downgrade(&self.bus);

        self.bus.remove_all_notification_handlers(name);
        self.bus.add_notification_handler(name, move |notification| {
            let bus = bus.upgrade();
            let factory = Arc::clone(&factory);
            async move {
                match bus {
                    Some(bus) => producer::open(bus, factory, notification).await,
                    None => Ok(()),
                }
            }
        });
        tracing::debug!(stream = %name, "Registered stream handler");
    }

    /// Stop serving streams named `name`
    ///
    /// Streams already running keep going. Returns `false` if nothing was
    /// registered under that name.
    pub fn unregister_stream_handler(&self, name: &str) -> bool {
        self.bus.remove_all_notification_handlers(name) > 0
    }

    /// Open the remote stream `name`
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Bus` if the open request cannot be sent.
    pub fn open_stream(&self, name: &str, options: Value) -> Result<RpcStream, StreamError> {
        RpcStream::open(&self.bus, name, options, self.config.buffer_capacity)
    }
}
