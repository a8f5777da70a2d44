//! Bus errors

use thiserror::Error;

use crate::protocol::RpcErrorObject;
use crate::transport::TransportError;

/// Errors surfaced to callers of the bus
#[derive(Clone, Debug, Error)]
pub enum BusError {
    /// The remote handler answered with an error response
    #[error("RPC error: {}.{}: {}", .service, .method, error_json(.error))]
    Rpc {
        /// Service the request was sent to
        service: String,
        /// Method that failed
        method: String,
        /// Error object returned by the remote side
        error: RpcErrorObject,
    },

    /// The transport failed before a response arrived
    #[error("Transport error during {}.{}: {}", .service, .method, .source)]
    Transport {
        /// Service the request was sent to
        service: String,
        /// Method in flight
        method: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// Parameters or result could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The bus was closed
    #[error("Bus closed")]
    Closed,
}

impl BusError {
    /// The remote error object, if this is an error response
    #[must_use]
    pub fn rpc_error(&self) -> Option<&RpcErrorObject> {
        match self {
            Self::Rpc { error, .. } => Some(error),
            _ => None,
        }
    }

    /// The transport error, if the connection failed
    #[must_use]
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn error_json(error: &RpcErrorObject) -> String {
    serde_json::to_string(error).unwrap_or_else(|_| error.to_string())
}
