//! Wire Protocol
//!
//! JSON-RPC 2.0 style messages exchanged over a transport. Every message
//! carries the `"jsonrpc": "2.0"` tag; anything without it is not ours and
//! is ignored by the bus.
//!
//! # Classification
//!
//! | `id` | `method` | Kind                                  |
//! |------|----------|---------------------------------------|
//! | yes  | yes      | Request                               |
//! | yes  | no       | Response (error if `error` is present)|
//! | no   | yes      | Notification                          |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Key of the protocol tag
pub const PROTOCOL_TAG: &str = "jsonrpc";

/// Value of the protocol tag
pub const PROTOCOL_VERSION: &str = "2.0";

/// Error code for a request naming an unknown method
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error code for a handler that failed
pub const SERVER_ERROR: i64 = -32000;

/// Request correlation id
///
/// Peers may use any JSON number or string; ids are echoed back verbatim.
/// Ids generated by this crate are unsigned integers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id
    Number(Number),
    /// String id
    String(String),
}

impl RequestId {
    /// The id as an unsigned integer, if it is one
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => n.as_u64(),
            Self::String(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Number(Number::from(id))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Structured error carried by an error response
///
/// Request handlers can return this (wrapped in `anyhow::Error`) to control
/// the exact code and data sent back to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct RpcErrorObject {
    /// Numeric error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
    /// Optional extra data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Create an error with a code and message
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Error for a request naming a method with no handler
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not implemented: {method}"))
    }

    /// Error for a handler that failed
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(SERVER_ERROR, message)
    }

    /// Attach extra data
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A classified protocol message
#[derive(Clone, Debug, PartialEq)]
pub enum RpcMessage {
    /// Call expecting a response
    Request {
        /// Correlation id
        id: RequestId,
        /// Method name
        method: String,
        /// Parameters (`Null` when absent)
        params: Value,
    },
    /// Fire-and-forget call
    Notification {
        /// Method name
        method: String,
        /// Parameters (`Null` when absent)
        params: Value,
    },
    /// Successful response
    Success {
        /// Id of the request being answered
        id: RequestId,
        /// Result value
        result: Value,
    },
    /// Error response
    Error {
        /// Id of the request being answered
        id: RequestId,
        /// Error details
        error: RpcErrorObject,
    },
}

/// Why a value could not be classified
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// Message is not a JSON object
    #[error("Message is not an object")]
    NotAnObject,

    /// Message lacks the protocol tag
    #[error("Message is missing the \"jsonrpc\": \"2.0\" tag")]
    Untagged,

    /// `id` is neither a number nor a string
    #[error("Invalid id: {0}")]
    InvalidId(Value),

    /// `method` is not a string
    #[error("Invalid method: {0}")]
    InvalidMethod(Value),

    /// `error` is not a valid error object
    #[error("Invalid error object: {0}")]
    InvalidError(String),

    /// Neither `id` nor `method` present
    #[error("Message has neither id nor method")]
    Unclassifiable,
}

impl RpcMessage {
    /// Serialize into a tagged JSON value
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(PROTOCOL_TAG.into(), Value::from(PROTOCOL_VERSION));

        match self {
            Self::Request { id, method, params } => {
                object.insert("id".into(), id_value(id));
                object.insert("method".into(), Value::from(method.as_str()));
                object.insert("params".into(), params.clone());
            }
            Self::Notification { method, params } => {
                object.insert("method".into(), Value::from(method.as_str()));
                object.insert("params".into(), params.clone());
            }
            Self::Success { id, result } => {
                object.insert("id".into(), id_value(id));
                object.insert("result".into(), result.clone());
            }
            Self::Error { id, error } => {
                object.insert("id".into(), id_value(id));
                object.insert(
                    "error".into(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
            }
        }

        Value::Object(object)
    }

    /// Classify a JSON value
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Untagged` for values that are not protocol
    /// messages at all, and another variant for malformed ones.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;

        if object.get(PROTOCOL_TAG).and_then(Value::as_str) != Some(PROTOCOL_VERSION) {
            return Err(ProtocolError::Untagged);
        }

        let id = match object.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(RequestId::String(s.clone())),
            Some(Value::Number(n)) => Some(RequestId::Number(n.clone())),
            Some(other) => return Err(ProtocolError::InvalidId(other.clone())),
        };

        let method = match object.get("method") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => return Err(ProtocolError::InvalidMethod(other.clone())),
        };

        let params = object.get("params").cloned().unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => match object.get("error") {
                Some(error) if !error.is_null() => {
                    let error = serde_json::from_value(error.clone())
                        .map_err(|e| ProtocolError::InvalidError(e.to_string()))?;
                    Ok(Self::Error { id, error })
                }
                _ => Ok(Self::Success {
                    id,
                    result: object.get("result").cloned().unwrap_or(Value::Null),
                }),
            },
            (None, None) => Err(ProtocolError::Unclassifiable),
        }
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::Number(n.clone()),
        RequestId::String(s) => Value::from(s.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let message = RpcMessage::Request {
            id: RequestId::from(7),
            method: "add".into(),
            params: json!([1, 2]),
        };
        assert_eq!(
            message.to_value(),
            json!({"jsonrpc": "2.0", "id": 7, "method": "add", "params": [1, 2]})
        );
    }

    #[test]
    fn test_error_wire_shape_omits_missing_data() {
        let message = RpcMessage::Error {
            id: RequestId::from(1),
            error: RpcErrorObject::method_not_found("nope"),
        };
        assert_eq!(
            message.to_value(),
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32601, "message": "Method not implemented: nope"}
            })
        );
    }

    #[test]
    fn test_classify_request_and_notification() {
        let request = json!({"jsonrpc": "2.0", "id": "abc", "method": "m", "params": {"a": 1}});
        assert_eq!(
            RpcMessage::from_value(&request).unwrap(),
            RpcMessage::Request {
                id: RequestId::String("abc".into()),
                method: "m".into(),
                params: json!({"a": 1}),
            }
        );

        let notification = json!({"jsonrpc": "2.0", "method": "tick"});
        assert_eq!(
            RpcMessage::from_value(&notification).unwrap(),
            RpcMessage::Notification {
                method: "tick".into(),
                params: Value::Null,
            }
        );
    }

    #[test]
    fn test_classify_responses() {
        let success = json!({"jsonrpc": "2.0", "id": 3});
        assert_eq!(
            RpcMessage::from_value(&success).unwrap(),
            RpcMessage::Success {
                id: RequestId::from(3),
                result: Value::Null,
            }
        );

        let error = json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32000, "message": "boom", "data": {"k": true}}
        });
        assert_eq!(
            RpcMessage::from_value(&error).unwrap(),
            RpcMessage::Error {
                id: RequestId::from(4),
                error: RpcErrorObject::server_error("boom").with_data(json!({"k": true})),
            }
        );
    }

    #[test]
    fn test_untagged_and_malformed_messages() {
        assert_eq!(
            RpcMessage::from_value(&json!({"id": 1, "method": "m"})),
            Err(ProtocolError::Untagged)
        );
        assert_eq!(
            RpcMessage::from_value(&json!({"jsonrpc": "1.0", "id": 1})),
            Err(ProtocolError::Untagged)
        );
        assert_eq!(
            RpcMessage::from_value(&json!([1, 2])),
            Err(ProtocolError::NotAnObject)
        );
        assert_eq!(
            RpcMessage::from_value(&json!({"jsonrpc": "2.0"})),
            Err(ProtocolError::Unclassifiable)
        );
        assert!(matches!(
            RpcMessage::from_value(&json!({"jsonrpc": "2.0", "id": true, "method": "m"})),
            Err(ProtocolError::InvalidId(_))
        ));
        assert!(matches!(
            RpcMessage::from_value(&json!({"jsonrpc": "2.0", "id": 1, "error": "bad"})),
            Err(ProtocolError::InvalidError(_))
        ));
    }

    #[test]
    fn test_any_numeric_id_is_echoed_verbatim() {
        for raw in [json!(-1), json!(1.5), json!(u64::MAX)] {
            let request = json!({"jsonrpc": "2.0", "id": raw.clone(), "method": "ping"});
            let RpcMessage::Request { id, .. } = RpcMessage::from_value(&request).unwrap() else {
                panic!("expected a request for id {raw}");
            };

            let reply = RpcMessage::Success {
                id,
                result: json!("pong"),
            };
            assert_eq!(reply.to_value()["id"], raw);
        }

        assert_eq!(RequestId::from(9).as_u64(), Some(9));
        assert_eq!(RequestId::String("9".into()).as_u64(), None);
    }

    #[test]
    fn test_error_object_display() {
        let error = RpcErrorObject::new(-1, "nope");
        assert_eq!(error.to_string(), "nope (code -1)");
    }
}
