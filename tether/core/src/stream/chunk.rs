//! Stream chunks and their wire encoding
//!
//! | Chunk                     | `{id}-data` params                          | attachment |
//! |---------------------------|---------------------------------------------|------------|
//! | `Text`                    | `{"chunk": "..."}`                          | -          |
//! | `Json`                    | `{"chunk": <value>, "encoding": "json"}`    | -          |
//! | `Binary`, buffer support  | `{"binary": true}`                          | bytes      |
//! | `Binary`, no buffer       | `{"chunk": "<base64>", "encoding": "base64"}`| -         |

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Value};

use super::StreamError;

/// Encoding marker for base64-wrapped binary chunks
pub const ENCODING_BASE64: &str = "base64";

/// Encoding marker for structured JSON chunks
pub const ENCODING_JSON: &str = "json";

/// One unit of stream data
#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Binary(Bytes),
    /// Structured value
    Json(Value),
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

impl From<Value> for Chunk {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Notification params and optional attachment for a chunk
pub(crate) fn encode_chunk(chunk: Chunk, supports_buffer: bool) -> (Value, Option<Bytes>) {
    match chunk {
        Chunk::Text(text) => (json!({ "chunk": text }), None),
        Chunk::Json(value) => (json!({ "chunk": value, "encoding": ENCODING_JSON }), None),
        Chunk::Binary(bytes) if supports_buffer => (json!({ "binary": true }), Some(bytes)),
        Chunk::Binary(bytes) => (
            json!({ "chunk": BASE64.encode(&bytes), "encoding": ENCODING_BASE64 }),
            None,
        ),
    }
}

/// Rebuild a chunk from `{id}-data` params
pub(crate) fn decode_chunk(params: &Value, binary: Option<Bytes>) -> Result<Chunk, StreamError> {
    if let Some(bytes) = binary {
        return Ok(Chunk::Binary(bytes));
    }

    let chunk = params
        .get("chunk")
        .ok_or_else(|| StreamError::Decode("data notification without a chunk".into()))?;

    match params.get("encoding").and_then(Value::as_str) {
        Some(ENCODING_JSON) => Ok(Chunk::Json(chunk.clone())),
        Some(ENCODING_BASE64) => {
            let encoded = chunk
                .as_str()
                .ok_or_else(|| StreamError::Decode("base64 chunk is not a string".into()))?;
            BASE64
                .decode(encoded)
                .map(|bytes| Chunk::Binary(Bytes::from(bytes)))
                .map_err(|e| StreamError::Decode(format!("invalid base64 chunk: {e}")))
        }
        Some(other) => Err(StreamError::Decode(format!("unknown chunk encoding: {other}"))),
        None => match chunk {
            Value::String(text) => Ok(Chunk::Text(text.clone())),
            other => Ok(Chunk::Json(other.clone())),
        },
    }
}
