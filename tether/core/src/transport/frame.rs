//! Frame Protocol
//!
//! Wire format used on byte pipes (the stdin/stdout of a process worker):
//! length-prefixed JSON with a CRC32 checksum.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32          | Envelope body                            |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! The Length field covers the JSON payload only. Binary attachments never
//! reach this layer: pipe transports do not support buffers, so stream chunks
//! arrive here already base64-encoded inside the body.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::traits::{Envelope, TransportError};

/// Maximum frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length + 4 bytes checksum
const HEADER_SIZE: usize = 8;

#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode an envelope body into a frame
///
/// # Errors
///
/// Returns `TransportError::BinaryUnsupported` if the envelope carries a
/// binary attachment, and `TransportError::SerializationError` if the body
/// cannot be serialized or exceeds `MAX_FRAME_SIZE`.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
    if envelope.binary.is_some() {
        return Err(TransportError::BinaryUnsupported);
    }

    let json = serde_json::to_vec(&envelope.body)
        .map_err(|e| TransportError::SerializationError(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::SerializationError(format!(
            "Frame too large: {} bytes (max: {})",
            json.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len = u32::try_from(json.len())
        .map_err(|_| TransportError::SerializationError("Frame length overflow".into()))?;
    let checksum = compute_checksum(&json);

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Incremental decoder for a stream of frames
///
/// Buffers incoming bytes and yields complete envelopes.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns `Ok(None)` when more data is needed.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ChecksumMismatch` on corrupted payloads and
    /// `TransportError::SerializationError` on oversized frames or invalid JSON.
    pub fn decode(&mut self) -> Result<Option<Envelope>, TransportError> {
        let available = self.available();
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::SerializationError(format!(
                "Frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }

        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        let payload = &self.buffer[payload_start..payload_end];

        let actual = compute_checksum(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        let body = serde_json::from_slice(payload)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;

        self.read_pos = payload_end;
        Ok(Some(Envelope::json(body)))
    }
}

/// Read frames from `reader` until EOF, handing each envelope to `on_envelope`
///
/// Returns `Ok(())` on clean EOF.
///
/// # Errors
///
/// Propagates read failures and undecodable frames.
pub(crate) async fn read_frames<R, F>(mut reader: R, mut on_envelope: F) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    F: FnMut(Envelope),
{
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.push(&buf[..n]);
        while let Some(envelope) = decoder.decode()? {
            on_envelope(envelope);
        }
    }
}

/// Drain `rx` into `writer` as frames until the channel closes
///
/// # Errors
///
/// Propagates write failures. Envelopes that cannot be encoded are logged
/// and skipped.
pub(crate) async fn write_frames<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        match encode(&envelope) {
            Ok(data) => {
                writer.write_all(&data).await?;
                writer.flush().await?;
            }
            Err(e) => tracing::warn!(error = %e, "Dropping unencodable frame"),
        }
    }
    writer.flush().await?;
    Ok(())
}
