//! Newline-delimited JSON codec for agent messages
//!
//! All messages are framed as:
//! ```text
//! [ N bytes: UTF-8 JSON object ][ 1 byte: '\n' ]
//! ```
//!
//! The agent writes one object per line on its stdout, so message boundaries
//! survive arbitrary chunking by the transport underneath.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum line size (16 MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const DELIMITER: u8 = b'\n';

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message into a newline-terminated byte buffer
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message directly into a provided buffer
pub fn encode_into<T: Serialize>(message: &T, buf: &mut BytesMut) -> Result<(), CodecError> {
    let json = serde_json::to_vec(message)?;

    if json.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(json.len()));
    }

    buf.reserve(json.len() + 1);
    buf.put_slice(&json);
    buf.put_u8(DELIMITER);

    Ok(())
}

/// Try to decode one line from the front of a buffer
///
/// Returns:
/// - `Ok(Some(message))` if a complete line was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the line is invalid (the offending line is consumed)
///
/// Blank lines are skipped.
pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
    loop {
        let Some(end) = buf.iter().position(|b| *b == DELIMITER) else {
            if buf.len() > MAX_MESSAGE_SIZE {
                let len = buf.len();
                buf.clear();
                return Err(CodecError::MessageTooLarge(len));
            }
            return Ok(None);
        };

        let line = buf.split_to(end + 1);
        let line = trim_line(&line[..end]);
        if line.is_empty() {
            continue;
        }

        return Ok(Some(serde_json::from_slice(line)?));
    }
}

/// Strip a trailing carriage return and surrounding ASCII whitespace
fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Partial line data being accumulated
    buffer: BytesMut,
}

impl LineDecoder {
    /// Create a new line decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next message from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete lines
    pub fn decode_next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
