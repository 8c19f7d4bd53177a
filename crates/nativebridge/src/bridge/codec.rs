//! Envelope codec and stream framing.
//!
//! `encode`/`decode` convert envelopes to and from their JSON wire string.
//! `WireCodec` frames those strings with a length prefix so they can travel
//! over any AsyncRead/AsyncWrite (pipes, sockets, stdio).

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{Envelope, WireEnvelope, is_terminal_type};

/// Frames above this size get logged, they usually mean a handler returned a whole file.
const LARGE_FRAME_BYTES: usize = 100_000;

/// Largest frame either direction accepts unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The name would decode as a different envelope kind, or not at all.
    #[error("`{0}` cannot be sent as an operation name")]
    InvalidOperation(String),
}

pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    if let Envelope::Request { operation, .. } = envelope
        && (operation.is_empty() || is_terminal_type(operation))
    {
        return Err(CodecError::InvalidOperation(operation.clone()));
    }
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a wire string.
///
/// Empty, truncated and non-conforming payloads are errors; callers log and
/// drop them rather than tearing down the channel.
pub fn decode(payload: &str) -> Result<Envelope, DecodeError> {
    if payload.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    let wire: WireEnvelope = serde_json::from_str(payload)?;
    Envelope::try_from(wire).map_err(DecodeError::Malformed)
}

/// Length-prefixed framing for wire strings.
///
/// Frames longer than `max_frame_length` are refused on both sides. An
/// oversized outbound frame is an `InvalidInput` error that leaves the
/// buffer untouched, so the stream stays usable.
pub struct WireCodec {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Decoder for WireCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            // A bad frame must not end the stream; lossy text fails envelope decoding instead.
            Some(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Ok(Some(text)),
                Err(e) => {
                    tracing::warn!(frame_size_bytes = bytes.len(), "Frame is not valid UTF-8");
                    Ok(Some(String::from_utf8_lossy(e.as_bytes()).into_owned()))
                }
            },
            None => Ok(None),
        }
    }
}

impl Encoder<String> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        tracing::trace!(frame_size_bytes = len, "Encoding frame");
        if len > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    len, self.max_frame_length
                ),
            ));
        }
        if len > LARGE_FRAME_BYTES {
            tracing::info!(
                frame_size_bytes = len,
                frame_size_kb = len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(item), dst)
    }
}
