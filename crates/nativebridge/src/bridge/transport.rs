//! Outbound transport adapters.
//!
//! The boundary only offers one-way, fire-and-forget delivery, so a transport
//! is just `send`. Inbound traffic is pushed by the host into
//! `BridgeService::on_message`.
//!
//! - **ChannelTransport**: in-process unbounded channel (embedding, tests)
//! - **StreamTransport**: single writer task over any AsyncWrite, framed with `WireCodec`,
//!   with a frame limit checked before queueing
//! - **ScriptTransport**: wraps each message in a script call for a web view evaluator

use std::io;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt};
use tokio::io::AsyncWrite;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use super::codec::{DEFAULT_MAX_FRAME_BYTES, WireCodec};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    /// Refused before queueing; the transport stays usable.
    #[error("message of {size} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge { size: usize, max: usize },
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("stream transport must be spawned inside a tokio runtime")]
    NoRuntime,
}

/// One-way delivery of wire strings to the peer.
///
/// `send` must not block indefinitely. Implementations serialize concurrent
/// sends so envelopes never interleave on the channel.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, message: String) -> Result<(), TransportError>;

    /// Resolves once the transport can no longer deliver anything.
    ///
    /// `None` for transports that do not report this; their failures only
    /// surface through `send`.
    fn closed(&self) -> Option<BoxFuture<'static, ()>> {
        None
    }
}

/// Transport backed by an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    /// Create a transport and the receiver that observes everything it sends.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: String) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }
}

/// Transport writing length-framed messages to a byte stream.
///
/// Sends are queued and drained by one writer task, which owns the stream.
/// Messages over the frame limit are refused in `send` so they never reach
/// the writer.
#[derive(Debug, Clone)]
pub struct StreamTransport {
    tx: mpsc::UnboundedSender<String>,
    max_frame_length: usize,
    writer_done: CancellationToken,
}

impl StreamTransport {
    /// Spawn the writer task with the default frame limit.
    ///
    /// The task ends when every handle is dropped or a write fails; later
    /// sends then report `Closed` and `closed()` resolves.
    pub fn spawn<W>(
        writer: W,
    ) -> Result<(Self, JoinHandle<Result<(), TransportError>>), TransportError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_with_max_frame(writer, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn spawn_with_max_frame<W>(
        writer: W,
        max_frame_length: usize,
    ) -> Result<(Self, JoinHandle<Result<(), TransportError>>), TransportError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_done = CancellationToken::new();
        let done = writer_done.clone();

        let handle = runtime.spawn(async move {
            // Cancelled on every exit path, including a panic in the writer.
            let _done = done.drop_guard();
            let mut framed =
                FramedWrite::new(writer, WireCodec::with_max_frame_length(max_frame_length));
            while let Some(message) = rx.recv().await {
                let size = message.len();
                match framed.send(message).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                        tracing::error!(
                            frame_size_bytes = size,
                            error = %e,
                            "Dropping unencodable frame"
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Stream transport write failed");
                        return Err(TransportError::Io(e));
                    }
                }
            }
            if let Err(e) = framed.close().await {
                tracing::warn!(error = %e, "Failed to close stream transport");
                return Err(TransportError::Io(e));
            }
            tracing::debug!("Stream transport writer exiting");
            Ok(())
        });

        Ok((
            Self {
                tx,
                max_frame_length,
                writer_done,
            },
            handle,
        ))
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Transport for StreamTransport {
    fn send(&self, message: String) -> Result<(), TransportError> {
        if message.len() > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                size: message.len(),
                max: self.max_frame_length,
            });
        }
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    fn closed(&self) -> Option<BoxFuture<'static, ()>> {
        Some(self.writer_done.clone().cancelled_owned().boxed())
    }
}

type ScriptEvaluator = Arc<dyn Fn(String) + Send + Sync>;

/// Transport into a scripted UI layer that can only be reached by evaluating
/// script source.
///
/// Each message becomes `<callback>('<base64>')`. Base64 keeps quotes,
/// backslashes and line separators in the JSON from breaking the literal.
#[derive(Clone)]
pub struct ScriptTransport {
    callback: String,
    evaluate: ScriptEvaluator,
}

impl ScriptTransport {
    pub fn new<F>(callback: impl Into<String>, evaluate: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            callback: callback.into(),
            evaluate: Arc::new(evaluate),
        }
    }

    pub fn script_for(&self, message: &str) -> String {
        format!("{}('{}')", self.callback, STANDARD.encode(message))
    }
}

impl std::fmt::Debug for ScriptTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptTransport")
            .field("callback", &self.callback)
            .finish_non_exhaustive()
    }
}

impl Transport for ScriptTransport {
    fn send(&self, message: String) -> Result<(), TransportError> {
        (self.evaluate)(self.script_for(&message));
        Ok(())
    }
}
