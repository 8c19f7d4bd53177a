//! BridgeService: the public face of the bridge.
//!
//! This service owns:
//! - Outbound calls (correlation ids, pending table, timeouts)
//! - Inbound routing (replies settle pending calls, requests go to the dispatcher)
//! - Lifecycle (Created → Active → Closed) and peer readiness
//!
//! Inbound requests each run on their own task so a slow operation never
//! holds up other traffic. Replies are sent through the same transport as
//! requests.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::runtime::Handle;
use tokio_util::codec::FramedRead;
use tokio_util::task::TaskTracker;

use crate::bridge::codec::{WireCodec, decode, encode};
use crate::bridge::protocol::{CallId, Envelope, ErrorInfo, is_terminal_type};
use crate::bridge::transport::{Transport, TransportError};
use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatcher, REPLY_TOO_LARGE};
use crate::error::{BridgeError, CallError};
use crate::pending::{CallIdGenerator, PendingCalls};
use crate::ready::{ReadyState, Readiness};
use crate::registry::OperationRegistry;

/// Lifecycle of a bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Constructed; inbound traffic is not accepted yet.
    Created,
    Active,
    /// Torn down; calls fail with `TransportClosed`.
    Closed,
}

impl BridgeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Active => 1,
            Self::Closed => 2,
        }
    }
}

struct Inner {
    config: BridgeConfig,
    state: AtomicU8,
    transport: Arc<dyn Transport>,
    ids: CallIdGenerator,
    pending: PendingCalls,
    ready: Arc<ReadyState>,
    dispatcher: Dispatcher,
    tasks: TaskTracker,
    runtime: Handle,
}

impl Inner {
    fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Send a reply. A reply the transport refuses as too large is replaced
    /// by an error-response so the requester still hears back.
    fn transmit(&self, envelope: &Envelope) {
        let wire = match encode(envelope) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::error!(call_id = %envelope.id(), error = %e, "Failed to encode reply");
                return;
            }
        };
        match self.transport.send(wire) {
            Ok(()) => {}
            Err(TransportError::FrameTooLarge { size, max }) => {
                tracing::warn!(
                    call_id = %envelope.id(),
                    frame_size_bytes = size,
                    max_frame_bytes = max,
                    "Reply too large, sending error-response instead"
                );
                let fallback = Envelope::error_response(
                    envelope.id().clone(),
                    ErrorInfo::new(
                        REPLY_TOO_LARGE,
                        format!("reply of {} bytes exceeds the {} byte frame limit", size, max),
                    ),
                );
                let sent = encode(&fallback)
                    .map_err(|e| e.to_string())
                    .and_then(|wire| self.transport.send(wire).map_err(|e| e.to_string()));
                if let Err(e) = sent {
                    tracing::error!(call_id = %envelope.id(), error = %e, "Failed to send error-response");
                }
            }
            Err(e) => {
                tracing::warn!(
                    call_id = %envelope.id(),
                    kind = envelope.kind().as_str(),
                    error = %e,
                    "Failed to send reply"
                );
                self.close();
            }
        }
    }

    fn close(&self) -> usize {
        let previous = self.state.swap(BridgeState::Closed.as_u8(), Ordering::AcqRel);
        if BridgeState::from_u8(previous) == BridgeState::Closed {
            return 0;
        }
        self.tasks.close();
        let failed = self.pending.fail_all(CallError::TransportClosed);
        tracing::info!(failed_calls = failed, "Bridge closed");
        failed
    }
}

/// Removes the pending entry if the call future is dropped or times out
/// before its reply arrives. A no-op once the entry has been settled.
struct CallGuard<'a> {
    pending: &'a PendingCalls,
    id: CallId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.pending.forget(&self.id) {
            tracing::debug!(call_id = %self.id, "Abandoned pending call");
        }
    }
}

/// Correlation-based request/response bridge over a one-way transport.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct BridgeService {
    inner: Arc<Inner>,
}

impl BridgeService {
    /// Create a bridge in the `Created` state.
    ///
    /// Must be called from within a tokio runtime; inbound requests are
    /// dispatched on it.
    pub fn new<T: Transport>(
        config: BridgeConfig,
        registry: OperationRegistry,
        transport: T,
    ) -> Result<Self, BridgeError> {
        Self::with_shared_transport(config, registry, Arc::new(transport))
    }

    pub fn with_shared_transport(
        config: BridgeConfig,
        registry: OperationRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BridgeError> {
        let runtime = Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let ready = Arc::new(ReadyState::new());
        let dispatcher = Dispatcher::new(registry, Arc::clone(&ready), &config);

        tracing::debug!(
            id_prefix = %config.id_prefix,
            platform = %config.platform,
            operations = ?dispatcher.registry().names(),
            "Bridge created"
        );

        let closed = transport.closed();
        let inner = Arc::new(Inner {
            ids: CallIdGenerator::new(config.id_prefix.clone()),
            config,
            state: AtomicU8::new(BridgeState::Created.as_u8()),
            transport,
            pending: PendingCalls::new(),
            ready,
            dispatcher,
            tasks: TaskTracker::new(),
            runtime,
        });

        // A dead transport settles everything outstanding instead of leaving
        // callers waiting on replies that can no longer arrive.
        if let Some(closed) = closed {
            let weak = Arc::downgrade(&inner);
            inner.runtime.spawn(async move {
                closed.await;
                if let Some(inner) = weak.upgrade()
                    && inner.state() != BridgeState::Closed
                {
                    tracing::warn!("Transport closed underneath the bridge");
                    inner.close();
                }
            });
        }

        Ok(Self { inner })
    }

    /// Start accepting inbound traffic. Returns false unless the bridge was `Created`.
    pub fn setup(&self) -> bool {
        let activated = self
            .inner
            .state
            .compare_exchange(
                BridgeState::Created.as_u8(),
                BridgeState::Active.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if activated {
            tracing::info!("Bridge active");
        } else {
            tracing::warn!(state = ?self.state(), "setup() called on a bridge that is not Created");
        }
        activated
    }

    pub fn state(&self) -> BridgeState {
        self.inner.state()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Invoke `operation` on the peer.
    ///
    /// Uses the configured default timeout, if any.
    pub async fn call(&self, operation: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.call_inner(operation, args, self.inner.config.call_timeout)
            .await
    }

    /// Invoke `operation` on the peer, failing with `Timeout` after `timeout`.
    pub async fn call_with_timeout(
        &self,
        operation: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.call_inner(operation, args, Some(timeout)).await
    }

    async fn call_inner(
        &self,
        operation: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        if operation.is_empty() || is_terminal_type(operation) {
            return Err(CallError::InvalidOperation(operation.to_string()));
        }
        if self.state() == BridgeState::Closed {
            return Err(CallError::TransportClosed);
        }

        let inner = &self.inner;
        let id = inner.ids.next_id();
        let call = inner.pending.register(id.clone()).map_err(|e| {
            tracing::error!(call_id = %id, error = %e, "Correlation id reused");
            CallError::Internal(e.to_string())
        })?;
        let _guard = CallGuard {
            pending: &inner.pending,
            id: id.clone(),
        };

        // close() may have drained the table between the state check and registration.
        if self.state() == BridgeState::Closed {
            return Err(CallError::TransportClosed);
        }

        let wire = encode(&Envelope::request(id.clone(), operation, args))
            .map_err(|e| CallError::Encode(e.to_string()))?;

        tracing::trace!(call_id = %id, %operation, "Sending request");
        match inner.transport.send(wire) {
            Ok(()) => {}
            Err(e @ TransportError::FrameTooLarge { .. }) => {
                tracing::warn!(call_id = %id, %operation, error = %e, "Request too large to send");
                return Err(CallError::Encode(e.to_string()));
            }
            Err(e) => {
                tracing::warn!(call_id = %id, %operation, error = %e, "Failed to send request");
                inner.close();
                return Err(CallError::TransportClosed);
            }
        }

        match timeout {
            None => call.await,
            Some(after) => match tokio::time::timeout(after, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(call_id = %id, %operation, timeout = ?after, "Call timed out");
                    Err(CallError::Timeout {
                        operation: operation.to_string(),
                        timeout: after,
                    })
                }
            },
        }
    }

    /// Entry point for inbound wire strings.
    ///
    /// Never blocks and never fails: malformed payloads and replies for
    /// unknown ids are logged and dropped.
    pub fn on_message(&self, payload: &str) {
        match self.state() {
            BridgeState::Active => {}
            BridgeState::Created => {
                tracing::warn!(
                    payload_len = payload.len(),
                    "Dropping message received before setup"
                );
                return;
            }
            BridgeState::Closed => {
                tracing::debug!(
                    payload_len = payload.len(),
                    "Dropping message received after close"
                );
                return;
            }
        }

        let envelope = match decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, payload_len = payload.len(), "Dropping malformed envelope");
                return;
            }
        };

        match envelope {
            Envelope::Response { id, value } => {
                tracing::trace!(call_id = %id, "Received response");
                self.inner.pending.settle(&id, Ok(value));
            }
            Envelope::ErrorResponse { id, error } => {
                tracing::trace!(call_id = %id, error_name = %error.name, "Received error response");
                self.inner.pending.settle(&id, Err(CallError::Remote(error)));
            }
            Envelope::Request {
                id,
                operation,
                args,
            } => self.spawn_dispatch(id, operation, args),
        }
    }

    fn spawn_dispatch(&self, id: CallId, operation: String, args: Vec<Value>) {
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn_on(
            async move {
                let reply = inner.dispatcher.handle(id, &operation, args).await;
                inner.transmit(&reply);
            },
            &self.inner.runtime,
        );
    }

    /// Resolves once the peer has sent `init`.
    ///
    /// Bound to the readiness signal current at the time of the call: after a
    /// `reload` the returned future only resolves if it was already ready.
    pub fn await_ready(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.ready.wait()
    }

    pub fn readiness(&self) -> Readiness {
        self.inner.ready.readiness()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_ready()
    }

    /// Number of `reload`s seen this session.
    pub fn epoch(&self) -> u64 {
        self.inner.ready.epoch()
    }

    /// Outbound calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Swap in a rebuilt registry. Dispatches already running keep the old one.
    pub fn replace_registry(&self, registry: OperationRegistry) {
        self.inner.dispatcher.replace_registry(registry);
    }

    /// Tear down the session.
    ///
    /// Every outstanding call fails with `TransportClosed`, later calls fail
    /// immediately and inbound messages are dropped. Returns how many calls
    /// were failed.
    pub fn close(&self) -> usize {
        self.inner.close()
    }

    /// Close, then wait for in-flight dispatches to send their replies.
    pub async fn shutdown(&self) {
        self.close();
        self.inner.tasks.wait().await;
        tracing::debug!("All dispatches finished");
    }

    /// Feed length-framed messages from `reader` into `on_message` until the
    /// stream ends, then close the bridge.
    pub async fn serve<R>(&self, reader: R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let codec = WireCodec::with_max_frame_length(self.inner.config.max_frame_bytes);
        let mut frames = FramedRead::new(reader, codec);
        let result = loop {
            match frames.next().await {
                Some(Ok(payload)) => self.on_message(&payload),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Inbound stream error");
                    break Err(e);
                }
                None => {
                    tracing::info!("Inbound stream closed");
                    break Ok(());
                }
            }
        };
        self.close();
        result
    }
}

impl std::fmt::Debug for BridgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeService")
            .field("state", &self.state())
            .field("readiness", &self.readiness())
            .field("epoch", &self.epoch())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}
