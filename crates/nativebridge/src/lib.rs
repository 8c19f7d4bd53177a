//! nativebridge: correlation-based async request/response over one-way string channels.

mod config;
mod dispatcher;
mod error;
mod ready;
mod registry;
mod version;

pub mod bridge;
pub mod pending;
pub mod service;

pub use bridge::codec::{
    CodecError, DEFAULT_MAX_FRAME_BYTES, DecodeError, WireCodec, decode, encode,
};
pub use bridge::protocol::{CallId, Envelope, ErrorInfo};
pub use bridge::transport::{
    ChannelTransport, ScriptTransport, StreamTransport, Transport, TransportError,
};
pub use config::{BridgeConfig, ReloadHook};
pub use dispatcher::{HANDLER_PANIC, REPLY_TOO_LARGE, UNSUPPORTED_OPERATION};
pub use error::{BridgeError, CallError};
pub use ready::Readiness;
pub use registry::{
    HandlerError, INIT_OPERATION, Operation, OperationRegistry, RELOAD_OPERATION, RegistryError,
    optional_arg, required_arg,
};
pub use service::{BridgeService, BridgeState};
pub use version::{BRIDGE_VERSION, VersionInfo};
