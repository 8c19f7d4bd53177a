//! Dispatcher - runs inbound requests against the operation registry.
//!
//! Every request produces exactly one terminal envelope: a response with the
//! handler's value, or an error-response describing why it failed. Handler
//! failures (including panics) are contained to the call that caused them.
//!
//! `init` and `reload` are bridge operations, not registry entries: they
//! drive the peer readiness signal.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use serde_json::Value;

use crate::bridge::protocol::{CallId, Envelope};
use crate::config::{BridgeConfig, ReloadHook};
use crate::ready::ReadyState;
use crate::registry::{HandlerError, INIT_OPERATION, OperationRegistry, RELOAD_OPERATION};

pub const UNSUPPORTED_OPERATION: &str = "UnsupportedOperation";
pub const HANDLER_PANIC: &str = "HandlerPanic";
/// Sent in place of a reply the transport cannot carry.
pub const REPLY_TOO_LARGE: &str = "ReplyTooLarge";

pub struct Dispatcher {
    registry: RwLock<Arc<OperationRegistry>>,
    ready: Arc<ReadyState>,
    platform: String,
    reload_hook: Option<ReloadHook>,
}

impl Dispatcher {
    pub fn new(registry: OperationRegistry, ready: Arc<ReadyState>, config: &BridgeConfig) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
            ready,
            platform: config.platform.clone(),
            reload_hook: config.reload_hook.clone(),
        }
    }

    /// Snapshot of the current registry. In-flight dispatches keep the
    /// snapshot they started with.
    pub fn registry(&self) -> Arc<OperationRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace_registry(&self, registry: OperationRegistry) {
        let mut current = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(operations = registry.len(), "Replacing operation registry");
        *current = Arc::new(registry);
    }

    /// Run one request and build its terminal envelope.
    pub async fn handle(&self, id: CallId, operation: &str, args: Vec<Value>) -> Envelope {
        tracing::trace!(call_id = %id, %operation, num_args = args.len(), "Dispatching request");
        match self.run(operation, args).await {
            Ok(value) => Envelope::response(id, value),
            Err(err) => {
                tracing::debug!(
                    call_id = %id,
                    %operation,
                    error_name = %err.name,
                    error = %err.message,
                    "Operation failed"
                );
                Envelope::error_response(id, err.into())
            }
        }
    }

    async fn run(&self, operation: &str, args: Vec<Value>) -> Result<Value, HandlerError> {
        match operation {
            INIT_OPERATION => Ok(self.init()),
            RELOAD_OPERATION => Ok(self.reload(&args)),
            _ => {
                let Some(handler) = self.registry().get(operation) else {
                    return Err(HandlerError::new(
                        UNSUPPORTED_OPERATION,
                        format!("unsupported operation: {}", operation),
                    ));
                };
                match AssertUnwindSafe(handler.invoke(args)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(%operation, %message, "Operation panicked");
                        Err(HandlerError::new(HANDLER_PANIC, message))
                    }
                }
            }
        }
    }

    fn init(&self) -> Value {
        if self.ready.mark_ready() {
            tracing::info!(epoch = self.ready.epoch(), "Peer initialized");
        } else {
            tracing::debug!(epoch = self.ready.epoch(), "Repeated init from peer");
        }
        Value::String(self.platform.clone())
    }

    fn reload(&self, args: &[Value]) -> Value {
        let epoch = self.ready.reset();
        tracing::info!(epoch, "Peer reloading, readiness reset");
        if let Some(hook) = &self.reload_hook {
            hook(args);
        }
        Value::Null
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry())
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "operation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ErrorInfo;
    use crate::registry::Operation;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Panicky;

    #[async_trait]
    impl Operation for Panicky {
        async fn invoke(&self, _args: Vec<Value>) -> Result<Value, HandlerError> {
            panic!("boom")
        }
    }

    fn dispatcher(registry: OperationRegistry) -> (Dispatcher, Arc<ReadyState>) {
        let ready = Arc::new(ReadyState::new());
        let config = BridgeConfig::new().with_platform("android");
        (Dispatcher::new(registry, Arc::clone(&ready), &config), ready)
    }

    fn error_of(env: Envelope) -> ErrorInfo {
        match env {
            Envelope::ErrorResponse { error, .. } => error,
            other => panic!("expected error-response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn success_builds_response() {
        let mut registry = OperationRegistry::new();
        registry
            .register_fn("getSize", |_| async { Ok(json!("1024")) })
            .unwrap();
        let (dispatcher, _) = dispatcher(registry);

        let env = dispatcher
            .handle(CallId::from("web0"), "getSize", vec![json!("/tmp/a")])
            .await;
        assert_eq!(env, Envelope::response(CallId::from("web0"), json!("1024")));
    }

    #[tokio::test]
    async fn unknown_operation_is_unsupported() {
        let (dispatcher, _) = dispatcher(OperationRegistry::new());

        let env = dispatcher
            .handle(CallId::from("web1"), "doesNotExist", vec![])
            .await;
        assert_eq!(env.id().as_str(), "web1");
        let error = error_of(env);
        assert_eq!(error.name, UNSUPPORTED_OPERATION);
        assert_eq!(error.message, "unsupported operation: doesNotExist");
    }

    #[tokio::test]
    async fn handler_failure_is_forwarded() {
        let mut registry = OperationRegistry::new();
        registry
            .register_fn("writeFile", |_| async {
                Err(HandlerError::new("IoError", "disk full").with_stack("at write_file"))
            })
            .unwrap();
        let (dispatcher, _) = dispatcher(registry);

        let error = error_of(dispatcher.handle(CallId::from("web2"), "writeFile", vec![]).await);
        assert_eq!(error, ErrorInfo::new("IoError", "disk full").with_stack("at write_file"));
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let mut registry = OperationRegistry::new();
        registry.register("explode", Panicky).unwrap();
        let (dispatcher, _) = dispatcher(registry);

        let error = error_of(dispatcher.handle(CallId::from("web3"), "explode", vec![]).await);
        assert_eq!(error.name, HANDLER_PANIC);
        assert_eq!(error.message, "boom");
    }

    #[tokio::test]
    async fn init_acknowledges_with_platform_and_is_idempotent() {
        let (dispatcher, ready) = dispatcher(OperationRegistry::new());

        let first = dispatcher.handle(CallId::from("web4"), "init", vec![]).await;
        assert_eq!(first, Envelope::response(CallId::from("web4"), json!("android")));
        assert!(ready.is_ready());

        let second = dispatcher.handle(CallId::from("web5"), "init", vec![]).await;
        assert_eq!(second, Envelope::response(CallId::from("web5"), json!("android")));
        assert!(ready.is_ready());
        assert_eq!(ready.epoch(), 0);
    }

    #[tokio::test]
    async fn reload_resets_readiness_and_runs_hook() {
        let ready = Arc::new(ReadyState::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let config = BridgeConfig::new().with_reload_hook(move |args| {
            sink.lock().unwrap().extend_from_slice(args);
        });
        let dispatcher = Dispatcher::new(OperationRegistry::new(), Arc::clone(&ready), &config);

        dispatcher.handle(CallId::from("web6"), "init", vec![]).await;
        let stale = ready.wait();

        let env = dispatcher
            .handle(CallId::from("web7"), "reload", vec![json!("index.html?r=1")])
            .await;
        assert_eq!(env, Envelope::response(CallId::from("web7"), Value::Null));
        assert!(!ready.is_ready());
        assert_eq!(ready.epoch(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![json!("index.html?r=1")]);

        // Settled before the reload, so the earlier future still resolves.
        tokio::time::timeout(Duration::from_millis(50), stale).await.unwrap();
    }

    #[tokio::test]
    async fn replaced_registry_is_used_for_new_dispatches() {
        let (dispatcher, _) = dispatcher(OperationRegistry::new());
        let mut registry = OperationRegistry::new();
        registry
            .register_fn("getName", |_| async { Ok(json!("a.txt")) })
            .unwrap();
        dispatcher.replace_registry(registry);

        let env = dispatcher.handle(CallId::from("web8"), "getName", vec![]).await;
        assert_eq!(env, Envelope::response(CallId::from("web8"), json!("a.txt")));
        assert!(dispatcher.registry().contains("getName"));
    }
}
