//! Operation registry - the handlers the peer can invoke by name.
//!
//! Built once by the host and handed to the bridge. Handlers are business
//! logic; the bridge only sees "arguments in, value or failure out".

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::protocol::{ERROR_RESPONSE_TYPE, ErrorInfo, RESPONSE_TYPE};

/// Marks the peer as initialized. Handled by the bridge itself.
pub const INIT_OPERATION: &str = "init";
/// Marks the peer as restarting. Handled by the bridge itself.
pub const RELOAD_OPERATION: &str = "reload";

/// Names hosts may not register.
pub const RESERVED_OPERATIONS: &[&str] = &[
    INIT_OPERATION,
    RELOAD_OPERATION,
    RESPONSE_TYPE,
    ERROR_RESPONSE_TYPE,
];

/// Failure reported by an operation, forwarded to the caller as an error-response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct HandlerError {
    /// Category, e.g. `IoError` or `InvalidArguments`.
    pub name: String,
    pub message: String,
    /// Diagnostic detail for humans.
    pub stack: String,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new("InvalidArguments", message)
    }

    /// Build from any error: the type name becomes the category and the
    /// source chain becomes the stack.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let full = std::any::type_name::<E>();
        let name = full.rsplit("::").next().unwrap_or(full);
        Self::new(name, err.to_string()).with_stack(source_chain(err))
    }
}

fn source_chain(err: &dyn std::error::Error) -> String {
    let mut lines = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    lines.join("\n")
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::new("IoError", err.to_string()).with_stack(format!("kind: {:?}", err.kind()))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("JsonError", err.to_string())
    }
}

impl From<HandlerError> for ErrorInfo {
    fn from(err: HandlerError) -> Self {
        ErrorInfo::new(err.name, err.message).with_stack(err.stack)
    }
}

/// A named capability the peer can invoke.
///
/// Operations may suspend (device I/O, UI thread hand-off); the response is
/// sent only once the returned future resolves.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError>;
}

struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        (self.0)(args).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("operation name must not be empty")]
    EmptyName,
    #[error("operation `{0}` is reserved by the bridge")]
    Reserved(String),
    #[error("operation `{0}` is already registered")]
    Duplicate(String),
}

/// Mapping from operation name to handler.
#[derive(Default, Clone)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<O: Operation>(
        &mut self,
        name: impl Into<String>,
        operation: O,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if RESERVED_OPERATIONS.contains(&name.as_str()) {
            return Err(RegistryError::Reserved(name));
        }
        if self.operations.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::trace!(operation = %name, "Registered operation");
        self.operations.insert(name, Arc::new(operation));
        Ok(())
    }

    /// Register an async closure as an operation.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(name, FnOperation(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

/// Deserialize the positional argument at `index`.
pub fn required_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, HandlerError> {
    let value = args
        .get(index)
        .ok_or_else(|| HandlerError::invalid_arguments(format!("missing argument {}", index)))?;
    serde_json::from_value(value.clone()).map_err(|e| {
        HandlerError::invalid_arguments(format!("argument {}: {}", index, e))
    })
}

/// Like `required_arg`, but a missing or null argument is `None`.
pub fn optional_arg<T: DeserializeOwned>(
    args: &[Value],
    index: usize,
) -> Result<Option<T>, HandlerError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required_arg(args, index).map(Some),
    }
}
