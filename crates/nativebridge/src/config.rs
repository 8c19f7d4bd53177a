//! Bridge configuration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bridge::codec::DEFAULT_MAX_FRAME_BYTES;

/// Host callback run when the peer announces a reload.
///
/// Receives the `reload` arguments (a web view peer passes the URL to load).
pub type ReloadHook = Arc<dyn Fn(&[Value]) + Send + Sync>;

#[derive(Clone)]
pub struct BridgeConfig {
    /// Prefix for correlation ids we generate; must differ from the peer's.
    pub id_prefix: String,
    /// Returned to the peer as the `init` acknowledgement.
    pub platform: String,
    /// Default timeout for `call`. `None` waits until reply or teardown.
    pub call_timeout: Option<Duration>,
    /// Largest inbound frame `serve` accepts.
    pub max_frame_bytes: usize,
    pub reload_hook: Option<ReloadHook>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            id_prefix: "app".to_string(),
            platform: std::env::consts::OS.to_string(),
            call_timeout: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reload_hook: None,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn with_reload_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.reload_hook = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("id_prefix", &self.id_prefix)
            .field("platform", &self.platform)
            .field("call_timeout", &self.call_timeout)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("reload_hook", &self.reload_hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.id_prefix, "app");
        assert_eq!(config.platform, std::env::consts::OS);
        assert!(config.call_timeout.is_none());
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert!(config.reload_hook.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = BridgeConfig::new()
            .with_id_prefix("native")
            .with_platform("android")
            .with_call_timeout(Duration::from_secs(30))
            .with_max_frame_bytes(1024)
            .with_reload_hook(|_| {});

        assert_eq!(config.id_prefix, "native");
        assert_eq!(config.platform, "android");
        assert_eq!(config.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_frame_bytes, 1024);
        assert!(config.reload_hook.is_some());
    }
}
