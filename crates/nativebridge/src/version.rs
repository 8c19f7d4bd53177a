//! Version information for nativebridge.

/// Crate version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported to the peer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub nativebridge: &'static str,
    /// Host platform name, as answered to `init`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Host application version (if the host sets one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            nativebridge: BRIDGE_VERSION,
            platform: None,
            host: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_host(mut self, version: impl Into<String>) -> Self {
        self.host = Some(version.into());
        self
    }
}
