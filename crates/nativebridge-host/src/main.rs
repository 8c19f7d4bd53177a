//! nativebridge-host: serves a bridge endpoint over stdin/stdout.
//!
//! Frames on both streams are length-prefixed JSON envelopes. Logs go to
//! stderr so they never interleave with the wire.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use nativebridge::{
    BridgeConfig, BridgeService, OperationRegistry, StreamTransport, VersionInfo,
};

/// Initialize tracing with BRIDGE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("BRIDGE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "nativebridge={level},nativebridge_host={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Build the bridge config from `BRIDGE_*` variables, read through `lookup`.
fn config_from<F>(lookup: F) -> Result<BridgeConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = BridgeConfig::new();
    if let Some(prefix) = lookup("BRIDGE_ID_PREFIX")
        && !prefix.is_empty()
    {
        config = config.with_id_prefix(prefix);
    }
    if let Some(platform) = lookup("BRIDGE_PLATFORM")
        && !platform.is_empty()
    {
        config = config.with_platform(platform);
    }
    if let Some(raw) = lookup("BRIDGE_CALL_TIMEOUT_MS") {
        let ms: u64 = raw
            .trim()
            .parse()
            .with_context(|| format!("BRIDGE_CALL_TIMEOUT_MS is not a number: {raw:?}"))?;
        if ms > 0 {
            config = config.with_call_timeout(Duration::from_millis(ms));
        }
    }
    if let Some(raw) = lookup("BRIDGE_MAX_FRAME_BYTES") {
        let max: usize = raw
            .trim()
            .parse()
            .with_context(|| format!("BRIDGE_MAX_FRAME_BYTES is not a number: {raw:?}"))?;
        anyhow::ensure!(max > 0, "BRIDGE_MAX_FRAME_BYTES must be positive");
        config = config.with_max_frame_bytes(max);
    }
    Ok(config)
}

fn host_operations(platform: &str) -> Result<OperationRegistry> {
    let mut registry = OperationRegistry::new();
    registry.register_fn("echo", |args| async move { Ok(Value::Array(args)) })?;

    let version = VersionInfo::new()
        .with_platform(platform)
        .with_host(env!("CARGO_PKG_VERSION"));
    let version = serde_json::to_value(version).context("failed to serialize version info")?;
    registry.register_fn("version", move |_| {
        let version = version.clone();
        async move { Ok(version) }
    })?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = config_from(|key| std::env::var(key).ok())?;
    let registry = host_operations(&config.platform)?;
    tracing::info!(
        version = nativebridge::BRIDGE_VERSION,
        config = ?config,
        "Starting bridge host"
    );

    let (transport, writer) =
        StreamTransport::spawn_with_max_frame(tokio::io::stdout(), config.max_frame_bytes)?;
    let bridge = BridgeService::new(config, registry, transport)?;
    bridge.setup();

    let ready = bridge.await_ready();
    tokio::spawn(async move {
        ready.await;
        tracing::info!("Peer ready");
    });

    let served = bridge.serve(tokio::io::stdin()).await;
    bridge.shutdown().await;
    drop(bridge);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Writer stopped with an error"),
        Err(e) => tracing::warn!(error = %e, "Writer task failed"),
    }

    served.context("inbound stream failed")?;
    tracing::info!("Bridge host exiting");
    Ok(())
}
