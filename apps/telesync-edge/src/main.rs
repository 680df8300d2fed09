//! # Telesync Edge
//!
//! Edge client: buffers readings durably and syncs them whenever the
//! broker is reachable.
//!
//! ## Input
//! One JSON object per stdin line:
//! ```text
//! {"device_id": "pump-1", "value": 3.2}
//! {"device_id": "pump-1", "value": 3, "data_type": "float"}
//! {"device_id": "door-4", "value": true}
//! ```
//! Closing stdin stops capture, not sync; the process runs until SIGINT or
//! SIGTERM.
//!
//! ## Usage
//! ```text
//! telesync-edge [config.toml]
//! RUST_LOG=debug TELESYNC_BROKER_URL=mqtt://broker:1883 telesync-edge
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telesync_core::{DataType, TelemetryValue};
use telesync_db::{Database, DbConfig};
use telesync_sync::{LoggingEmitter, SyncAgentBuilder, SyncAgentHandle, SyncConfig};

/// One capture request read from stdin.
#[derive(Debug, Deserialize)]
struct CaptureLine {
    device_id: String,
    value: TelemetryValue,
    #[serde(default)]
    data_type: Option<DataType>,
}

impl CaptureLine {
    fn parse(line: &str) -> anyhow::Result<Self> {
        let mut capture: CaptureLine = serde_json::from_str(line)?;
        if let Some(declared) = capture.data_type {
            match capture.value.conform(declared) {
                Some(value) => capture.value = value,
                None => bail!("value {:?} is not a valid {}", capture.value, declared),
            }
        }
        Ok(capture)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path).context("Failed to load configuration")?;

    let buffer_path = config.buffer_path()?;
    if let Some(parent) = buffer_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = Database::new(DbConfig::new(&buffer_path).buffer_capacity(config.buffer.capacity))
        .await
        .with_context(|| format!("Failed to open buffer at {}", buffer_path.display()))?;
    info!(path = %buffer_path.display(), capacity = config.buffer.capacity, "Buffer opened");

    let agent = SyncAgentBuilder::new(config)
        .with_database(db)
        .with_emitter(Arc::new(LoggingEmitter))
        .build()?
        .start()
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => capture_line(&agent, &line).await,
                Ok(None) => {
                    info!("stdin closed, capture stopped; still syncing");
                    stdin_open = false;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },

            _ = &mut shutdown => break,
        }
    }

    agent.shutdown().await;
    let status = agent.status().await;
    info!(pending = status.pending, evicted = status.evicted_total, "Edge client stopped");
    Ok(())
}

async fn capture_line(agent: &SyncAgentHandle, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let capture = match CaptureLine::parse(line) {
        Ok(capture) => capture,
        Err(e) => {
            warn!(error = %e, "Ignoring invalid capture line");
            return;
        }
    };
    if let Err(e) = agent.capture(&capture.device_id, capture.value).await {
        warn!(device_id = %capture.device_id, error = %e, "Capture failed");
    }
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=telesync_sync=trace` - Trace the sync engine only
/// - Default: INFO level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,telesync=debug,sqlx=warn,rumqttc=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capture_line() {
        let capture = CaptureLine::parse(r#"{"device_id":"pump-1","value":3.5}"#).unwrap();
        assert_eq!(capture.device_id, "pump-1");
        assert_eq!(capture.value, TelemetryValue::Float(3.5));

        let capture = CaptureLine::parse(r#"{"device_id":"door-4","value":true}"#).unwrap();
        assert_eq!(capture.value, TelemetryValue::Bool(true));
    }

    #[test]
    fn test_declared_float_widens_integer() {
        let capture =
            CaptureLine::parse(r#"{"device_id":"pump-1","value":3,"data_type":"float"}"#).unwrap();
        assert_eq!(capture.value, TelemetryValue::Float(3.0));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        assert!(CaptureLine::parse(r#"{"device_id":"d","value":true,"data_type":"int"}"#).is_err());
        assert!(CaptureLine::parse(r#"{"device_id":"d"}"#).is_err());
        assert!(CaptureLine::parse("not json").is_err());
    }
}
