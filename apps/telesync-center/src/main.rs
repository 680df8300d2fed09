//! # Telesync Center
//!
//! Central node: fans broker telemetry out to WebSocket subscribers on
//! `/stream` and acts as the credential authority.
//!
//! ## Input
//! Credential changes from the system of record, one JSON object per
//! stdin line:
//! ```text
//! {"op": "upsert", "user_id": 42, "fields": {"username": "ana", "role": "admin",
//!                                            "active": true, "password_hash": "..."}}
//! {"op": "delete", "user_id": 42}
//! ```
//! The credential store lives in the `[buffer] path` database.
//!
//! ## Usage
//! ```text
//! telesync-center [config.toml]
//! ```

use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telesync_core::CredentialFields;
use telesync_db::{Database, DbConfig};
use telesync_sync::{CenterHandle, CenterNode, LoggingEmitter, SyncConfig};

/// One credential change read from stdin.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum CredentialCommand {
    Upsert {
        user_id: i64,
        fields: CredentialFields,
    },
    Delete {
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path).context("Failed to load configuration")?;

    let db_path = config.buffer_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = Database::new(DbConfig::new(&db_path))
        .await
        .with_context(|| format!("Failed to open credential store at {}", db_path.display()))?;

    let center = CenterNode::new(config, db)
        .with_emitter(std::sync::Arc::new(LoggingEmitter))
        .start()
        .await?;
    info!(addr = %center.local_addr(), "Accepting subscribers on /stream");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => apply_line(&center, &line).await,
                Ok(None) => {
                    info!("stdin closed, no further credential changes");
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

    center.shutdown().await;
    let metrics = center.metrics();
    info!(
        duplicates_dropped = metrics.duplicates_dropped,
        subscriber_drops = metrics.subscriber_drops,
        "Center node stopped"
    );
    Ok(())
}

async fn apply_line(center: &CenterHandle, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let command: CredentialCommand = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "Ignoring invalid credential line");
            return;
        }
    };

    let result = match command {
        CredentialCommand::Upsert { user_id, fields } => {
            center.authority().upsert(user_id, fields).await
        }
        CredentialCommand::Delete { user_id } => center.authority().delete(user_id).await,
    };

    match result {
        Ok(record) => info!(user_id = record.user_id, version = record.version, "Credential recorded"),
        Err(e) => warn!(error = %e, "Credential change rejected"),
    }
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - Default: INFO level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,telesync=debug,sqlx=warn,rumqttc=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
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
    use telesync_core::Role;

    #[test]
    fn test_parse_commands() {
        let upsert: CredentialCommand = serde_json::from_str(
            r#"{"op":"upsert","user_id":42,"fields":{"username":"ana","active":true,"password_hash":"x"}}"#,
        )
        .unwrap();
        assert_eq!(
            upsert,
            CredentialCommand::Upsert {
                user_id: 42,
                fields: CredentialFields {
                    username: "ana".into(),
                    role: Role::User,
                    active: true,
                    password_hash: "x".into(),
                },
            }
        );

        let delete: CredentialCommand =
            serde_json::from_str(r#"{"op":"delete","user_id":42}"#).unwrap();
        assert_eq!(delete, CredentialCommand::Delete { user_id: 42 });

        assert!(serde_json::from_str::<CredentialCommand>(r#"{"op":"rename","user_id":1}"#).is_err());
    }
}
