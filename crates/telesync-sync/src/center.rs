//! # Center Node
//!
//! Central-side composition: one broker link feeding the delivery bridge,
//! the WebSocket endpoint for real-time subscribers, and the credential
//! authority publishing over the same link.
//!
//! ```text
//!   broker ──► BrokerLink (telemetry/data, system/status/#)
//!                  │ inbound                      ▲ users/sync/{id}
//!                  ▼                              │ (retained)
//!            DeliveryBridge ──► BridgeServer   CredentialAuthority
//!                                /stream
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use telesync_db::Database;

use crate::bridge::{BridgeHandle, BridgeServer, BridgeServerHandle, DeliveryBridge};
use crate::broker::{BrokerConnector, MqttConnector};
use crate::config::SyncConfig;
use crate::credentials::CredentialAuthority;
use crate::error::SyncResult;
use crate::link::{BrokerLink, ConnectionState, FullJitterBackoff, LinkConfig, LinkHandle};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::status::{NoOpEmitter, StatusEmitter};

/// Central node. Configure, then [`start`](Self::start).
pub struct CenterNode {
    config: SyncConfig,
    db: Database,
    connector: Option<Arc<dyn BrokerConnector>>,
    emitter: Arc<dyn StatusEmitter>,
    metrics: Arc<SyncMetrics>,
}

impl CenterNode {
    /// `db` holds the authority's credential store.
    pub fn new(config: SyncConfig, db: Database) -> Self {
        CenterNode {
            config,
            db,
            connector: None,
            emitter: Arc::new(NoOpEmitter),
            metrics: Arc::new(SyncMetrics::new()),
        }
    }

    /// Overrides the MQTT connector built from `[broker]`.
    pub fn with_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn StatusEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Starts the link, the bridge, the endpoint and the credential
    /// republisher.
    pub async fn start(self) -> SyncResult<CenterHandle> {
        self.config.validate()?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(MqttConnector::from_config(&self.config, None)?),
        };

        let (link, inbound) = BrokerLink::new(connector, LinkConfig::center(&self.config))
            .with_backoff(FullJitterBackoff::from_settings(&self.config.backoff))
            .with_metrics(self.metrics.clone())
            .with_emitter(self.emitter.clone())
            .spawn();

        let (bridge, bridge_handle) =
            DeliveryBridge::new(inbound, &self.config.bridge, self.metrics.clone());
        tokio::spawn(bridge.run());

        let server = BridgeServer::new(&self.config.bridge, bridge_handle.clone())
            .start()
            .await?;

        let authority = CredentialAuthority::new(
            self.db.credentials(),
            link.clone(),
            self.config.publish.ack_timeout(),
        );
        tokio::spawn(authority.clone().republish_on_connect());

        info!(
            broker = %self.config.broker.url,
            stream = %server.local_addr(),
            "Center node started"
        );

        Ok(CenterHandle {
            link,
            bridge: bridge_handle,
            server,
            authority,
            metrics: self.metrics,
        })
    }
}

/// Handle for controlling a running [`CenterNode`].
#[derive(Clone)]
pub struct CenterHandle {
    link: LinkHandle,
    bridge: BridgeHandle,
    server: BridgeServerHandle,
    authority: CredentialAuthority,
    metrics: Arc<SyncMetrics>,
}

impl CenterHandle {
    /// Credential changes made here are published to every edge.
    pub fn authority(&self) -> &CredentialAuthority {
        &self.authority
    }

    pub fn bridge(&self) -> &BridgeHandle {
        &self.bridge
    }

    /// Address of the `/stream` endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stops accepting subscribers, closes the bridge, then the link.
    pub async fn shutdown(&self) {
        info!("Shutting down center node");
        let _ = self.server.shutdown().await;
        let _ = self.bridge.shutdown().await;
        let _ = self.link.shutdown().await;
        self.link.join().await;
        info!("Center node stopped");
    }
}
