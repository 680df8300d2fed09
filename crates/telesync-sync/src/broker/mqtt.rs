//! # MQTT Session (rumqttc)
//!
//! [`BrokerConnector`] over `rumqttc`. Every connect builds a fresh
//! `AsyncClient` + `EventLoop` pair; the event loop is polled by a driver
//! task that forwards what the link cares about.
//!
//! ## Ack Correlation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  session.publish()            driver task (owns EventLoop)              │
//! │  ─────────────────            ─────────────────────────────             │
//! │  id = next_id++                                                         │
//! │  issued_tx.send(id) ───────►  Outgoing::Publish(pkid)                   │
//! │  client.publish(..)             pop issued id, remember pkid → id       │
//! │                               Incoming::PubAck(pkid)                    │
//! │                                 emit SessionEvent::Acked(id)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//! Requests leave the client in order, so the n-th outgoing publish is the
//! n-th issued id.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{AckId, BrokerConnector, BrokerSession, SessionEvent};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Capacity of the client → event loop request channel.
const REQUEST_CAPACITY: usize = 64;

/// How long a clean disconnect may take before the driver is aborted.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Connector
// =============================================================================

/// Last will registered with the broker on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Opens MQTT sessions with the configured address, credentials and TLS.
#[derive(Clone)]
pub struct MqttConnector {
    options: MqttOptions,
    connect_timeout: Duration,
}

impl MqttConnector {
    /// Builds the connector from the `[broker]` section.
    ///
    /// TLS material is read here, once; a missing file is a config error.
    pub fn from_config(config: &SyncConfig, will: Option<Will>) -> SyncResult<Self> {
        let url = url::Url::parse(&config.broker.url)?;
        let host = url
            .host_str()
            .ok_or_else(|| SyncError::InvalidUrl(format!("no host in {}", config.broker.url)))?;
        let secure = url.scheme() == "mqtts";
        let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

        let mut options = MqttOptions::new(config.client_id(), host, port);
        options.set_keep_alive(config.broker.keep_alive());
        // Broker keeps QoS 1 messages for us while we are away
        options.set_clean_session(false);

        if let Some(username) = &config.broker.username {
            options.set_credentials(
                username.clone(),
                config.broker.password.clone().unwrap_or_default(),
            );
        }

        if let Some(will) = will {
            options.set_last_will(LastWill::new(
                will.topic,
                will.payload,
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        if secure {
            let ca_path = config.broker.ca_cert_path.as_ref().ok_or_else(|| {
                SyncError::InvalidConfig("mqtts:// requires broker.ca_cert_path".into())
            })?;
            let ca = read_pem(ca_path)?;

            let client_auth = match (
                &config.broker.client_cert_path,
                &config.broker.client_key_path,
            ) {
                (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
                _ => None,
            };

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        info!(host = %host, port, tls = secure, "MQTT connector configured");

        Ok(MqttConnector {
            options,
            connect_timeout: config.broker.connect_timeout(),
        })
    }
}

fn read_pem(path: &std::path::Path) -> SyncResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| SyncError::TlsError(format!("{}: {}", path.display(), e)))
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self) -> SyncResult<Box<dyn BrokerSession>> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        let connack = timeout(self.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| SyncError::Timeout(self.connect_timeout))??;

        info!(
            client_id = %self.options.client_id(),
            session_present = connack.session_present,
            "MQTT session established"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (issued_tx, issued_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(eventloop, events_tx, issued_rx));

        Ok(Box::new(MqttSession {
            client,
            events: events_rx,
            issued: issued_tx,
            backlog: VecDeque::new(),
            next_id: 1,
            request_timeout: self.connect_timeout,
            driver,
            closed: None,
        }))
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> SyncResult<ConnAck> {
    loop {
        // A refused ConnAck comes back as ConnectionError::ConnectionRefused
        if let Event::Incoming(Incoming::ConnAck(ack)) = eventloop.poll().await? {
            return Ok(ack);
        }
    }
}

// =============================================================================
// Driver Task
// =============================================================================

#[derive(Debug)]
enum DriverEvent {
    Session(SessionEvent),
    SubAck { granted: bool },
}

/// Polls the event loop until the connection fails. Never reconnects:
/// reconnecting is the link's decision.
async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<DriverEvent>,
    mut issued: mpsc::UnboundedReceiver<AckId>,
) {
    let mut outstanding: HashMap<u16, AckId> = HashMap::new();

    loop {
        let forwarded = match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                events.send(DriverEvent::Session(SessionEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                }))
            }
            Ok(Event::Incoming(Incoming::PubAck(ack))) => match outstanding.remove(&ack.pkid) {
                Some(id) => events.send(DriverEvent::Session(SessionEvent::Acked(id))),
                None => {
                    debug!(pkid = ack.pkid, "PubAck for unknown packet id");
                    Ok(())
                }
            },
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                events.send(DriverEvent::SubAck { granted })
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                if let Ok(id) = issued.try_recv() {
                    outstanding.insert(pkid, id);
                }
                Ok(())
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                let _ = events.send(DriverEvent::Session(SessionEvent::Disconnected(
                    "broker sent DISCONNECT".into(),
                )));
                break;
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "MQTT connection lost");
                let _ = events.send(DriverEvent::Session(SessionEvent::Disconnected(
                    e.to_string(),
                )));
                break;
            }
        };

        if forwarded.is_err() {
            // Session dropped
            break;
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// A live MQTT connection. Dropping it aborts the driver task.
pub struct MqttSession {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<DriverEvent>,
    issued: mpsc::UnboundedSender<AckId>,
    /// Events read while waiting for a SubAck.
    backlog: VecDeque<SessionEvent>,
    next_id: AckId,
    request_timeout: Duration,
    driver: JoinHandle<()>,
    closed: Option<String>,
}

impl MqttSession {
    fn close(&mut self, reason: impl Into<String>) -> SyncError {
        let reason = reason.into();
        self.closed = Some(reason.clone());
        SyncError::ConnectionFailed(reason)
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&mut self, filter: &str) -> SyncResult<()> {
        if self.closed.is_some() {
            return Err(SyncError::NotConnected);
        }

        timeout(
            self.request_timeout,
            self.client.subscribe(filter, QoS::AtLeastOnce),
        )
        .await
        .map_err(|_| SyncError::Timeout(self.request_timeout))??;

        let deadline = Instant::now() + self.request_timeout;
        loop {
            match timeout_at(deadline, self.events.recv()).await {
                Err(_) => return Err(SyncError::Timeout(self.request_timeout)),
                Ok(None) => return Err(self.close("driver stopped")),
                Ok(Some(DriverEvent::SubAck { granted: true })) => {
                    debug!(filter = %filter, "Subscribed");
                    return Ok(());
                }
                Ok(Some(DriverEvent::SubAck { granted: false })) => {
                    return Err(SyncError::BrokerError(format!(
                        "subscription to '{}' refused",
                        filter
                    )));
                }
                Ok(Some(DriverEvent::Session(SessionEvent::Disconnected(reason)))) => {
                    return Err(self.close(reason));
                }
                Ok(Some(DriverEvent::Session(event))) => self.backlog.push_back(event),
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> SyncResult<AckId> {
        if self.closed.is_some() {
            return Err(SyncError::NotConnected);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.issued.send(id).map_err(|_| SyncError::NotConnected)?;

        match timeout(
            self.request_timeout,
            self.client.publish(topic, QoS::AtLeastOnce, retain, payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(id),
            Ok(Err(e)) => {
                self.close(e.to_string());
                Err(e.into())
            }
            // The issued id may now be out of step with packet ids
            Err(_) => Err(self.close("publish request queue stalled")),
        }
    }

    async fn next_event(&mut self) -> SessionEvent {
        if let Some(event) = self.backlog.pop_front() {
            return event;
        }
        if let Some(reason) = &self.closed {
            return SessionEvent::Disconnected(reason.clone());
        }

        loop {
            match self.events.recv().await {
                Some(DriverEvent::Session(event)) => {
                    if let SessionEvent::Disconnected(reason) = &event {
                        self.closed = Some(reason.clone());
                    }
                    return event;
                }
                Some(DriverEvent::SubAck { .. }) => continue,
                None => {
                    self.closed = Some("driver stopped".into());
                    return SessionEvent::Disconnected("driver stopped".into());
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.closed.is_none() {
            let _ = timeout(DISCONNECT_GRACE, self.client.disconnect()).await;
            // Let the driver flush DISCONNECT so the broker skips the will
            let _ = timeout(DISCONNECT_GRACE, &mut self.driver).await;
        }
        self.closed = Some("disconnected by client".into());
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
