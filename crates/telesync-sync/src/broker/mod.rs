//! # Broker Session Seam
//!
//! The broker link never talks to an MQTT client directly. It asks a
//! [`BrokerConnector`] for a fresh [`BrokerSession`] on every (re)connect
//! and drives that session from its own task.
//!
//! ## Session Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       One Broker Session                                │
//! │                                                                         │
//! │  connector.connect()      authenticated, ConnAck received               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  session.subscribe(f)     waits for SubAck (one per filter)             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────────────────────────────────────────┐                       │
//! │  │ session.publish(..) ──► AckId                 │                      │
//! │  │ session.next_event() ──► Message | Acked(id)  │  until Disconnected  │
//! │  └──────────────────────────────────────────────┘                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  session.disconnect()     or dropped after Disconnected                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A session is single-owner (`&mut self`), so the order in which
//! publishes are issued is the order in which the broker sees them.

use async_trait::async_trait;

use crate::error::SyncResult;

mod mqtt;

#[cfg(test)]
pub(crate) mod testing;

pub use mqtt::{MqttConnector, MqttSession, Will};

/// Session-local publish identifier, resolved by [`SessionEvent::Acked`].
pub type AckId = u64;

/// Something that happened on a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A message on one of the subscribed topics.
    Message { topic: String, payload: Vec<u8> },

    /// The broker acknowledged the publish with this id.
    Acked(AckId),

    /// The connection is gone; the session is unusable.
    Disconnected(String),
}

/// Opens authenticated broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connects and authenticates. Returns once the broker accepted the
    /// session or fails with a transport error.
    async fn connect(&self) -> SyncResult<Box<dyn BrokerSession>>;
}

/// One live broker connection.
#[async_trait]
pub trait BrokerSession: Send {
    /// Subscribes to `filter` (QoS 1) and waits for the broker to confirm.
    async fn subscribe(&mut self, filter: &str) -> SyncResult<()>;

    /// Publishes at QoS 1. Returns once the request is handed to the
    /// connection; the broker's acknowledgment arrives later as
    /// [`SessionEvent::Acked`].
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> SyncResult<AckId>;

    /// Next session event. Returns [`SessionEvent::Disconnected`] forever
    /// once the connection is lost.
    async fn next_event(&mut self) -> SessionEvent;

    /// Closes the connection cleanly (no last will).
    async fn disconnect(&mut self);
}
