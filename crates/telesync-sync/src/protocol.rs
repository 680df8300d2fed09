//! # Wire Protocol
//!
//! Broker topics, payload decoding at the broker boundary, and the frames
//! exchanged with real-time bridge subscribers.
//!
//! ## Topics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Broker Topics                                   │
//! │                                                                         │
//! │  {prefix}/telemetry/data            edge ───► center                    │
//! │      TelemetryEvent                 QoS 1, not retained                 │
//! │                                                                         │
//! │  {prefix}/users/sync/{user_id}      center ───► edge                    │
//! │      CredentialRecord               QoS 1, RETAINED (latest per user)   │
//! │                                                                         │
//! │  {prefix}/system/status/{source}    both directions                     │
//! │      SystemStatus                   QoS 1, retained, also the will      │
//! │                                                                         │
//! │  Subscriptions use `{base}/#`, which also matches the bare base topic.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Bridge Frames (JSON text, adjacently tagged)
//! ```json
//! { "type": "Attach", "payload": { "scope": "all" } }
//! { "type": "Telemetry", "payload": { "event_id": "...", "sequence": 1, ... } }
//! { "type": "Lagged", "payload": { "dropped": 12 } }
//! ```
//!
//! Inbound payloads are decoded exactly once, here, into [`InboundMessage`].
//! Nothing downstream looks at topic strings again.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use telesync_core::validation::{check_credential, normalize_event};
use telesync_core::{CredentialRecord, SystemStatus, TelemetryEvent};

use crate::error::{SyncError, SyncResult};

pub const TELEMETRY_TOPIC: &str = "telemetry/data";
pub const CREDENTIAL_TOPIC: &str = "users/sync";
pub const STATUS_TOPIC: &str = "system/status";

// =============================================================================
// Topics
// =============================================================================

/// The kind of message a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Telemetry,
    CredentialSync,
    SystemStatus,
}

impl TopicKind {
    pub fn base(&self) -> &'static str {
        match self {
            TopicKind::Telemetry => TELEMETRY_TOPIC,
            TopicKind::CredentialSync => CREDENTIAL_TOPIC,
            TopicKind::SystemStatus => STATUS_TOPIC,
        }
    }
}

impl std::fmt::Display for TopicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.base())
    }
}

/// Topic names under a configured prefix.
///
/// ## Example
/// ```rust
/// use telesync_sync::protocol::{Topics, TopicKind};
///
/// let topics = Topics::new("site-a");
/// assert_eq!(topics.telemetry(), "site-a/telemetry/data");
/// assert_eq!(topics.parse("site-a/users/sync/7"), Some(TopicKind::CredentialSync));
/// assert_eq!(topics.parse("site-b/users/sync/7"), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Topics {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn full(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    /// Where edge devices publish telemetry.
    pub fn telemetry(&self) -> String {
        self.full(TELEMETRY_TOPIC)
    }

    /// Retained credential topic of one user.
    pub fn credential_for(&self, user_id: i64) -> String {
        self.full(&format!("{CREDENTIAL_TOPIC}/{user_id}"))
    }

    /// Retained status topic of one source.
    pub fn status_for(&self, source_id: &str) -> String {
        self.full(&format!("{STATUS_TOPIC}/{source_id}"))
    }

    /// Subscription filter for every topic of `kind`.
    pub fn filter(&self, kind: TopicKind) -> String {
        self.full(&format!("{}/#", kind.base()))
    }

    /// Resolves a concrete topic to its kind. `None` for foreign topics.
    pub fn parse(&self, topic: &str) -> Option<TopicKind> {
        self.split(topic).map(|(kind, _)| kind)
    }

    /// Resolves a topic to its kind and the remainder after the base.
    fn split<'a>(&self, topic: &'a str) -> Option<(TopicKind, Option<&'a str>)> {
        let path = if self.prefix.is_empty() {
            topic
        } else {
            topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?
        };

        [
            TopicKind::Telemetry,
            TopicKind::CredentialSync,
            TopicKind::SystemStatus,
        ]
        .into_iter()
        .find_map(|kind| match path.strip_prefix(kind.base())? {
            "" => Some((kind, None)),
            rest => rest
                .strip_prefix('/')
                .filter(|r| !r.is_empty())
                .map(|r| (kind, Some(r))),
        })
    }
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// A broker message decoded and validated at the broker boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Telemetry(TelemetryEvent),
    Credential(CredentialRecord),
    Status(SystemStatus),
}

impl InboundMessage {
    pub fn kind(&self) -> TopicKind {
        match self {
            InboundMessage::Telemetry(_) => TopicKind::Telemetry,
            InboundMessage::Credential(_) => TopicKind::CredentialSync,
            InboundMessage::Status(_) => TopicKind::SystemStatus,
        }
    }
}

/// Decodes one broker message.
///
/// ## Errors
/// - [`SyncError::UnknownTopic`] for topics outside the prefix or topic set
/// - [`SyncError::MalformedMessage`] when the payload fails schema checks
pub fn decode(topics: &Topics, topic: &str, payload: &[u8]) -> SyncResult<InboundMessage> {
    let (kind, suffix) = topics
        .split(topic)
        .ok_or_else(|| SyncError::UnknownTopic(topic.to_string()))?;

    match kind {
        TopicKind::Telemetry => {
            let event: TelemetryEvent =
                serde_json::from_slice(payload).map_err(|e| SyncError::malformed(topic, e))?;
            let event = normalize_event(event).map_err(|e| SyncError::malformed(topic, e))?;
            Ok(InboundMessage::Telemetry(event))
        }
        TopicKind::CredentialSync => {
            let record: CredentialRecord =
                serde_json::from_slice(payload).map_err(|e| SyncError::malformed(topic, e))?;
            if let Some(suffix) = suffix {
                if suffix != record.user_id.to_string() {
                    return Err(SyncError::malformed(
                        topic,
                        format!("payload user_id {} does not match topic", record.user_id),
                    ));
                }
            }
            check_credential(&record).map_err(|e| SyncError::malformed(topic, e))?;
            Ok(InboundMessage::Credential(record))
        }
        TopicKind::SystemStatus => {
            let status: SystemStatus =
                serde_json::from_slice(payload).map_err(|e| SyncError::malformed(topic, e))?;
            if status.source_id.trim().is_empty() {
                return Err(SyncError::malformed(topic, "source_id is required"));
            }
            Ok(InboundMessage::Status(status))
        }
    }
}

/// Serializes an outbound payload.
pub fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

// =============================================================================
// Bridge Frames
// =============================================================================

/// Which devices a real-time subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionScope {
    /// Every device.
    #[default]
    All,

    /// Only the listed devices.
    Devices(BTreeSet<String>),
}

impl SubscriptionScope {
    pub fn devices<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SubscriptionScope::Devices(ids.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, device_id: &str) -> bool {
        match self {
            SubscriptionScope::All => true,
            SubscriptionScope::Devices(ids) => ids.contains(device_id),
        }
    }
}

/// Frames a subscriber sends to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    /// Must be the first frame on a new connection.
    Attach { scope: SubscriptionScope },
}

/// Frames the bridge sends to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BridgeEvent {
    /// A deduplicated telemetry event.
    Telemetry(TelemetryEvent),

    /// A source connected or disconnected.
    Presence(SystemStatus),

    /// This subscriber's queue overflowed and dropped `dropped` events.
    Lagged { dropped: u64 },
}

impl BridgeEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            BridgeEvent::Telemetry(_) => "Telemetry",
            BridgeEvent::Presence(_) => "Presence",
            BridgeEvent::Lagged { .. } => "Lagged",
        }
    }

    /// The device this event concerns, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            BridgeEvent::Telemetry(event) => Some(&event.device_id),
            BridgeEvent::Presence(status) => Some(&status.source_id),
            BridgeEvent::Lagged { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
