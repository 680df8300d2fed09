//! In-memory broker for tests.
//!
//! Routes publishes between sessions by topic filter, keeps retained
//! messages, fires wills on unclean drops, and lets a test hold acks,
//! refuse connects or cut every connection.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{AckId, BrokerConnector, BrokerSession, SessionEvent, Will};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

struct Slot {
    tx: mpsc::UnboundedSender<SessionEvent>,
    filters: Vec<String>,
    will: Option<Will>,
}

struct BrokerState {
    online: bool,
    refuse_next: u32,
    connects: u32,
    auto_ack: bool,
    next_session: u64,
    sessions: HashMap<u64, Slot>,
    retained: BTreeMap<String, Vec<u8>>,
    log: Vec<Published>,
    held_acks: Vec<(u64, AckId)>,
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: &[u8], retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.to_vec());
            }
        }
        for slot in self.sessions.values() {
            if slot.filters.iter().any(|f| topic_matches(f, topic)) {
                let _ = slot.tx.send(SessionEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
    }

    fn drop_session(&mut self, id: u64, fire_will: bool) {
        if let Some(slot) = self.sessions.remove(&id) {
            if fire_will {
                if let Some(will) = slot.will {
                    self.route(&will.topic, &will.payload, will.retain);
                }
            }
        }
    }
}

/// MQTT topic filter matching with `+` and `#`.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Handle to the in-memory broker.
#[derive(Clone)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        FakeBroker {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                refuse_next: 0,
                connects: 0,
                auto_ack: true,
                next_session: 1,
                sessions: HashMap::new(),
                retained: BTreeMap::new(),
                log: Vec::new(),
                held_acks: Vec::new(),
            })),
        }
    }

    pub fn connector(&self) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            state: self.state.clone(),
            will: None,
        })
    }

    pub fn connector_with_will(&self, will: Will) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            state: self.state.clone(),
            will: Some(will),
        })
    }

    /// Going offline cuts every session (wills fire) and refuses connects.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock().unwrap();
        state.online = online;
        if !online {
            let ids: Vec<u64> = state.sessions.keys().copied().collect();
            for id in ids {
                state.drop_session(id, true);
            }
        }
    }

    pub fn refuse_next(&self, n: u32) {
        self.state.lock().unwrap().refuse_next = n;
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state.lock().unwrap().auto_ack = auto_ack;
    }

    /// Delivers every held ack to its (still connected) session.
    pub fn release_acks(&self) {
        let mut state = self.state.lock().unwrap();
        let held = std::mem::take(&mut state.held_acks);
        for (session, id) in held {
            if let Some(slot) = state.sessions.get(&session) {
                let _ = slot.tx.send(SessionEvent::Acked(id));
            }
        }
    }

    /// Cuts every connection without taking the broker offline.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            state.drop_session(id, true);
        }
    }

    /// Publishes as an outside client.
    pub fn inject(&self, topic: &str, payload: &[u8], retain: bool) {
        self.state.lock().unwrap().route(topic, payload, retain);
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().retained.get(topic).cloned()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut all: Vec<String> = state
            .sessions
            .values()
            .flat_map(|s| s.filters.iter().cloned())
            .collect();
        all.sort();
        all
    }
}

pub(crate) struct FakeConnector {
    state: Arc<Mutex<BrokerState>>,
    will: Option<Will>,
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(&self) -> SyncResult<Box<dyn BrokerSession>> {
        let mut state = self.state.lock().unwrap();
        if !state.online {
            return Err(SyncError::ConnectionFailed("broker unreachable".into()));
        }
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(SyncError::ConnectionFailed("refused".into()));
        }

        state.connects += 1;
        let id = state.next_session;
        state.next_session += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            Slot {
                tx,
                filters: Vec::new(),
                will: self.will.clone(),
            },
        );

        Ok(Box::new(FakeSession {
            id,
            state: self.state.clone(),
            rx,
            next_ack: 1,
        }))
    }
}

pub(crate) struct FakeSession {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    next_ack: AckId,
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn subscribe(&mut self, filter: &str) -> SyncResult<()> {
        let mut state = self.state.lock().unwrap();
        let retained: Vec<(String, Vec<u8>)> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();

        let slot = state
            .sessions
            .get_mut(&self.id)
            .ok_or(SyncError::NotConnected)?;
        slot.filters.push(filter.to_string());
        for (topic, payload) in retained {
            let _ = slot.tx.send(SessionEvent::Message { topic, payload });
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> SyncResult<AckId> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.contains_key(&self.id) {
            return Err(SyncError::NotConnected);
        }

        let id = self.next_ack;
        self.next_ack += 1;

        state.log.push(Published {
            topic: topic.to_string(),
            payload: payload.clone(),
            retain,
        });
        state.route(topic, &payload, retain);

        if state.auto_ack {
            if let Some(slot) = state.sessions.get(&self.id) {
                let _ = slot.tx.send(SessionEvent::Acked(id));
            }
        } else {
            state.held_acks.push((self.id, id));
        }
        Ok(id)
    }

    async fn next_event(&mut self) -> SessionEvent {
        match self.rx.recv().await {
            Some(event) => event,
            None => SessionEvent::Disconnected("connection dropped".into()),
        }
    }

    async fn disconnect(&mut self) {
        self.state.lock().unwrap().drop_session(self.id, false);
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.drop_session(self.id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("users/sync/#", "users/sync"));
        assert!(topic_matches("users/sync/#", "users/sync/7"));
        assert!(topic_matches("system/+/D1", "system/status/D1"));
        assert!(!topic_matches("telemetry/data", "telemetry/data/x"));
        assert!(!topic_matches("users/sync/#", "users/other"));
    }

    #[tokio::test]
    async fn test_routes_and_retains() {
        let broker = FakeBroker::new();
        let mut a = broker.connector().connect().await.unwrap();
        let mut b = broker.connector().connect().await.unwrap();

        a.publish("users/sync/1", b"v1".to_vec(), true).await.unwrap();
        assert_eq!(a.next_event().await, SessionEvent::Acked(1));

        b.subscribe("users/sync/#").await.unwrap();
        assert_eq!(
            b.next_event().await,
            SessionEvent::Message {
                topic: "users/sync/1".into(),
                payload: b"v1".to_vec()
            }
        );

        broker.drop_connections();
        assert!(matches!(a.next_event().await, SessionEvent::Disconnected(_)));
        assert!(a.publish("x", vec![], false).await.is_err());
    }
}
