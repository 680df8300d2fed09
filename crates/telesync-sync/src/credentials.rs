//! # Credential Sync
//!
//! Propagates version-stamped credential state from the central authority
//! to every edge client over retained `users/sync/{user_id}` messages.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  CENTER                                EDGE                             │
//! │                                                                         │
//! │  upsert / delete                                                        │
//! │     │ bump version, persist                                             │
//! │     │ (unpublished)                                                     │
//! │     ▼                                                                   │
//! │  publish_pending ──► users/sync/42 ──► CredentialSyncEngine             │
//! │     │  retained, QoS 1  (broker keeps      │ apply: write iff           │
//! │     │                    the latest)       │ received.version > local   │
//! │     ▼                                      ▼                            │
//! │  mark_published on ack                CredentialChange broadcast        │
//! │                                       + StatusEmitter                   │
//! │                                                                         │
//! │  Runs again after every (re)connect, so changes made while the          │
//! │  broker was unreachable still go out.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Merge
//! Version is the only authority. Deletion is a tombstone record at a
//! higher version, so an older update arriving after it is discarded like
//! any other stale update. Applying v3 and v4 in either order ends at v4.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use telesync_core::validation::check_credential;
use telesync_core::{CredentialFields, CredentialRecord, MergeDecision};
use telesync_db::{CredentialPage, CredentialRepository};

use crate::error::{SyncError, SyncResult};
use crate::link::{ConnectionState, LinkHandle};
use crate::metrics::SyncMetrics;
use crate::protocol::{self, InboundMessage};
use crate::status::StatusEmitter;

/// Unpublished records fetched per round.
const PUBLISH_BATCH: u32 = 256;

/// While connected, unpublished records are retried this often.
const REPUBLISH_INTERVAL: Duration = Duration::from_secs(30);

/// Buffered notifications per change subscriber.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Credential Change
// =============================================================================

/// Local notification after a merge was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum CredentialChange {
    Updated(CredentialRecord),
    Removed { user_id: i64, version: u64 },
}

impl CredentialChange {
    pub fn user_id(&self) -> i64 {
        match self {
            CredentialChange::Updated(record) => record.user_id,
            CredentialChange::Removed { user_id, .. } => *user_id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            CredentialChange::Updated(record) => record.version,
            CredentialChange::Removed { version, .. } => *version,
        }
    }
}

impl From<CredentialRecord> for CredentialChange {
    fn from(record: CredentialRecord) -> Self {
        if record.tombstone {
            CredentialChange::Removed {
                user_id: record.user_id,
                version: record.version,
            }
        } else {
            CredentialChange::Updated(record)
        }
    }
}

// =============================================================================
// Authority (central)
// =============================================================================

/// Owns credential versions and publishes them.
#[derive(Clone)]
pub struct CredentialAuthority {
    store: CredentialRepository,
    link: LinkHandle,
    ack_timeout: Duration,

    /// Serializes publication rounds.
    publishing: Arc<Mutex<()>>,
}

impl CredentialAuthority {
    pub fn new(store: CredentialRepository, link: LinkHandle, ack_timeout: Duration) -> Self {
        CredentialAuthority {
            store,
            link,
            ack_timeout,
            publishing: Arc::new(Mutex::new(())),
        }
    }

    /// Creates or changes a user; the new version is published right away
    /// if the broker is reachable.
    pub async fn upsert(
        &self,
        user_id: i64,
        fields: CredentialFields,
    ) -> SyncResult<CredentialRecord> {
        check_credential(&CredentialRecord::live(user_id, 1, fields.clone()))?;

        let record = self.store.bump(user_id, Some(fields)).await?;
        info!(user_id, version = record.version, "Credential updated");
        self.publish_logged().await;
        Ok(record)
    }

    /// Deletes a user by recording a tombstone at the next version.
    pub async fn delete(&self, user_id: i64) -> SyncResult<CredentialRecord> {
        let record = self.store.bump(user_id, None).await?;
        info!(user_id, version = record.version, "Credential deleted");
        self.publish_logged().await;
        Ok(record)
    }

    /// Publishes every record whose latest version has not been
    /// acknowledged by the broker yet. Returns how many were published.
    ///
    /// Fails with [`SyncError::NotConnected`] while the link is down; the
    /// records stay unpublished.
    pub async fn publish_pending(&self) -> SyncResult<usize> {
        let _guard = self.publishing.lock().await;
        let mut published = 0;

        loop {
            let batch = self.store.unpublished(PUBLISH_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            let more = batch.len() == PUBLISH_BATCH as usize;

            let mut waiting = Vec::with_capacity(batch.len());
            for record in batch {
                let topic = self.link.topics().credential_for(record.user_id);
                let token = self
                    .link
                    .publish(topic, protocol::encode(&record)?, true)
                    .await?;
                waiting.push((record, token));
            }

            for (record, mut token) in waiting {
                token.wait(self.ack_timeout).await?;
                self.store.mark_published(record.user_id, record.version).await?;
                debug!(user_id = record.user_id, version = record.version, "Credential published");
                published += 1;
            }

            if !more {
                break;
            }
        }

        Ok(published)
    }

    async fn publish_logged(&self) {
        match self.publish_pending().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Published credential changes"),
            Err(SyncError::NotConnected) => {
                debug!("Broker unreachable, credential changes wait for reconnect")
            }
            Err(e) => warn!(error = %e, "Credential publish failed"),
        }
    }

    /// Publishes pending changes after every (re)connect, and periodically
    /// while connected. Returns once the link has stopped.
    pub async fn republish_on_connect(self) {
        let mut states = self.link.watch_state();

        loop {
            if states
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .is_err()
            {
                break;
            }

            self.publish_logged().await;

            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(REPUBLISH_INTERVAL) => {}
            }
        }

        debug!("Credential republisher stopped");
    }
}

// =============================================================================
// Sync Engine (edge)
// =============================================================================

/// Applies credential updates received from the broker to the local store.
pub struct CredentialSyncEngine {
    store: CredentialRepository,
    emitter: Arc<dyn StatusEmitter>,
    metrics: Arc<SyncMetrics>,
    changes_tx: broadcast::Sender<CredentialChange>,
    inbound: mpsc::Receiver<InboundMessage>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Read access to local credentials for login logic, plus change
/// notifications.
#[derive(Clone)]
pub struct CredentialHandle {
    store: CredentialRepository,
    changes_tx: broadcast::Sender<CredentialChange>,
    shutdown_tx: mpsc::Sender<()>,
}

impl CredentialHandle {
    /// Live credential for `user_id`; `None` if unknown or deleted.
    pub async fn get(&self, user_id: i64) -> SyncResult<Option<CredentialRecord>> {
        Ok(self.store.get(user_id).await?)
    }

    pub async fn find_by_username(&self, username: &str) -> SyncResult<Option<CredentialRecord>> {
        Ok(self.store.find_by_username(username).await?)
    }

    pub async fn list_page(&self, page: u32, per_page: u32) -> SyncResult<CredentialPage> {
        Ok(self.store.list_page(page, per_page).await?)
    }

    /// Notifications for merges applied from now on.
    pub fn changes(&self) -> broadcast::Receiver<CredentialChange> {
        self.changes_tx.subscribe()
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Credential engine shutdown channel closed".into()))
    }
}

impl CredentialSyncEngine {
    pub fn new(
        store: CredentialRepository,
        inbound: mpsc::Receiver<InboundMessage>,
        emitter: Arc<dyn StatusEmitter>,
        metrics: Arc<SyncMetrics>,
    ) -> (Self, CredentialHandle) {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let engine = CredentialSyncEngine {
            store: store.clone(),
            emitter,
            metrics,
            changes_tx: changes_tx.clone(),
            inbound,
            shutdown_rx,
        };

        let handle = CredentialHandle {
            store,
            changes_tx,
            shutdown_tx,
        };

        (engine, handle)
    }

    /// Runs until shutdown or until the link's inbound stream ends.
    pub async fn run(mut self) {
        info!("Credential sync engine starting");

        loop {
            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(InboundMessage::Credential(record)) => match self.apply(&record).await {
                        Ok(_) => {}
                        Err(SyncError::StaleCredential { user_id, local_version, received_version }) => {
                            debug!(user_id, local_version, received_version, "Discarded stale credential");
                        }
                        Err(e @ SyncError::MalformedMessage { .. }) => {
                            self.metrics.add_malformed_messages(1);
                            warn!(user_id = record.user_id, error = %e, "Dropping invalid credential");
                        }
                        Err(e) => error!(user_id = record.user_id, error = %e, "Failed to apply credential"),
                    },
                    Some(other) => debug!(kind = ?other.kind(), "Ignoring non-credential message"),
                    None => {
                        info!("Inbound stream closed");
                        break;
                    }
                },

                _ = self.shutdown_rx.recv() => {
                    info!("Credential sync engine shutting down");
                    break;
                }
            }
        }

        info!("Credential sync engine stopped");
    }

    /// Merges one received record.
    ///
    /// ## Errors
    /// - [`SyncError::StaleCredential`] if the local version is equal or
    ///   newer; nothing was written
    pub async fn apply(&self, record: &CredentialRecord) -> SyncResult<CredentialChange> {
        match self.store.apply(record).await? {
            MergeDecision::Apply => {
                let change = CredentialChange::from(record.clone());
                self.emitter.emit_credential_change(&change);
                // No receivers is fine
                let _ = self.changes_tx.send(change.clone());
                Ok(change)
            }
            MergeDecision::Stale { local_version } => {
                self.metrics.add_stale_credentials(1);
                Err(SyncError::StaleCredential {
                    user_id: record.user_id,
                    local_version,
                    received_version: record.version,
                })
            }
        }
    }
}
