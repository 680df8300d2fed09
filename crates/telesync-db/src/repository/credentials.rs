//! # Credential Repository
//!
//! Version-stamped credential state, used on both sides of the broker.
//!
//! ```text
//! ┌──────────────────────────────┐          ┌──────────────────────────────┐
//! │ AUTHORITY                    │          │ EDGE                         │
//! │                              │  broker  │                              │
//! │ bump(user, fields|tombstone) │ ───────► │ apply(record)                │
//! │ unpublished() / mark_pub..() │          │   version > local ? write    │
//! │                              │          │ get / find_by_username /     │
//! │                              │          │ list_page (auth reads)       │
//! └──────────────────────────────┘          └──────────────────────────────┘
//! ```
//!
//! Deleted users stay as tombstone rows so a delayed older update still
//! loses against the deletion version. Read paths never return them.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{DbError, DbResult};
use telesync_core::merge::{merge_decision, MergeDecision};
use telesync_core::validation::{validate_credential, MAX_STORED_COUNTER};
use telesync_core::{CredentialFields, CredentialRecord, Role, ValidationError};

const TABLE: &str = "credentials";

const SELECT_COLUMNS: &str =
    "user_id, version, username, role, active, password_hash, deleted, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    user_id: i64,
    version: i64,
    username: Option<String>,
    role: Option<Role>,
    active: Option<bool>,
    password_hash: Option<String>,
    deleted: bool,
    updated_at: String,
}

impl TryFrom<CredentialRow> for CredentialRecord {
    type Error = DbError;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
            .map_err(|e| DbError::corrupt(TABLE, e))?
            .with_timezone(&Utc);
        let version = u64::try_from(row.version).map_err(|e| DbError::corrupt(TABLE, e))?;

        if row.deleted {
            let mut record = CredentialRecord::tombstone(row.user_id, version);
            record.updated_at = updated_at;
            return Ok(record);
        }

        let (Some(username), Some(active), Some(password_hash)) =
            (row.username, row.active, row.password_hash)
        else {
            return Err(DbError::corrupt(
                TABLE,
                format!("live user {} is missing fields", row.user_id),
            ));
        };

        Ok(CredentialRecord {
            user_id: row.user_id,
            version,
            fields: Some(CredentialFields {
                username,
                role: row.role.unwrap_or_default(),
                active,
                password_hash,
            }),
            tombstone: false,
            updated_at,
        })
    }
}

/// One page of live credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPage {
    pub items: Vec<CredentialRecord>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl CredentialPage {
    pub fn pages(&self) -> u64 {
        if self.per_page == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.per_page))
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for credential records.
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pool: SqlitePool,
    lock: Arc<RwLock<()>>,
}

impl CredentialRepository {
    /// Creates a new CredentialRepository. Use [`crate::Database::credentials`].
    pub(crate) fn new(pool: SqlitePool, lock: Arc<RwLock<()>>) -> Self {
        CredentialRepository { pool, lock }
    }

    // =========================================================================
    // Edge: merge
    // =========================================================================

    /// Merges a record received from the authority.
    ///
    /// Writes only if `record.version` is strictly greater than the local
    /// version (tombstones included). Returns the decision taken.
    pub async fn apply(&self, record: &CredentialRecord) -> DbResult<MergeDecision> {
        validate_credential(record)?;
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;

        let local = local_version(&mut tx, record.user_id).await?;
        let decision = merge_decision(local, record);

        if decision.is_apply() {
            // Edge copies arrive already published
            upsert(&mut tx, record, record.version).await?;
            tx.commit().await?;
            debug!(
                user_id = record.user_id,
                version = record.version,
                tombstone = record.tombstone,
                "Applied credential update"
            );
        }

        Ok(decision)
    }

    // =========================================================================
    // Authority: version bumps and publication tracking
    // =========================================================================

    /// Records a change at the authority: bumps the version and persists.
    ///
    /// `fields = None` records a deletion (tombstone). The new record is
    /// unpublished until [`mark_published`](Self::mark_published).
    pub async fn bump(
        &self,
        user_id: i64,
        fields: Option<CredentialFields>,
    ) -> DbResult<CredentialRecord> {
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;

        let version = local_version(&mut tx, user_id).await?.unwrap_or(0) + 1;
        let record = match fields {
            Some(fields) => CredentialRecord::live(user_id, version, fields),
            None => CredentialRecord::tombstone(user_id, version),
        };

        let published: i64 =
            sqlx::query_scalar("SELECT published_version FROM credentials WHERE user_id = ?1")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?
                .unwrap_or(0);

        upsert(&mut tx, &record, published as u64).await?;
        tx.commit().await?;

        debug!(user_id, version, tombstone = record.tombstone, "Credential changed");
        Ok(record)
    }

    /// Records whose latest version has not been published yet, by user id.
    pub async fn unpublished(&self, limit: u32) -> DbResult<Vec<CredentialRecord>> {
        let _guard = self.lock.read().await;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM credentials \
             WHERE published_version < version ORDER BY user_id LIMIT ?1"
        );
        sqlx::query_as::<_, CredentialRow>(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CredentialRecord::try_from)
            .collect()
    }

    /// Marks `version` of `user_id` as published. Never moves backwards.
    pub async fn mark_published(&self, user_id: i64, version: u64) -> DbResult<()> {
        let _guard = self.lock.write().await;
        sqlx::query(
            "UPDATE credentials SET published_version = MAX(published_version, ?2) \
             WHERE user_id = ?1",
        )
        .bind(user_id)
        .bind(stored_version("version", version)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Reads (authentication logic)
    // =========================================================================

    /// Live credential for `user_id`; `None` if unknown or deleted.
    pub async fn get(&self, user_id: i64) -> DbResult<Option<CredentialRecord>> {
        let _guard = self.lock.read().await;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM credentials WHERE user_id = ?1 AND deleted = 0");
        sqlx::query_as::<_, CredentialRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(CredentialRecord::try_from)
            .transpose()
    }

    /// Current version for `user_id`, counting tombstones.
    pub async fn version_of(&self, user_id: i64) -> DbResult<Option<u64>> {
        let _guard = self.lock.read().await;
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM credentials WHERE user_id = ?1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(|v| v as u64))
    }

    /// Live credential by username, for login lookups.
    ///
    /// If a rename is still propagating and two users briefly share a name,
    /// the most recently updated one wins.
    pub async fn find_by_username(&self, username: &str) -> DbResult<Option<CredentialRecord>> {
        let _guard = self.lock.read().await;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM credentials \
             WHERE username = ?1 AND deleted = 0 \
             ORDER BY updated_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, CredentialRow>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .map(CredentialRecord::try_from)
            .transpose()
    }

    /// Live credentials, paginated by user id. `page` starts at 1.
    pub async fn list_page(&self, page: u32, per_page: u32) -> DbResult<CredentialPage> {
        let _guard = self.lock.read().await;
        let page = page.max(1);
        let per_page = per_page.clamp(1, 500);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM credentials WHERE deleted = 0")
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM credentials WHERE deleted = 0 \
             ORDER BY user_id LIMIT ?1 OFFSET ?2"
        );
        let items = sqlx::query_as::<_, CredentialRow>(&sql)
            .bind(i64::from(per_page))
            .bind(i64::from(page - 1) * i64::from(per_page))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CredentialRecord::try_from)
            .collect::<DbResult<Vec<_>>>()?;

        Ok(CredentialPage {
            items,
            page,
            per_page,
            total: total as u64,
        })
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

async fn local_version(tx: &mut Transaction<'_, Sqlite>, user_id: i64) -> DbResult<Option<u64>> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM credentials WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(version.map(|v| v as u64))
}

fn stored_version(field: &str, version: u64) -> DbResult<i64> {
    i64::try_from(version).map_err(|_| {
        DbError::InvalidRecord(ValidationError::TooLarge {
            field: field.to_string(),
            max: MAX_STORED_COUNTER,
        })
    })
}

async fn upsert(
    tx: &mut Transaction<'_, Sqlite>,
    record: &CredentialRecord,
    published_version: u64,
) -> DbResult<()> {
    let fields = record.fields.as_ref().filter(|_| !record.tombstone);

    sqlx::query(
        r#"
        INSERT INTO credentials (
            user_id, version, username, role, active, password_hash,
            deleted, updated_at, published_version
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT (user_id) DO UPDATE SET
            version = excluded.version,
            username = excluded.username,
            role = excluded.role,
            active = excluded.active,
            password_hash = excluded.password_hash,
            deleted = excluded.deleted,
            updated_at = excluded.updated_at,
            published_version = excluded.published_version
        "#,
    )
    .bind(record.user_id)
    .bind(stored_version("version", record.version)?)
    .bind(fields.map(|f| f.username.clone()))
    .bind(fields.map(|f| f.role))
    .bind(fields.map(|f| f.active))
    .bind(fields.map(|f| f.password_hash.clone()))
    .bind(record.tombstone)
    .bind(record.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true))
    .bind(stored_version("published_version", published_version)?)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    async fn repo() -> CredentialRepository {
        Database::new(DbConfig::in_memory())
            .await
            .unwrap()
            .credentials()
    }

    fn fields(username: &str, active: bool) -> CredentialFields {
        CredentialFields {
            username: username.to_string(),
            role: Role::User,
            active,
            password_hash: format!("hash-{username}"),
        }
    }

    #[tokio::test]
    async fn test_newer_version_replaces_older() {
        let repo = repo().await;
        let v3 = CredentialRecord::live(7, 3, fields("carol", true));
        let v4 = CredentialRecord::live(7, 4, fields("carol", false));

        assert!(repo.apply(&v3).await.unwrap().is_apply());
        assert!(repo.apply(&v4).await.unwrap().is_apply());

        let local = repo.get(7).await.unwrap().unwrap();
        assert_eq!(local.version, 4);
        assert!(!local.is_active());

        // Delayed duplicate of v3
        let decision = repo.apply(&v3).await.unwrap();
        assert_eq!(decision, MergeDecision::Stale { local_version: 4 });
        assert_eq!(repo.get(7).await.unwrap().unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_apply_order_independent() {
        for order in [[3u64, 1, 5], [1, 3, 5], [5, 1, 3]] {
            let repo = repo().await;
            for v in order {
                let record =
                    CredentialRecord::live(1, v, fields(&format!("user{v}"), v % 2 == 1));
                repo.apply(&record).await.unwrap();
            }
            let local = repo.get(1).await.unwrap().unwrap();
            assert_eq!(local.version, 5);
            assert_eq!(local.fields.unwrap().username, "user5");
        }
    }

    #[tokio::test]
    async fn test_tombstone_removes_and_blocks_resurrection() {
        let repo = repo().await;
        repo.apply(&CredentialRecord::live(2, 1, fields("dave", true)))
            .await
            .unwrap();
        repo.apply(&CredentialRecord::tombstone(2, 2)).await.unwrap();

        assert!(repo.get(2).await.unwrap().is_none());
        assert!(repo.find_by_username("dave").await.unwrap().is_none());
        assert_eq!(repo.version_of(2).await.unwrap(), Some(2));

        let late = CredentialRecord::live(2, 1, fields("dave", true));
        assert!(!repo.apply(&late).await.unwrap().is_apply());
        assert!(repo.get(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_rejects_unstorable_version() {
        let repo = repo().await;
        let huge = CredentialRecord::live(3, u64::MAX, fields("erin", true));

        let err = repo.apply(&huge).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidRecord(_)));
        assert!(repo.version_of(3).await.unwrap().is_none());

        let err = repo.mark_published(3, u64::MAX).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_bump_increments_and_tracks_publication() {
        let repo = repo().await;

        let v1 = repo.bump(9, Some(fields("erin", true))).await.unwrap();
        let v2 = repo.bump(9, Some(fields("erin", false))).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let pending = repo.unpublished(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 2);

        repo.mark_published(9, 2).await.unwrap();
        assert!(repo.unpublished(10).await.unwrap().is_empty());

        // Stale ack does not roll publication back
        repo.mark_published(9, 1).await.unwrap();
        assert!(repo.unpublished(10).await.unwrap().is_empty());

        let deleted = repo.bump(9, None).await.unwrap();
        assert!(deleted.tombstone);
        assert_eq!(deleted.version, 3);
        assert_eq!(repo.unpublished(10).await.unwrap()[0].version, 3);
    }

    #[tokio::test]
    async fn test_find_by_username_and_pagination() {
        let repo = repo().await;
        for (id, name) in [(1, "admin"), (2, "bob"), (3, "cara"), (4, "dan"), (5, "eve")] {
            repo.apply(&CredentialRecord::live(id, 1, fields(name, true)))
                .await
                .unwrap();
        }
        repo.apply(&CredentialRecord::tombstone(3, 2)).await.unwrap();

        let bob = repo.find_by_username("bob").await.unwrap().unwrap();
        assert_eq!(bob.user_id, 2);

        let page = repo.list_page(2, 2).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.pages(), 2);
        let ids: Vec<i64> = page.items.iter().map(|r| r.user_id).collect();
        assert_eq!(ids, vec![4, 5]);
    }
}
