//! Keeps the summary and detail tables in step with ledger events

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{DeadLetter, StorageDetail, StorageSummary};
use super::EventHandler;
use crate::error::{QuotaError, Result};
use crate::event_store::{EventStore, RecordedEvent};
use crate::ledger::{LedgerEvent, UserId, WorldId};

/// Result of applying a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// At or below the checkpoint; redelivery
    AlreadyApplied,
    /// Earlier events are missing from the projection
    Gap { checkpoint: u64 },
}

/// Derives `storage_summary` and `storage_detail` from ledger events.
///
/// Nothing else writes these tables. Each event is applied together with the
/// per-user checkpoint in one transaction, so a redelivered event is skipped and
/// an interrupted one is picked up by [`catch_up`](Self::catch_up).
pub struct ProjectionSynchronizer {
    pub(super) db: SqlitePool,
    pub(super) store: Arc<dyn EventStore>,
}

impl ProjectionSynchronizer {
    /// Create a synchronizer over `db`, replaying from `store` on catch-up
    pub fn new(db: SqlitePool, store: Arc<dyn EventStore>) -> Self {
        Self { db, store }
    }

    /// Initialize database tables
    pub async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS storage_summary (
                user_id TEXT PRIMARY KEY,
                allocated_bytes INTEGER NOT NULL,
                used_bytes INTEGER NOT NULL DEFAULT 0,
                available_bytes INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS storage_detail (
                owner_user_id TEXT NOT NULL,
                world_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                size INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (entity_type, entity_id)
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projection_checkpoints (
                user_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projection_dead_letters (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                error TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_storage_detail_owner ON storage_detail(owner_user_id, world_id)",
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_user ON projection_dead_letters(user_id, version)",
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Apply one event with both handlers, all or nothing.
    pub async fn apply(&self, recorded: &RecordedEvent) -> Result<ApplyOutcome> {
        let mut tx = self.db.begin().await?;

        let checkpoint = read_checkpoint(&mut tx, &recorded.user_id).await?;
        if recorded.version <= checkpoint {
            debug!(
                "Skipping {} v{} for {}, projection already at v{}",
                recorded.event.event_type(),
                recorded.version,
                recorded.user_id,
                checkpoint
            );
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if recorded.version != checkpoint + 1 {
            return Ok(ApplyOutcome::Gap { checkpoint });
        }

        apply_summary(&mut tx, recorded).await?;
        apply_detail(&mut tx, recorded).await?;
        write_checkpoint(&mut tx, &recorded.user_id, recorded.version).await?;

        tx.commit().await?;

        debug!(
            "Projected {} v{} for {}",
            recorded.event.event_type(),
            recorded.version,
            recorded.user_id
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Record an event whose projection failed so it is never dropped silently.
    pub async fn dead_letter(&self, recorded: &RecordedEvent, err: &QuotaError) {
        error!(
            "Projection of {} v{} for {} failed: {}",
            recorded.event.event_type(),
            recorded.version,
            recorded.user_id,
            err
        );

        let result = sqlx::query(
            "INSERT INTO projection_dead_letters (id, user_id, version, error, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(recorded.user_id.as_str())
        .bind(recorded.version as i64)
        .bind(err.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            error!(
                "Failed to dead-letter {} v{} for {}: {}",
                recorded.event.event_type(),
                recorded.version,
                recorded.user_id,
                e
            );
        }
    }

    /// Version of the last event reflected in the projections for `user_id`
    pub async fn checkpoint(&self, user_id: &UserId) -> Result<u64> {
        let mut conn = self.db.acquire().await?;
        read_checkpoint(&mut conn, user_id).await
    }

    /// Summary row for `user_id`, if their ledger has been projected
    pub async fn summary(&self, user_id: &UserId) -> Result<Option<StorageSummary>> {
        let summary = sqlx::query_as::<_, StorageSummary>(
            "SELECT user_id, allocated_bytes, used_bytes, available_bytes FROM storage_summary WHERE user_id = ?",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.db)
        .await?;

        Ok(summary)
    }

    /// All summary rows, ordered by user
    pub async fn list_summaries(&self) -> Result<Vec<StorageSummary>> {
        let summaries = sqlx::query_as::<_, StorageSummary>(
            "SELECT user_id, allocated_bytes, used_bytes, available_bytes FROM storage_summary ORDER BY user_id",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(summaries)
    }

    /// Number of users with a summary row
    pub async fn ledger_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM storage_summary")
            .fetch_one(&self.db)
            .await?;

        Ok(count)
    }

    /// Detail rows of every entity `user_id` owns, across worlds
    pub async fn details(&self, user_id: &UserId) -> Result<Vec<StorageDetail>> {
        let rows = sqlx::query_as::<_, StorageDetail>(
            r#"
            SELECT owner_user_id, world_id, entity_type, entity_id, size
            FROM storage_detail
            WHERE owner_user_id = ?
            ORDER BY world_id, entity_type, entity_id
            "#,
        )
        .bind(user_id.as_str())
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    /// Detail rows of `user_id`'s entities in one world
    pub async fn details_for_world(
        &self,
        user_id: &UserId,
        world_id: &WorldId,
    ) -> Result<Vec<StorageDetail>> {
        let rows = sqlx::query_as::<_, StorageDetail>(
            r#"
            SELECT owner_user_id, world_id, entity_type, entity_id, size
            FROM storage_detail
            WHERE owner_user_id = ? AND world_id = ?
            ORDER BY entity_type, entity_id
            "#,
        )
        .bind(user_id.as_str())
        .bind(world_id.as_str())
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    /// Events whose projection failed and that catch-up has not yet cleared
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            "SELECT id, user_id, version, error, created_at FROM projection_dead_letters ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl EventHandler for ProjectionSynchronizer {
    async fn handle(&self, cancel: &CancellationToken, events: &[RecordedEvent]) -> Result<()> {
        for recorded in events {
            if cancel.is_cancelled() {
                warn!(
                    "Cancelled before projecting {} v{}, left for catch-up",
                    recorded.user_id, recorded.version
                );
                return Ok(());
            }

            match self.apply(recorded).await {
                Ok(ApplyOutcome::Applied) | Ok(ApplyOutcome::AlreadyApplied) => {}
                Ok(ApplyOutcome::Gap { checkpoint }) => {
                    info!(
                        "Projection for {} is at v{}, received v{}; catching up",
                        recorded.user_id, checkpoint, recorded.version
                    );
                    // Catch-up reads the stream past the checkpoint, which covers the rest of `events`
                    self.catch_up(&recorded.user_id).await?;
                    return Ok(());
                }
                Err(err) => {
                    self.dead_letter(recorded, &err).await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

async fn read_checkpoint(conn: &mut SqliteConnection, user_id: &UserId) -> Result<u64> {
    let row = sqlx::query_as::<_, (i64,)>("SELECT version FROM projection_checkpoints WHERE user_id = ?")
        .bind(user_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(|(version,)| version as u64).unwrap_or(0))
}

async fn write_checkpoint(conn: &mut SqliteConnection, user_id: &UserId, version: u64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO projection_checkpoints (user_id, version) VALUES (?, ?)
        ON CONFLICT(user_id) DO UPDATE SET version = excluded.version
        "#,
    )
    .bind(user_id.as_str())
    .bind(version as i64)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Per-user summary row
async fn apply_summary(conn: &mut SqliteConnection, recorded: &RecordedEvent) -> Result<()> {
    let now = Utc::now().to_rfc3339();

    match &recorded.event {
        LedgerEvent::Initialized {
            allocated_bytes, ..
        } => {
            let existing = sqlx::query_as::<_, (i64,)>(
                "SELECT allocated_bytes FROM storage_summary WHERE user_id = ?",
            )
            .bind(recorded.user_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

            if existing.is_some() {
                debug!("Summary for {} already exists", recorded.user_id);
                return Ok(());
            }

            sqlx::query(
                r#"
                INSERT INTO storage_summary (user_id, allocated_bytes, used_bytes, available_bytes, updated_at)
                VALUES (?, ?, 0, ?, ?)
                "#,
            )
            .bind(recorded.user_id.as_str())
            .bind(*allocated_bytes)
            .bind(*allocated_bytes)
            .bind(&now)
            .execute(&mut *conn)
            .await?;
        }
        LedgerEvent::EntityStored { used_bytes, .. } => {
            let result = sqlx::query(
                r#"
                UPDATE storage_summary
                SET used_bytes = ?, available_bytes = allocated_bytes - ?, updated_at = ?
                WHERE user_id = ?
                "#,
            )
            .bind(*used_bytes)
            .bind(*used_bytes)
            .bind(&now)
            .bind(recorded.user_id.as_str())
            .execute(&mut *conn)
            .await?;

            if result.rows_affected() == 0 {
                return Err(QuotaError::ProjectionInvariantViolation(format!(
                    "entity stored at v{} for {} without a storage summary",
                    recorded.version, recorded.user_id
                )));
            }
        }
    }

    Ok(())
}

/// Per-entity detail row, keyed by (entity_type, entity_id)
async fn apply_detail(conn: &mut SqliteConnection, recorded: &RecordedEvent) -> Result<()> {
    let LedgerEvent::EntityStored { key, entity, .. } = &recorded.event else {
        return Ok(());
    };

    sqlx::query(
        r#"
        INSERT INTO storage_detail (owner_user_id, world_id, entity_type, entity_id, size, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            owner_user_id = excluded.owner_user_id,
            world_id = excluded.world_id,
            size = excluded.size,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(recorded.user_id.as_str())
    .bind(entity.world_id.as_str())
    .bind(key.entity_type.as_str())
    .bind(key.entity_id.as_str())
    .bind(entity.size)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}
