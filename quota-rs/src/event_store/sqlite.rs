//! SQLite-backed ledger event streams

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use super::{EventStore, RecordedEvent};
use crate::error::{QuotaError, Result};
use crate::ledger::{LedgerEvent, UserId};

/// SQLite result codes meaning another writer holds the database
const SQLITE_BUSY: &str = "5";
const SQLITE_BUSY_SNAPSHOT: &str = "517";

pub struct SqliteEventStore {
    db: SqlitePool,
}

#[derive(FromRow)]
struct EventRow {
    user_id: String,
    version: i64,
    payload: String,
    recorded_at: String,
}

impl SqliteEventStore {
    /// Create new event store over `db`
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Initialize database tables
    pub async fn init_db(&self) -> Result<()> {
        // (user_id, version) is the final optimistic-concurrency guard
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_events (
                user_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (user_id, version)
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    fn row_to_event(row: EventRow) -> Result<RecordedEvent> {
        Ok(RecordedEvent {
            user_id: UserId::new(row.user_id),
            version: row.version as u64,
            event: serde_json::from_str(&row.payload)?,
            recorded_at: DateTime::parse_from_rfc3339(&row.recorded_at)
                .map_err(|e| QuotaError::Database(sqlx::Error::Decode(Box::new(e))))?
                .with_timezone(&Utc),
        })
    }
}

/// Map write contention on the stream to a conflict the caller can retry.
fn map_append_error(err: sqlx::Error, user_id: &UserId, expected_version: u64) -> QuotaError {
    if let sqlx::Error::Database(db_err) = &err {
        let busy = matches!(
            db_err.code().as_deref(),
            Some(SQLITE_BUSY) | Some(SQLITE_BUSY_SNAPSHOT)
        );
        if db_err.is_unique_violation() || busy {
            return QuotaError::ConcurrencyConflict {
                user_id: user_id.to_string(),
                expected_version,
            };
        }
    }
    QuotaError::Database(err)
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn load_after(&self, user_id: &UserId, after_version: u64) -> Result<Vec<RecordedEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT user_id, version, payload, recorded_at
            FROM ledger_events
            WHERE user_id = ? AND version > ?
            ORDER BY version ASC
            "#,
        )
        .bind(user_id.as_str())
        .bind(after_version as i64)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn append(
        &self,
        user_id: &UserId,
        expected_version: u64,
        events: &[LedgerEvent],
    ) -> Result<Vec<RecordedEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let conflict = |err: sqlx::Error| map_append_error(err, user_id, expected_version);

        let mut tx = self.db.begin().await.map_err(conflict)?;

        let (actual_version,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM ledger_events WHERE user_id = ?")
                .bind(user_id.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(conflict)?;

        if actual_version as u64 != expected_version {
            debug!(
                "Ledger {} is at version {}, append expected {}",
                user_id, actual_version, expected_version
            );
            return Err(QuotaError::ConcurrencyConflict {
                user_id: user_id.to_string(),
                expected_version,
            });
        }

        let now = Utc::now();
        let mut recorded = Vec::with_capacity(events.len());

        for (offset, event) in events.iter().enumerate() {
            let version = expected_version + offset as u64 + 1;
            let payload = serde_json::to_string(event)?;

            sqlx::query(
                "INSERT INTO ledger_events (user_id, version, event_type, payload, recorded_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(user_id.as_str())
            .bind(version as i64)
            .bind(event.event_type())
            .bind(&payload)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(conflict)?;

            recorded.push(RecordedEvent {
                user_id: user_id.clone(),
                version,
                event: event.clone(),
                recorded_at: now,
            });
        }

        tx.commit().await.map_err(conflict)?;
        Ok(recorded)
    }

    async fn current_version(&self, user_id: &UserId) -> Result<u64> {
        let (version,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM ledger_events WHERE user_id = ?")
                .bind(user_id.as_str())
                .fetch_one(&self.db)
                .await?;

        Ok(version as u64)
    }

    async fn streams(&self) -> Result<Vec<UserId>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT user_id FROM ledger_events ORDER BY user_id",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(|(user,)| UserId::new(user)).collect())
    }
}
