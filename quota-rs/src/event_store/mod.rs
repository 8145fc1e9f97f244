//! Append-only ledger event streams, one per user
//!
//! The quota core only needs two guarantees from a store: events come back in
//! version order, and an append whose expected version is stale is rejected
//! with [`QuotaError::ConcurrencyConflict`](crate::error::QuotaError).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::{LedgerEvent, UserId};

pub use memory::InMemoryEventStore;
pub use sqlite::SqliteEventStore;

/// An event as persisted in a user's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub user_id: UserId,
    /// Position in the stream, starting at 1
    pub version: u64,
    pub event: LedgerEvent,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events with a version strictly greater than `after_version`, in order
    async fn load_after(&self, user_id: &UserId, after_version: u64) -> Result<Vec<RecordedEvent>>;

    /// Append `events` if the stream is still at `expected_version`.
    ///
    /// Returns the recorded events; an empty slice is a no-op.
    async fn append(
        &self,
        user_id: &UserId,
        expected_version: u64,
        events: &[LedgerEvent],
    ) -> Result<Vec<RecordedEvent>>;

    /// Version of the last event in the stream, 0 when empty
    async fn current_version(&self, user_id: &UserId) -> Result<u64>;

    /// Every user owning a non-empty stream
    async fn streams(&self) -> Result<Vec<UserId>>;

    async fn load(&self, user_id: &UserId) -> Result<Vec<RecordedEvent>> {
        self.load_after(user_id, 0).await
    }
}
