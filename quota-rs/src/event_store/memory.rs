use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{EventStore, RecordedEvent};
use crate::error::{QuotaError, Result};
use crate::ledger::{LedgerEvent, UserId};

/// Process-local event store
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<UserId, Vec<RecordedEvent>>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events across all streams
    pub async fn event_count(&self) -> usize {
        let streams = self.streams.read().await;
        streams.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn load_after(&self, user_id: &UserId, after_version: u64) -> Result<Vec<RecordedEvent>> {
        let streams = self.streams.read().await;

        Ok(streams
            .get(user_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
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

        let mut streams = self.streams.write().await;
        let stream = streams.entry(user_id.clone()).or_default();

        let actual_version = stream.last().map(|e| e.version).unwrap_or(0);
        if actual_version != expected_version {
            return Err(QuotaError::ConcurrencyConflict {
                user_id: user_id.to_string(),
                expected_version,
            });
        }

        let now = Utc::now();
        let recorded: Vec<RecordedEvent> = events
            .iter()
            .enumerate()
            .map(|(offset, event)| RecordedEvent {
                user_id: user_id.clone(),
                version: expected_version + offset as u64 + 1,
                event: event.clone(),
                recorded_at: now,
            })
            .collect();

        stream.extend(recorded.iter().cloned());
        Ok(recorded)
    }

    async fn current_version(&self, user_id: &UserId) -> Result<u64> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(user_id)
            .and_then(|stream| stream.last())
            .map(|e| e.version)
            .unwrap_or(0))
    }

    async fn streams(&self) -> Result<Vec<UserId>> {
        let streams = self.streams.read().await;
        let mut users: Vec<UserId> = streams
            .iter()
            .filter(|(_, stream)| !stream.is_empty())
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        Ok(users)
    }
}
