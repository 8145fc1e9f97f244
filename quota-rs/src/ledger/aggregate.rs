use std::collections::HashMap;
use tracing::debug;

use super::events::LedgerEvent;
use super::types::{EntityKey, StoredEntity, UserId, WorldId};
use crate::error::{QuotaError, Result};
use crate::event_store::RecordedEvent;

/// Lifecycle of a ledger; `Active` has no terminal successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerStatus {
    #[default]
    Uninitialized,
    Initialized,
    Active,
}

/// Folded ledger data, produced only by [`LedgerState::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerState {
    pub status: LedgerStatus,
    pub allocated_bytes: i64,
    pub used_bytes: i64,
    pub entities: HashMap<EntityKey, StoredEntity>,
}

impl LedgerState {
    /// Pure reducer: `(state, event) -> state`.
    pub fn apply(mut self, event: &LedgerEvent) -> Self {
        match event {
            LedgerEvent::Initialized {
                allocated_bytes, ..
            } => {
                self.allocated_bytes = *allocated_bytes;
                self.status = LedgerStatus::Initialized;
            }
            LedgerEvent::EntityStored {
                key,
                entity,
                used_bytes,
            } => {
                self.entities.insert(key.clone(), entity.clone());
                self.used_bytes = *used_bytes;
                self.status = LedgerStatus::Active;
            }
        }
        debug_assert_eq!(
            self.used_bytes,
            self.entities.values().map(|e| e.size).sum::<i64>()
        );
        self
    }
}

/// Per-user event-sourced storage ledger.
///
/// Commands (`initialize`, `store`) validate, then raise events through the
/// reducer and queue them as pending until the enforcer appends them under
/// the ledger's `version`.
#[derive(Debug, Clone)]
pub struct StorageLedger {
    user_id: UserId,
    state: LedgerState,
    version: u64,
    pending: Vec<LedgerEvent>,
}

impl StorageLedger {
    /// Empty, uninitialized ledger at version 0
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            state: LedgerState::default(),
            version: 0,
            pending: Vec::new(),
        }
    }

    /// Rebuild a ledger from its persisted stream.
    pub fn replay<'a, I>(user_id: UserId, events: I) -> Self
    where
        I: IntoIterator<Item = &'a RecordedEvent>,
    {
        let mut ledger = Self::new(user_id);
        for recorded in events {
            ledger.state = std::mem::take(&mut ledger.state).apply(&recorded.event);
            ledger.version = recorded.version;
        }
        ledger
    }

    /// Fix the allocation ceiling. A ledger that is already initialized keeps
    /// its allocation and raises nothing.
    pub fn initialize(&mut self, allocated_bytes: i64) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(QuotaError::InvalidInitialization(
                "user id must not be empty".to_string(),
            ));
        }
        if allocated_bytes <= 0 {
            return Err(QuotaError::InvalidInitialization(format!(
                "allocated bytes must be positive, got {}",
                allocated_bytes
            )));
        }
        if self.is_initialized() {
            debug!("Ledger {} already initialized, ignoring", self.user_id);
            return Ok(());
        }

        self.raise(LedgerEvent::Initialized {
            user_id: self.user_id.clone(),
            allocated_bytes,
        });
        Ok(())
    }

    /// Record the current size of an entity. Returns `false` when the entry
    /// already holds the same size and world, in which case nothing is raised.
    pub fn store(&mut self, key: EntityKey, size: i64, world_id: WorldId) -> Result<bool> {
        if !self.is_initialized() {
            return Err(QuotaError::LedgerNotInitialized(self.user_id.to_string()));
        }
        if size < 0 {
            return Err(QuotaError::InvalidSize(size));
        }

        let previous = self.state.entities.get(&key);
        if let Some(existing) = previous {
            if existing.size == size && existing.world_id == world_id {
                return Ok(false);
            }
        }

        let previous_size = previous.map(|e| e.size).unwrap_or(0);
        let used_bytes = self
            .state
            .used_bytes
            .checked_sub(previous_size)
            .and_then(|rest| rest.checked_add(size))
            .ok_or(QuotaError::InvalidSize(size))?;

        self.raise(LedgerEvent::EntityStored {
            key,
            entity: StoredEntity { size, world_id },
            used_bytes,
        });
        Ok(true)
    }

    /// Last recorded size of `key`, or 0 if it was never stored
    pub fn get_size(&self, key: &EntityKey) -> i64 {
        self.state.entities.get(key).map(|e| e.size).unwrap_or(0)
    }

    /// Ledger entry for `key`
    pub fn entity(&self, key: &EntityKey) -> Option<&StoredEntity> {
        self.state.entities.get(key)
    }

    /// Every tracked entity, in no particular order
    pub fn entities(&self) -> impl Iterator<Item = (&EntityKey, &StoredEntity)> {
        self.state.entities.iter()
    }

    /// Owner of the ledger
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get lifecycle status
    pub fn status(&self) -> LedgerStatus {
        self.state.status
    }

    pub fn is_initialized(&self) -> bool {
        self.state.status != LedgerStatus::Uninitialized
    }

    /// Allocation ceiling fixed at initialization
    pub fn allocated_bytes(&self) -> i64 {
        self.state.allocated_bytes
    }

    /// Sum of the latest size of every entity
    pub fn used_bytes(&self) -> i64 {
        self.state.used_bytes
    }

    /// `allocated_bytes - used_bytes`
    pub fn available_bytes(&self) -> i64 {
        self.state.allocated_bytes - self.state.used_bytes
    }

    /// Version of the last persisted event; the expected version of the next append.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Events raised since the last commit, oldest first
    pub fn pending(&self) -> &[LedgerEvent] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Acknowledge that pending events were appended up to `version`.
    pub fn mark_committed(&mut self, version: u64) {
        self.pending.clear();
        self.version = version;
    }

    fn raise(&mut self, event: LedgerEvent) {
        self.state = std::mem::take(&mut self.state).apply(&event);
        self.pending.push(event);
    }
}
