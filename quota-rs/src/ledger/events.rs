use serde::{Deserialize, Serialize};

use super::types::{EntityKey, StoredEntity, UserId};

/// Events raised by [`StorageLedger`](super::StorageLedger)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Initialized {
        user_id: UserId,
        allocated_bytes: i64,
    },
    EntityStored {
        key: EntityKey,
        entity: StoredEntity,
        /// Ledger usage after this entry replaced the previous one
        used_bytes: i64,
    },
}

impl LedgerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::Initialized { .. } => "initialized",
            LedgerEvent::EntityStored { .. } => "entity_stored",
        }
    }
}
