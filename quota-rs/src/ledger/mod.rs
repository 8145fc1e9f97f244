//! Per-user storage ledger
//!
//! - [`types`]: identifiers, entity keys and ledger entries
//! - [`events`]: the events a ledger raises
//! - [`aggregate`]: the ledger aggregate and its reducer

pub mod aggregate;
pub mod events;
pub mod types;

pub use aggregate::{LedgerState, LedgerStatus, StorageLedger};
pub use events::LedgerEvent;
pub use types::{EntityId, EntityKey, EntityMetadata, EntityType, StoredEntity, UserId, WorldId};
