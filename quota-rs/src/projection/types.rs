use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row per user, derived from the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StorageSummary {
    pub user_id: String,
    pub allocated_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
}

impl StorageSummary {
    /// Get storage usage percentage
    pub fn usage_percent(&self) -> f64 {
        if self.allocated_bytes <= 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.allocated_bytes as f64) * 100.0
    }
}

/// One row per entity key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StorageDetail {
    pub owner_user_id: String,
    pub world_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub size: i64,
}

/// A ledger event whose projection could not be applied
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetter {
    pub id: String,
    pub user_id: String,
    pub version: i64,
    pub error: String,
    pub created_at: String,
}
