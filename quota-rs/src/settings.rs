//! Account settings the ledger reads its allocation from

use async_trait::async_trait;
use std::collections::HashMap;

use crate::config::QuotaConfig;
use crate::error::Result;
use crate::ledger::UserId;

/// Source of a user's allocation ceiling.
///
/// Consulted once, when the user's ledger is first initialized.
#[async_trait]
pub trait AllocationSource: Send + Sync {
    async fn allocated_bytes(&self, user_id: &UserId) -> Result<i64>;
}

/// Allocation from configuration: a default plus per-user overrides
#[derive(Debug, Clone)]
pub struct StaticAllocation {
    default_bytes: i64,
    overrides: HashMap<UserId, i64>,
}

impl StaticAllocation {
    /// Same allocation for every user
    pub fn new(default_bytes: i64) -> Self {
        Self {
            default_bytes,
            overrides: HashMap::new(),
        }
    }

    /// Give `user_id` its own allocation
    pub fn with_override(mut self, user_id: impl Into<UserId>, bytes: i64) -> Self {
        self.overrides.insert(user_id.into(), bytes);
        self
    }

    /// Build from `quota.default_allocated_bytes` and `quota.allocations`
    pub fn from_config(config: &QuotaConfig) -> Self {
        Self {
            default_bytes: config.default_allocated_bytes,
            overrides: config
                .allocations
                .iter()
                .map(|(user, bytes)| (UserId::new(user.as_str()), *bytes))
                .collect(),
        }
    }
}

#[async_trait]
impl AllocationSource for StaticAllocation {
    async fn allocated_bytes(&self, user_id: &UserId) -> Result<i64> {
        Ok(self
            .overrides
            .get(user_id)
            .copied()
            .unwrap_or(self.default_bytes))
    }
}
