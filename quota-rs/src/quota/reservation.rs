//! Check-and-commit under one version guard

use serde::Serialize;

use super::context::OperationContext;
use super::enforcer::{check_available, QuotaEnforcer};
use super::retry::with_retry;
use crate::error::Result;
use crate::ledger::{EntityKey, EntityMetadata, UserId};

/// Storage committed to an entity by [`QuotaEnforcer::try_reserve`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub user_id: UserId,
    pub key: EntityKey,
    pub size: i64,
    pub previous_size: i64,
    /// Ledger version after the reservation
    pub version: u64,
}

impl Reservation {
    /// Bytes this reservation added to (or, when negative, released from) the ledger
    pub fn delta(&self) -> i64 {
        self.size - self.previous_size
    }
}

impl QuotaEnforcer {
    /// Check the quota and commit the new size against the same loaded ledger
    /// version. A writer that committed in between makes the append fail with
    /// `ConcurrencyConflict` instead of overrunning the allocation.
    pub async fn try_reserve(
        &self,
        ctx: &mut OperationContext,
        metadata: &EntityMetadata,
    ) -> Result<Reservation> {
        metadata.validate()?;
        let ledger = self.ledger_mut(ctx).await?;

        let previous_size = ledger.get_size(&metadata.key);
        check_available(ledger, metadata)?;
        ledger.store(
            metadata.key.clone(),
            metadata.size,
            metadata.world_id.clone(),
        )?;

        self.commit(ctx).await?;

        let version = ctx.ledger().map(|l| l.version()).unwrap_or(0);
        Ok(Reservation {
            user_id: ctx.user_id().clone(),
            key: metadata.key.clone(),
            size: metadata.size,
            previous_size,
            version,
        })
    }

    /// [`try_reserve`](Self::try_reserve) on fresh contexts until it commits,
    /// fails the quota check, or runs out of attempts.
    pub async fn reserve(&self, ctx: &OperationContext, metadata: &EntityMetadata) -> Result<Reservation> {
        let what = format!("reservation of {}", metadata.key);
        with_retry(self.retry_policy(), ctx, &what, move || async move {
            let mut attempt_ctx = ctx.fresh();
            self.try_reserve(&mut attempt_ctx, metadata).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuotaError;
    use crate::event_store::InMemoryEventStore;
    use crate::settings::StaticAllocation;
    use std::sync::Arc;

    fn enforcer(store: Arc<InMemoryEventStore>) -> QuotaEnforcer {
        QuotaEnforcer::new(store, Arc::new(StaticAllocation::new(1000)))
    }

    fn meta(id: &str, size: i64) -> EntityMetadata {
        EntityMetadata::new("worldA", EntityKey::new("item", id), size)
    }

    #[tokio::test]
    async fn test_try_reserve_commits() {
        let store = Arc::new(InMemoryEventStore::new());
        let enforcer = enforcer(store);
        let mut ctx = OperationContext::new("u1");

        let first = enforcer.try_reserve(&mut ctx, &meta("i1", 400)).await.unwrap();
        assert_eq!(first.delta(), 400);
        assert_eq!(first.version, 2);

        let resized = enforcer.try_reserve(&mut ctx, &meta("i1", 250)).await.unwrap();
        assert_eq!(resized.previous_size, 400);
        assert_eq!(resized.delta(), -150);

        let ledger = enforcer.ledger(&UserId::new("u1")).await.unwrap();
        assert_eq!(ledger.used_bytes(), 250);
    }

    #[tokio::test]
    async fn test_try_reserve_rejects_over_quota() {
        let store = Arc::new(InMemoryEventStore::new());
        let enforcer = enforcer(store.clone());
        let mut ctx = OperationContext::new("u1");

        enforcer.try_reserve(&mut ctx, &meta("i1", 800)).await.unwrap();
        let err = enforcer.try_reserve(&mut ctx, &meta("i2", 300)).await.unwrap_err();

        assert!(matches!(
            err,
            QuotaError::QuotaExceeded {
                available_bytes: 200,
                required_bytes: 300,
                ..
            }
        ));
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn test_stale_reservation_conflicts() {
        let store = Arc::new(InMemoryEventStore::new());
        let enforcer = enforcer(store);

        let mut slow = OperationContext::new("u1");
        enforcer.ensure_available(&mut slow, &meta("i1", 600)).await.unwrap();

        let mut fast = OperationContext::new("u1");
        enforcer.try_reserve(&mut fast, &meta("i2", 600)).await.unwrap();

        // The stale context passes the check against its old view, but the append is refused
        let err = enforcer.try_reserve(&mut slow, &meta("i1", 600)).await.unwrap_err();
        assert!(err.is_retryable());

        // On a fresh load the budget is gone
        let err = enforcer
            .reserve(&OperationContext::new("u1"), &meta("i1", 600))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::QuotaExceeded { .. }));
    }
}
