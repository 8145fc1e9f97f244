use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::OperationContext;
use super::retry::{with_retry, RetryPolicy};
use crate::error::{QuotaError, Result};
use crate::event_store::{EventStore, RecordedEvent};
use crate::ledger::{EntityMetadata, StorageLedger, UserId};
use crate::projection::EventHandler;
use crate::settings::AllocationSource;

/// Quota checks and commits against per-user storage ledgers.
///
/// `ensure_available` followed by `update` is not atomic: another writer can
/// commit between the two. The ledger append is guarded by the version the
/// context loaded, so the slower writer gets a `ConcurrencyConflict` and must
/// run the whole sequence again on a fresh context, which [`execute`](Self::execute)
/// does with backoff, up to the policy's attempt limit. [`try_reserve`](Self::try_reserve)
/// checks and commits under a single version guard.
pub struct QuotaEnforcer {
    store: Arc<dyn EventStore>,
    allocation: Arc<dyn AllocationSource>,
    handlers: Vec<Arc<dyn EventHandler>>,
    retry: RetryPolicy,
}

impl QuotaEnforcer {
    /// Create an enforcer with the default retry policy and no projection handlers
    pub fn new(store: Arc<dyn EventStore>, allocation: Arc<dyn AllocationSource>) -> Self {
        Self {
            store,
            allocation,
            handlers: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Run `handler` synchronously after every commit
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Keep the backoff settings, change only the attempt limit
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_attempts = max_retries.max(1);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fail with `QuotaExceeded` if storing `metadata` would overrun the
    /// caller's allocation. Persists nothing.
    pub async fn ensure_available(
        &self,
        ctx: &mut OperationContext,
        metadata: &EntityMetadata,
    ) -> Result<()> {
        metadata.validate()?;
        let ledger = self.ledger_mut(ctx).await?;
        check_available(ledger, metadata)
    }

    /// Record the entity's current size and append the resulting event.
    pub async fn update(&self, ctx: &mut OperationContext, metadata: &EntityMetadata) -> Result<()> {
        metadata.validate()?;
        let ledger = self.ledger_mut(ctx).await?;

        let changed = ledger.store(
            metadata.key.clone(),
            metadata.size,
            metadata.world_id.clone(),
        )?;
        if !changed {
            debug!("{} unchanged in ledger {}", metadata.key, ledger.user_id());
        }

        self.commit(ctx).await?;
        Ok(())
    }

    /// Persist the caller's ledger, creating it from account settings if needed.
    /// A ledger that already exists keeps its allocation.
    pub async fn initialize(&self, ctx: &mut OperationContext) -> Result<StorageLedger> {
        self.ledger_mut(ctx).await?;
        self.commit(ctx).await?;

        ctx.ledger()
            .cloned()
            .ok_or_else(|| QuotaError::LedgerNotInitialized(ctx.user_id().to_string()))
    }

    /// Check, mutate the caller's domain state, and commit, retrying the whole
    /// sequence on a fresh context when the commit loses a race.
    ///
    /// `mutate` is called once per attempt; its future is awaited only after
    /// the check passed.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        metadata: &EntityMetadata,
        mut mutate: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let what = format!("write of {}", metadata.key);
        with_retry(&self.retry, ctx, &what, move || {
            let mut attempt_ctx = ctx.fresh();
            let write = mutate();
            async move {
                self.ensure_available(&mut attempt_ctx, metadata).await?;
                let output = write.await?;
                self.update(&mut attempt_ctx, metadata).await?;
                Ok(output)
            }
        })
        .await
    }

    /// Current persisted ledger for `user_id`; uninitialized if none exists yet.
    pub async fn ledger(&self, user_id: &UserId) -> Result<StorageLedger> {
        let events = self.store.load(user_id).await?;
        Ok(StorageLedger::replay(user_id.clone(), &events))
    }

    /// The context's ledger, loading or lazily initializing it on first use.
    pub(super) async fn ledger_mut<'c>(
        &self,
        ctx: &'c mut OperationContext,
    ) -> Result<&'c mut StorageLedger> {
        ctx.check_cancelled()?;

        let ledger = match ctx.ledger.take() {
            Some(ledger) => ledger,
            None => self.load_or_initialize(ctx).await?,
        };
        Ok(ctx.ledger.insert(ledger))
    }

    async fn load_or_initialize(&self, ctx: &OperationContext) -> Result<StorageLedger> {
        let user_id = ctx.user_id();
        let events = ctx.guard(self.store.load(user_id)).await?;
        let mut ledger = StorageLedger::replay(user_id.clone(), &events);

        if !ledger.is_initialized() {
            let allocated_bytes = ctx.guard(self.allocation.allocated_bytes(user_id)).await?;
            ledger.initialize(allocated_bytes)?;
            info!(
                "Initializing storage ledger for {} with {} bytes",
                user_id, allocated_bytes
            );
        }

        Ok(ledger)
    }

    /// Append the context ledger's pending events under its loaded version,
    /// then hand them to the projection handlers.
    pub(super) async fn commit(&self, ctx: &mut OperationContext) -> Result<Vec<RecordedEvent>> {
        ctx.check_cancelled()?;

        let (user_id, expected_version, pending) = match ctx.ledger() {
            Some(ledger) if ledger.has_pending() => (
                ledger.user_id().clone(),
                ledger.version(),
                ledger.pending().to_vec(),
            ),
            _ => return Ok(Vec::new()),
        };

        let recorded = match self.store.append(&user_id, expected_version, &pending).await {
            Ok(recorded) => recorded,
            Err(err) => {
                if err.is_retryable() {
                    debug!(
                        "Append to ledger {} at v{} rejected: {}",
                        user_id, expected_version, err
                    );
                }
                // Whatever the cause, the cached ledger no longer matches the stream
                ctx.invalidate();
                return Err(err);
            }
        };

        let head = recorded.last().map(|e| e.version).unwrap_or(expected_version);
        if let Some(ledger) = ctx.ledger.as_mut() {
            ledger.mark_committed(head);
            info!(
                "Committed {} event(s) to ledger {} (v{}, {} of {} bytes used)",
                recorded.len(),
                user_id,
                head,
                ledger.used_bytes(),
                ledger.allocated_bytes()
            );
        }

        for handler in &self.handlers {
            if let Err(err) = handler.handle(ctx.cancellation(), &recorded).await {
                if matches!(err, QuotaError::ProjectionInvariantViolation(_)) {
                    return Err(err);
                }
                warn!(
                    "Projection of ledger {} v{} deferred to catch-up: {}",
                    user_id, head, err
                );
            }
        }

        Ok(recorded)
    }
}

/// `newSize - previousSize` must fit in the available bytes; shrinking always fits.
pub(super) fn check_available(ledger: &StorageLedger, metadata: &EntityMetadata) -> Result<()> {
    let required_bytes = metadata.size - ledger.get_size(&metadata.key);
    let available_bytes = ledger.available_bytes();

    if required_bytes > 0 && required_bytes > available_bytes {
        info!(
            "Quota exceeded for {}: {} needs {} bytes, {} available",
            ledger.user_id(),
            metadata.key,
            required_bytes,
            available_bytes
        );
        return Err(QuotaError::QuotaExceeded {
            user_id: ledger.user_id().to_string(),
            available_bytes,
            required_bytes,
        });
    }
    Ok(())
}
