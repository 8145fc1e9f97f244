use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::{QuotaError, Result};
use crate::ledger::{StorageLedger, UserId};

/// Unit of work for one logical command on behalf of a user.
///
/// Memoizes the user's ledger between `ensure_available` and `update` so the
/// check and the commit see the same loaded state. Never shared across
/// requests: a retry starts from [`OperationContext::fresh`].
#[derive(Debug)]
pub struct OperationContext {
    user_id: UserId,
    cancel: CancellationToken,
    pub(crate) ledger: Option<StorageLedger>,
}

impl OperationContext {
    /// Context for `user_id` that is never cancelled
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self::with_cancellation(user_id, CancellationToken::new())
    }

    /// Context that gives up once `cancel` fires
    pub fn with_cancellation(user_id: impl Into<UserId>, cancel: CancellationToken) -> Self {
        Self {
            user_id: user_id.into(),
            cancel,
            ledger: None,
        }
    }

    /// Same user and cancellation signal, nothing cached
    pub fn fresh(&self) -> Self {
        Self::with_cancellation(self.user_id.clone(), self.cancel.clone())
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The memoized ledger, if one has been loaded
    pub fn ledger(&self) -> Option<&StorageLedger> {
        self.ledger.as_ref()
    }

    /// `Err(Cancelled)` once the request has been cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(QuotaError::Cancelled);
        }
        Ok(())
    }

    /// Run a read-only step, abandoning it if the request is cancelled.
    pub async fn guard<T, F>(&self, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(QuotaError::Cancelled),
            result = step => result,
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.ledger = None;
    }
}
