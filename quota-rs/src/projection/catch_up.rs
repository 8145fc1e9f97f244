//! Replays ledger events the projections missed
//!
//! Events can be committed to a ledger without reaching the projections: the
//! request was cancelled in between, or a handler failed and the event was
//! dead-lettered. Catch-up reads each stream past its checkpoint and applies
//! the remainder in order.

use serde::Serialize;
use tracing::{info, warn};

use super::synchronizer::{ApplyOutcome, ProjectionSynchronizer};
use crate::error::{QuotaError, Result};
use crate::ledger::UserId;

/// Outcome of [`ProjectionSynchronizer::catch_up_all`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatchUpReport {
    pub streams: usize,
    pub events_applied: usize,
    pub failures: Vec<(String, String)>,
}

impl ProjectionSynchronizer {
    /// Bring one user's projections up to the head of their ledger stream.
    ///
    /// Returns the number of events applied.
    pub async fn catch_up(&self, user_id: &UserId) -> Result<usize> {
        let checkpoint = self.checkpoint(user_id).await?;
        let events = if self.store.current_version(user_id).await? > checkpoint {
            self.store.load_after(user_id, checkpoint).await?
        } else {
            Vec::new()
        };

        let mut applied = 0;
        for recorded in &events {
            match self.apply(recorded).await {
                Ok(ApplyOutcome::Applied) => applied += 1,
                Ok(ApplyOutcome::AlreadyApplied) => {}
                Ok(ApplyOutcome::Gap { checkpoint }) => {
                    return Err(QuotaError::ProjectionInvariantViolation(format!(
                        "ledger {} skips from v{} to v{}",
                        user_id, checkpoint, recorded.version
                    )));
                }
                Err(err) => {
                    self.dead_letter(recorded, &err).await;
                    return Err(err);
                }
            }
        }

        let head = self.checkpoint(user_id).await?;
        let cleared = sqlx::query("DELETE FROM projection_dead_letters WHERE user_id = ? AND version <= ?")
            .bind(user_id.as_str())
            .bind(head as i64)
            .execute(&self.db)
            .await?
            .rows_affected();

        if applied > 0 || cleared > 0 {
            info!(
                "Caught up {} to v{}: {} events applied, {} dead letters cleared",
                user_id, head, applied, cleared
            );
        }
        Ok(applied)
    }

    /// Catch up every ledger stream, continuing past individual failures.
    pub async fn catch_up_all(&self) -> Result<CatchUpReport> {
        let users = self.store.streams().await?;
        let mut report = CatchUpReport {
            streams: users.len(),
            ..Default::default()
        };

        for user_id in users {
            match self.catch_up(&user_id).await {
                Ok(applied) => report.events_applied += applied,
                Err(err) => {
                    warn!("Catch-up failed for {}: {}", user_id, err);
                    report.failures.push((user_id.to_string(), err.to_string()));
                }
            }
        }

        Ok(report)
    }
}
