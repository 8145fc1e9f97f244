//! Query-optimized read tables derived from ledger events
//!
//! - [`synchronizer`]: summary and detail handlers, applied per event in one transaction
//! - [`catch_up`]: replay of events the projections missed
//! - [`types`]: projection rows

pub mod catch_up;
pub mod synchronizer;
pub mod types;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event_store::RecordedEvent;

pub use catch_up::CatchUpReport;
pub use synchronizer::{ApplyOutcome, ProjectionSynchronizer};
pub use types::{DeadLetter, StorageDetail, StorageSummary};

/// Receives ledger events right after they are committed, before the
/// originating command returns.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, events: &[RecordedEvent]) -> Result<()>;
}
