/// Quota enforcement for world content
///
/// This module provides:
/// - An operation context scoping one command's ledger load
/// - Availability checks and commits against the user's ledger
/// - Atomic reservations
/// - Backoff and retry of sequences that lose a commit race

pub mod context;
pub mod enforcer;
pub mod reservation;
pub mod retry;

pub use context::OperationContext;
pub use enforcer::QuotaEnforcer;
pub use reservation::Reservation;
pub use retry::{with_retry, RetryPolicy, DEFAULT_MAX_RETRIES};
