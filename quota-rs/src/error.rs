use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Storage quota exceeded for {user_id}: {required_bytes} bytes required, {available_bytes} available")]
    QuotaExceeded {
        user_id: String,
        available_bytes: i64,
        required_bytes: i64,
    },

    #[error("Concurrency conflict on ledger {user_id}: expected version {expected_version}")]
    ConcurrencyConflict {
        user_id: String,
        expected_version: u64,
    },

    #[error("Gave up on ledger {user_id} after {attempts} conflicting attempts")]
    RetriesExhausted { user_id: String, attempts: u32 },

    #[error("Projection invariant violated: {0}")]
    ProjectionInvariantViolation(String),

    #[error("Invalid ledger initialization: {0}")]
    InvalidInitialization(String),

    #[error("Ledger not initialized: {0}")]
    LedgerNotInitialized(String),

    #[error("Invalid entity size: {0}")]
    InvalidSize(i64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QuotaError {
    /// Whether the whole check-mutate-commit sequence may be retried
    /// against a freshly loaded ledger.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QuotaError::ConcurrencyConflict { .. })
    }
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuotaError>;
