use thiserror::Error;

use crate::models::MonthKey;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Propagation already in progress")]
    ConcurrentPropagation,

    #[error("Failed to apply balance change to {month}: {reason}")]
    BatchFailure { month: MonthKey, reason: String },

    /// Snapshot restoration failed. The ledger may be partially mutated;
    /// callers must stop writing.
    #[error("Rollback of propagation {propagation_id} failed: {reason}")]
    RollbackFailure {
        propagation_id: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl From<toml::de::Error> for LedgerError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
