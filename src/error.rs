use thiserror::Error;

use crate::money::Usd;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("insufficient funds: balance={balance} required={required}")]
    InsufficientFunds { balance: Usd, required: Usd },
    #[error("usage event not found: {0}")]
    EventNotFound(i64),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}

impl LedgerError {
    /// Insufficient funds is an expected admission-control outcome, not a
    /// system failure; callers treat it as "reservation denied".
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, LedgerError::InsufficientFunds { .. })
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
