//! Error Types
//!
//! One taxonomy for every public operation. Only [`DeadlockError::Conflict`]
//! is retryable; everything else is terminal for the call that produced it.

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::core_types::AccountId;
use crate::store::StoreError;

#[derive(Error, Debug, Clone)]
pub enum DeadlockError {
    /// Store-reported deadlock or serialization failure
    #[error("Transaction conflict: {0}")]
    Conflict(StoreError),

    #[error("Insufficient funds in account {account_id}: balance {balance}, required {required}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: Decimal,
        required: Decimal,
    },

    /// Advisory lock manager only
    #[error("Resource already locked: {0}")]
    AlreadyLocked(String),

    /// Balance arithmetic left the representable range
    #[error("Amount would cause overflow on account {0}")]
    Overflow(AccountId),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DeadlockError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl DeadlockError {
    /// Stable error code for logs and API responses
    pub fn code(&self) -> &'static str {
        match self {
            DeadlockError::Conflict(_) => "CONFLICT",
            DeadlockError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            DeadlockError::AlreadyLocked(_) => "ALREADY_LOCKED",
            DeadlockError::Overflow(_) => "OVERFLOW",
            DeadlockError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            DeadlockError::Cancelled => "CANCELLED",
            DeadlockError::TimedOut(_) => "TIMED_OUT",
            DeadlockError::InvalidTransfer(_) => "INVALID_TRANSFER",
            DeadlockError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            DeadlockError::Store(_) => "STORE_ERROR",
        }
    }

    /// The conflict that exhausted the retry budget, if any
    pub fn last_conflict(&self) -> Option<&DeadlockError> {
        match self {
            DeadlockError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl From<StoreError> for DeadlockError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => DeadlockError::Conflict(e),
            StoreError::NotFound(id) => DeadlockError::AccountNotFound(id),
            other => DeadlockError::Store(other),
        }
    }
}
