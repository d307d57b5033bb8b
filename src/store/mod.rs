//! Transactional store seam
//!
//! The ledger rows live in a store that provides atomic commit/rollback,
//! exclusive row locks through an explicit lock-for-update read, and a
//! distinguishable conflict (deadlock / serialization) failure.
//!
//! # Implementations
//!
//! - [`PgStore`] - PostgreSQL via sqlx, the production store
//! - [`MemoryStore`] - in-process store with row locks and a wait-for
//!   cycle detector, used for verification
//!
//! # Rollback Guarantee
//!
//! A [`Transaction`] dropped without `commit`/`rollback` is rolled back by
//! the implementation, so early returns, `?`, panics and cancelled futures
//! never leave a transaction open.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::core_types::{Account, AccountId};
use crate::error::DeadlockError;

/// SQLSTATE reported when the store's cycle detector aborts a transaction
pub const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE reported for serialization failures
pub const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE reported when a CHECK constraint fails
pub const CHECK_VIOLATION: &str = "23514";
/// SQLSTATE reported when a numeric value leaves the column's range
pub const NUMERIC_OUT_OF_RANGE: &str = "22003";

/// Failures surfaced by a store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Deadlock detected or serialization failure - the only retryable class
    #[error("{message} (SQLSTATE {code})")]
    Conflict { code: String, message: String },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Numeric value out of range: {0}")]
    OutOfRange(String),

    #[error("Account not found: {0}")]
    NotFound(AccountId),

    #[error("Transaction already finished")]
    Closed,

    /// Any other driver or I/O failure
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn deadlock(message: impl Into<String>) -> Self {
        StoreError::Conflict {
            code: DEADLOCK_DETECTED.to_string(),
            message: message.into(),
        }
    }

    pub fn serialization_failure(message: impl Into<String>) -> Self {
        StoreError::Conflict {
            code: SERIALIZATION_FAILURE.to_string(),
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A store able to open transactions over ledger accounts
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Begin a new transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Committed state of an account, without taking any lock
    async fn account(&self, id: AccountId) -> Result<Account, StoreError>;
}

/// A live store transaction
#[async_trait]
pub trait Transaction: Send {
    /// Read a balance and hold the row's exclusive lock until commit/rollback.
    async fn query_for_update(&mut self, id: AccountId) -> Result<Decimal, StoreError>;

    /// Add `delta` to a balance. Takes the row's exclusive lock if not held.
    async fn update_balance(&mut self, id: AccountId, delta: Decimal) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Commit on `Ok`, roll back on `Err`.
///
/// A failed rollback is logged and the original error is returned.
pub async fn finish<T>(
    mut tx: Box<dyn Transaction>,
    result: Result<T, DeadlockError>,
) -> Result<T, DeadlockError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!(error = %rb, original = %e, "Rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_constructors() {
        let e = StoreError::deadlock("deadlock detected");
        assert!(e.is_conflict());
        assert_eq!(e.to_string(), "deadlock detected (SQLSTATE 40P01)");

        let e = StoreError::serialization_failure("could not serialize access");
        assert!(e.is_conflict());

        assert!(!StoreError::ConstraintViolation("x".into()).is_conflict());
        assert!(!StoreError::Backend("deadlock".into()).is_conflict());
    }

    #[tokio::test]
    async fn test_finish_rolls_back_on_error() {
        let store = MemoryStore::with_balances([(1, Decimal::from(100))]);
        let mut tx = store.begin().await.unwrap();
        tx.update_balance(1, Decimal::from(-40)).await.unwrap();

        let result: Result<(), _> = finish(tx, Err(DeadlockError::Cancelled)).await;
        assert!(matches!(result, Err(DeadlockError::Cancelled)));
        assert_eq!(store.balance(1), Some(Decimal::from(100)));
    }

    #[tokio::test]
    async fn test_finish_commits_on_ok() {
        let store = MemoryStore::with_balances([(1, Decimal::from(100))]);
        let mut tx = store.begin().await.unwrap();
        tx.update_balance(1, Decimal::from(-40)).await.unwrap();

        finish(tx, Ok(())).await.unwrap();
        assert_eq!(store.balance(1), Some(Decimal::from(60)));
    }
}
