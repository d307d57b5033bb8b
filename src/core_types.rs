//! Core types used throughout the system
//!
//! Ledger rows and the transfer value object. Balances are `Decimal`
//! end to end so the store never sees floating point.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Account ID - unique and totally ordered.
///
/// # Constraints:
/// - **Orderable**: the canonical lock order is ascending `AccountId`
/// - Maps to PostgreSQL `BIGINT`
pub type AccountId = i64;

/// Transaction ID assigned by a store for lock bookkeeping
pub type TxId = u64;

/// A ledger account row as committed in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Never negative at a commit boundary
    pub balance: Decimal,
    /// Incremented on every committed write
    pub version: i64,
}

impl Account {
    pub fn new(id: AccountId, balance: Decimal) -> Self {
        Self {
            id,
            balance,
            version: 0,
        }
    }
}

/// Value transfer between two accounts.
///
/// Not persisted by this crate; the store may journal it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from_id: AccountId,
    pub to_id: AccountId,
    pub amount: Decimal,
}

impl Transfer {
    pub fn new(from_id: AccountId, to_id: AccountId, amount: impl Into<Decimal>) -> Self {
        Self {
            from_id,
            to_id,
            amount: amount.into(),
        }
    }

    /// Checks `amount > 0` and `from != to`.
    pub fn validate(&self) -> Result<(), String> {
        if self.amount <= Decimal::ZERO {
            return Err(format!(
                "amount must be greater than zero, got {}",
                self.amount
            ));
        }
        if self.from_id == self.to_id {
            return Err(format!(
                "source and target account cannot be the same ({})",
                self.from_id
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_validate() {
        assert!(Transfer::new(1, 2, 10).validate().is_ok());
        assert!(Transfer::new(1, 1, 10).validate().is_err());
        assert!(Transfer::new(1, 2, 0).validate().is_err());
        assert!(Transfer::new(1, 2, -5).validate().is_err());
    }

    #[test]
    fn test_new_account_starts_at_version_zero() {
        let account = Account::new(7, Decimal::from(100));
        assert_eq!(account.version, 0);
        assert_eq!(account.balance, Decimal::from(100));
    }
}
