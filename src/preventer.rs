//! Deadlock Preventer
//!
//! Ordered-lock transfers. Every transaction locks its accounts with
//! `query_for_update` in ascending [`AccountId`] order, so two ordered
//! transfers can never wait on each other in a cycle, whatever the direction
//! of the money movement.
//!
//! # Precondition
//!
//! The guarantee holds between ordered operations only. Code that locks the
//! same rows in another order reintroduces the risk.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::core_types::{AccountId, Transfer};
use crate::error::DeadlockError;
use crate::ordering::net_deltas;
use crate::store::{Transaction, TransactionalStore, finish};

/// Executes transfers under the canonical lock order
pub struct DeadlockPreventer<S: ?Sized> {
    store: Arc<S>,
}

impl<S: TransactionalStore + ?Sized> DeadlockPreventer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Move `amount` from `from_id` to `to_id` atomically.
    pub async fn transfer_ordered(
        &self,
        from_id: AccountId,
        to_id: AccountId,
        amount: Decimal,
    ) -> Result<(), DeadlockError> {
        let transfer = Transfer::new(from_id, to_id, amount);
        transfer.validate().map_err(DeadlockError::InvalidTransfer)?;

        let mut tx = self.store.begin().await?;
        let result = apply_ordered_transfer(tx.as_mut(), &transfer).await;
        finish(tx, result).await?;

        debug!(
            from_id = from_id,
            to_id = to_id,
            amount = %amount,
            "Ordered transfer committed"
        );
        Ok(())
    }

    /// Apply a batch atomically: all transfers commit or none do.
    ///
    /// An empty batch is a no-op.
    pub async fn transfer_batch_ordered(&self, transfers: &[Transfer]) -> Result<(), DeadlockError> {
        validate_batch(transfers)?;
        if transfers.is_empty() {
            return Ok(());
        }

        let mut tx = self.store.begin().await?;
        let result = apply_ordered_batch(tx.as_mut(), transfers).await;
        finish(tx, result).await?;

        debug!(transfers = transfers.len(), "Ordered batch committed");
        Ok(())
    }
}

fn validate_batch(transfers: &[Transfer]) -> Result<(), DeadlockError> {
    transfers
        .iter()
        .try_for_each(Transfer::validate)
        .map_err(DeadlockError::InvalidTransfer)
}

/// Body of [`DeadlockPreventer::transfer_ordered`] inside a caller's transaction.
///
/// Lets callers wrap the ordered transfer in a
/// [`DeadlockDetector`](crate::detector::DeadlockDetector).
pub async fn apply_ordered_transfer(
    tx: &mut dyn Transaction,
    transfer: &Transfer,
) -> Result<(), DeadlockError> {
    transfer.validate().map_err(DeadlockError::InvalidTransfer)?;
    apply_ordered_deltas(tx, &net_deltas(std::slice::from_ref(transfer))?).await
}

/// Body of [`DeadlockPreventer::transfer_batch_ordered`] inside a caller's transaction.
pub async fn apply_ordered_batch(
    tx: &mut dyn Transaction,
    transfers: &[Transfer],
) -> Result<(), DeadlockError> {
    validate_batch(transfers)?;
    apply_ordered_deltas(tx, &net_deltas(transfers)?).await
}

/// Lock every account in ascending order, validate, then apply.
async fn apply_ordered_deltas(
    tx: &mut dyn Transaction,
    deltas: &BTreeMap<AccountId, Decimal>,
) -> Result<(), DeadlockError> {
    // Phase 1: lock in canonical order (BTreeMap iterates ascending)
    let mut balances = Vec::with_capacity(deltas.len());
    for (&id, &delta) in deltas {
        let balance = tx.query_for_update(id).await?;
        balances.push((id, balance, delta));
    }

    // Phase 2: nothing is written unless every result stays non-negative
    for &(id, balance, delta) in &balances {
        let Some(next) = balance.checked_add(delta) else {
            warn!(
                account_id = id,
                balance = %balance,
                delta = %delta,
                "Transfer rejected: balance overflow"
            );
            return Err(DeadlockError::Overflow(id));
        };
        if next < Decimal::ZERO {
            warn!(
                account_id = id,
                balance = %balance,
                delta = %delta,
                "Transfer rejected: insufficient funds"
            );
            return Err(DeadlockError::InsufficientFunds {
                account_id: id,
                balance,
                required: -delta,
            });
        }
    }

    // Phase 3: apply, still ascending
    for (id, _, delta) in balances {
        if !delta.is_zero() {
            tx.update_balance(id, delta).await?;
        }
    }
    Ok(())
}
