//! Deadlock Simulator
//!
//! Verification harness only. Deliberately locks two accounts in opposite
//! orders from two concurrent transactions so the store's own cycle detector
//! fires. Nothing in the prevention or retry path calls into this module.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::info;

use crate::core_types::AccountId;
use crate::error::DeadlockError;
use crate::store::{TransactionalStore, finish};

pub struct DeadlockSimulator<S: ?Sized> {
    store: Arc<S>,
    /// Pause between the first and second lock of each transaction
    lock_delay: Duration,
}

impl<S: TransactionalStore + ?Sized> DeadlockSimulator<S> {
    pub fn new(store: Arc<S>, lock_delay: Duration) -> Self {
        Self { store, lock_delay }
    }

    /// Transfer `amt_a` A→B and `amt_b` B→A concurrently, each locking its
    /// source first.
    ///
    /// Returns `Ok(())` only if both transactions committed; otherwise the
    /// first failure, which is a conflict when the store detected the cycle.
    pub async fn simulate_classic_deadlock(
        &self,
        id_a: AccountId,
        id_b: AccountId,
        amt_a: Decimal,
        amt_b: Decimal,
    ) -> Result<(), DeadlockError> {
        let (forward, backward) = tokio::join!(
            self.unordered_transfer(id_a, id_b, amt_a),
            self.unordered_transfer(id_b, id_a, amt_b),
        );

        info!(
            store = self.store.name(),
            forward = ?forward.as_ref().err().map(DeadlockError::code),
            backward = ?backward.as_ref().err().map(DeadlockError::code),
            "Classic deadlock simulation finished"
        );

        forward.and(backward)
    }

    /// Lock `first` then `second` with a pause in between, no ordering discipline
    async fn unordered_transfer(
        &self,
        first: AccountId,
        second: AccountId,
        amount: Decimal,
    ) -> Result<(), DeadlockError> {
        let mut tx = self.store.begin().await?;
        let result = async {
            tx.query_for_update(first).await?;
            tokio::time::sleep(self.lock_delay).await;
            tx.query_for_update(second).await?;
            tx.update_balance(first, -amount).await?;
            tx.update_balance(second, amount).await?;
            Ok::<_, DeadlockError>(())
        }
        .await;
        finish(tx, result).await
    }
}
