//! In-memory transactional store
//!
//! Behaves like a row-locking database for the purposes of this crate:
//! exclusive row locks held until commit/rollback, lock waits, a wait-for
//! graph cycle check that aborts the requester with SQLSTATE `40P01`, and a
//! non-negative balance check at commit.
//!
//! Writes are buffered per transaction and applied atomically on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tracing::debug;

use super::{StoreError, Transaction, TransactionalStore};
use crate::core_types::{Account, AccountId, TxId};

#[derive(Default)]
struct State {
    accounts: BTreeMap<AccountId, Account>,
    /// Row -> transaction holding its exclusive lock
    owners: HashMap<AccountId, TxId>,
    /// Transaction -> row it is currently blocked on
    waits_for: HashMap<TxId, AccountId>,
}

impl State {
    /// Would `requester` waiting on a row held by `holder` close a cycle?
    fn would_deadlock(&self, requester: TxId, holder: TxId) -> bool {
        let mut current = holder;
        for _ in 0..=self.waits_for.len() {
            if current == requester {
                return true;
            }
            let Some(row) = self.waits_for.get(&current) else {
                return false;
            };
            let Some(&next) = self.owners.get(row) else {
                return false;
            };
            current = next;
        }
        false
    }

    fn release(&mut self, tx: TxId, rows: &[AccountId]) {
        for row in rows {
            if self.owners.get(row) == Some(&tx) {
                self.owners.remove(row);
            }
        }
        self.waits_for.remove(&tx);
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    released: Notify,
    next_tx: AtomicU64,
    commit_conflicts: AtomicU32,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory ledger store. Cloning shares the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `(id, balance)` pairs
    pub fn with_balances(balances: impl IntoIterator<Item = (AccountId, Decimal)>) -> Self {
        let store = Self::new();
        for (id, balance) in balances {
            store.insert_account(id, balance);
        }
        store
    }

    /// Insert or replace an account row
    pub fn insert_account(&self, id: AccountId, balance: Decimal) {
        self.shared
            .state()
            .accounts
            .insert(id, Account::new(id, balance));
    }

    /// Committed balance of an account
    pub fn balance(&self, id: AccountId) -> Option<Decimal> {
        self.shared.state().accounts.get(&id).map(|a| a.balance)
    }

    /// Committed balances of every account
    pub fn balances(&self) -> BTreeMap<AccountId, Decimal> {
        self.shared
            .state()
            .accounts
            .iter()
            .map(|(id, a)| (*id, a.balance))
            .collect()
    }

    /// Sum of all committed balances
    pub fn total_balance(&self) -> Decimal {
        self.shared
            .state()
            .accounts
            .values()
            .map(|a| a.balance)
            .sum()
    }

    /// Number of rows currently locked by open transactions
    pub fn locked_rows(&self) -> usize {
        self.shared.state().owners.len()
    }

    /// Fail the next `n` commits with a serialization failure.
    pub fn inject_commit_conflicts(&self, n: u32) {
        self.shared.commit_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.shared
            .commit_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            id,
            held: Vec::new(),
            pending: BTreeMap::new(),
            finished: false,
        }))
    }

    async fn account(&self, id: AccountId) -> Result<Account, StoreError> {
        self.shared
            .state()
            .accounts
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }
}

/// Transaction over a [`MemoryStore`]
pub struct MemoryTransaction {
    store: MemoryStore,
    id: TxId,
    held: Vec<AccountId>,
    /// Buffered balance deltas, applied on commit
    pending: BTreeMap<AccountId, Decimal>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Take the row's exclusive lock, waiting while another transaction holds it.
    async fn lock_row(&mut self, id: AccountId) -> Result<(), StoreError> {
        if self.held.contains(&id) {
            return Ok(());
        }
        let shared = Arc::clone(&self.store.shared);

        loop {
            let notified = shared.released.notified();
            tokio::pin!(notified);

            {
                let mut state = shared.state();
                if !state.accounts.contains_key(&id) {
                    state.waits_for.remove(&self.id);
                    return Err(StoreError::NotFound(id));
                }

                match state.owners.get(&id).copied() {
                    None => {
                        state.owners.insert(id, self.id);
                        state.waits_for.remove(&self.id);
                        self.held.push(id);
                        return Ok(());
                    }
                    Some(holder) => {
                        if state.would_deadlock(self.id, holder) {
                            state.waits_for.remove(&self.id);
                            debug!(
                                tx = self.id,
                                account_id = id,
                                holder = holder,
                                "Wait-for cycle detected, aborting requester"
                            );
                            return Err(StoreError::deadlock(format!(
                                "deadlock detected: transaction {} waits for account {} held by transaction {}",
                                self.id, id, holder
                            )));
                        }
                        state.waits_for.insert(self.id, id);
                        // Register before unlocking so a release in between is not missed
                        notified.as_mut().enable();
                    }
                }
            }

            notified.await;
        }
    }

    /// Release every lock and mark finished. Idempotent.
    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.store.shared.state().release(self.id, &self.held);
        self.held.clear();
        self.pending.clear();
        self.store.shared.released.notify_waiters();
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn query_for_update(&mut self, id: AccountId) -> Result<Decimal, StoreError> {
        self.ensure_open()?;
        self.lock_row(id).await?;

        let committed = self
            .store
            .shared
            .state()
            .accounts
            .get(&id)
            .map(|a| a.balance)
            .ok_or(StoreError::NotFound(id))?;
        let pending = self.pending.get(&id).copied().unwrap_or_default();
        committed.checked_add(pending).ok_or_else(|| {
            StoreError::OutOfRange(format!("balance of account {id} overflowed"))
        })
    }

    async fn update_balance(&mut self, id: AccountId, delta: Decimal) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.lock_row(id).await?;
        let pending = self.pending.entry(id).or_default();
        *pending = pending.checked_add(delta).ok_or_else(|| {
            StoreError::OutOfRange(format!("pending delta of account {id} overflowed"))
        })?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;

        if self.store.take_injected_conflict() {
            self.release();
            return Err(StoreError::serialization_failure(
                "could not serialize access due to concurrent update",
            ));
        }

        let outcome = {
            let mut state = self.store.shared.state();
            let violation = self.pending.iter().find_map(|(id, delta)| {
                let account = state.accounts.get(id)?;
                let Some(next) = account.balance.checked_add(*delta) else {
                    return Some(StoreError::OutOfRange(format!(
                        "balance of account {id} overflowed"
                    )));
                };
                (next < Decimal::ZERO).then(|| {
                    StoreError::ConstraintViolation(format!(
                        "balance of account {} would become {} (check balance >= 0)",
                        id, next
                    ))
                })
            });

            match violation {
                Some(err) => Err(err),
                None => {
                    // Every sum was checked above
                    for (id, delta) in &self.pending {
                        if let Some(account) = state.accounts.get_mut(id) {
                            account.balance += *delta;
                            account.version += 1;
                        }
                    }
                    Ok(())
                }
            }
        };

        self.release();
        outcome
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store() -> MemoryStore {
        MemoryStore::with_balances([(1, Decimal::from(100)), (2, Decimal::from(100))])
    }

    #[tokio::test]
    async fn test_commit_applies_and_bumps_version() {
        let store = store();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.query_for_update(1).await.unwrap(), Decimal::from(100));
        tx.update_balance(1, Decimal::from(-30)).await.unwrap();
        tx.update_balance(2, Decimal::from(30)).await.unwrap();
        assert_eq!(
            tx.query_for_update(1).await.unwrap(),
            Decimal::from(70),
            "Reads inside the transaction see its own writes"
        );
        assert_eq!(store.balance(1), Some(Decimal::from(100)));

        tx.commit().await.unwrap();
        let account = store.account(1).await.unwrap();
        assert_eq!(account.balance, Decimal::from(70));
        assert_eq!(account.version, 1);
        assert_eq!(store.locked_rows(), 0);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let store = store();

        let mut tx = store.begin().await.unwrap();
        tx.update_balance(1, Decimal::from(-30)).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.balance(1), Some(Decimal::from(100)));

        let mut tx = store.begin().await.unwrap();
        tx.update_balance(1, Decimal::from(-30)).await.unwrap();
        assert_eq!(store.locked_rows(), 1);
        drop(tx);
        assert_eq!(store.locked_rows(), 0, "Drop must release row locks");
        assert_eq!(store.balance(1), Some(Decimal::from(100)));
    }

    #[tokio::test]
    async fn test_writer_waits_for_row_lock() {
        let store = store();
        let mut first = store.begin().await.unwrap();
        first.update_balance(1, Decimal::from(-10)).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let waiter = tokio::spawn(async move {
            let balance = second.query_for_update(1).await;
            (second, balance)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "Second transaction must block");

        first.commit().await.unwrap();
        let (mut second, balance) = waiter.await.unwrap();
        assert_eq!(balance.unwrap(), Decimal::from(90));
        second.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_inverse_order_is_detected_as_deadlock() {
        let store = store();
        let mut tx_a = store.begin().await.unwrap();
        let mut tx_b = store.begin().await.unwrap();
        tx_a.query_for_update(1).await.unwrap();
        tx_b.query_for_update(2).await.unwrap();

        let blocked = tokio::spawn(async move {
            let r = tx_a.query_for_update(2).await;
            (tx_a, r)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = tx_b.query_for_update(1).await.unwrap_err();
        assert!(err.is_conflict(), "Expected deadlock, got {err}");
        assert!(err.to_string().contains("40P01"));

        tx_b.rollback().await.unwrap();
        let (mut tx_a, r) = blocked.await.unwrap();
        assert!(r.is_ok(), "Survivor acquires the lock after victim rolls back");
        tx_a.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_balance_violates_constraint() {
        let store = store();
        let mut tx = store.begin().await.unwrap();
        tx.update_balance(1, Decimal::from(-101)).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert_eq!(store.balance(1), Some(Decimal::from(100)));
        assert_eq!(store.locked_rows(), 0);
    }

    #[tokio::test]
    async fn test_overflow_is_an_error_not_a_panic() {
        let store = store();

        let mut tx = store.begin().await.unwrap();
        tx.update_balance(1, Decimal::MAX).await.unwrap();
        let err = tx.update_balance(1, Decimal::MAX).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange(_)), "{err}");
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.update_balance(2, Decimal::MAX).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange(_)), "{err}");

        assert_eq!(store.total_balance(), Decimal::from(200));
        assert_eq!(store.locked_rows(), 0);
    }

    #[tokio::test]
    async fn test_injected_commit_conflict() {
        let store = store();
        store.inject_commit_conflicts(1);

        let mut tx = store.begin().await.unwrap();
        tx.update_balance(1, Decimal::from(5)).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.balance(1), Some(Decimal::from(100)));

        let mut tx = store.begin().await.unwrap();
        tx.update_balance(1, Decimal::from(5)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.balance(1), Some(Decimal::from(105)));
    }

    #[tokio::test]
    async fn test_unknown_account_and_closed_transaction() {
        let store = store();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.query_for_update(42).await.unwrap_err(),
            StoreError::NotFound(42)
        );
        tx.commit().await.unwrap();
        assert_eq!(tx.commit().await.unwrap_err(), StoreError::Closed);
        assert!(store.account(42).await.is_err());
    }
}
