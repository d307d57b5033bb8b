//! Deadlock Detector
//!
//! Generic retry driver around a transactional unit of work.
//!
//! # Loop
//!
//! ```text
//! ┌─────────┐   ┌──────────┐   ok   ┌────────┐
//! │  begin  │──▶│ op(tx)   │──────▶│ commit │──▶ Ok
//! └─────────┘   └──────────┘        └────────┘
//!      ▲              │ err              │ conflict
//!      │              ▼                  ▼
//!      │        ┌──────────┐  other  ┌────────┐
//!      │        │ rollback │───────▶│  Err   │
//!      │        └──────────┘        └────────┘
//!      │              │ conflict
//!      │   backoff    ▼
//!      └──────── retries left? ── no ──▶ RetriesExhausted
//! ```
//!
//! Only conflicts are retried. Cancellation is checked before each begin and
//! raced against begin, the operation and the backoff sleep; an open
//! transaction is always rolled back before returning.

mod backoff;

pub use backoff::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conflict::{ConflictClassifier, SqlStateClassifier};
use crate::error::DeadlockError;
use crate::logging::TRACE_TARGET;
use crate::monitor::DeadlockMonitor;
use crate::store::{Transaction, TransactionalStore, finish};

/// Future returned by a unit of work borrowing a live transaction
pub type TxFuture<'t, T> = BoxFuture<'t, Result<T, DeadlockError>>;

/// Cancellation signal and optional deadline for one driver call.
///
/// The deadline starts counting when [`CancelScope::with_timeout`] is called.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope that expires `timeout` from now
    pub fn timeout(timeout: Duration) -> Self {
        Self::new().with_timeout(timeout)
    }

    /// Scope cancelled by `token`
    pub fn token(token: CancellationToken) -> Self {
        Self::new().with_token(token)
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self.timeout = timeout;
        self
    }

    /// Fail immediately if the scope has already fired
    pub fn check(&self) -> Result<(), DeadlockError> {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(DeadlockError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(DeadlockError::TimedOut(self.timeout));
        }
        Ok(())
    }

    /// Resolves when the scope fires; pending forever for an empty scope
    pub async fn fired(&self) -> DeadlockError {
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => DeadlockError::Cancelled,
            _ = expired => DeadlockError::TimedOut(self.timeout),
        }
    }
}

/// Retries conflicting transactions with capped, jittered exponential backoff
pub struct DeadlockDetector<S: ?Sized> {
    store: Arc<S>,
    policy: RetryPolicy,
    monitor: Arc<DeadlockMonitor>,
    classifier: Arc<dyn ConflictClassifier>,
}

impl<S: TransactionalStore + ?Sized> DeadlockDetector<S> {
    pub fn new(store: Arc<S>, policy: RetryPolicy, monitor: Arc<DeadlockMonitor>) -> Self {
        Self {
            store,
            policy,
            monitor,
            classifier: Arc::new(SqlStateClassifier),
        }
    }

    /// Replace the default SQLSTATE classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn ConflictClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<DeadlockMonitor> {
        &self.monitor
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` in a fresh transaction, retrying conflicts.
    ///
    /// The number of attempts made is visible only through the monitor.
    pub async fn execute_with_retry<T, F>(&self, op: F) -> Result<T, DeadlockError>
    where
        F: for<'t> FnMut(&'t mut dyn Transaction) -> TxFuture<'t, T> + Send,
        T: Send,
    {
        self.run(&CancelScope::new(), op).await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry), aborting with
    /// `Cancelled`/`TimedOut` as soon as `scope` fires.
    pub async fn execute_with_timeout<T, F>(
        &self,
        scope: CancelScope,
        op: F,
    ) -> Result<T, DeadlockError>
    where
        F: for<'t> FnMut(&'t mut dyn Transaction) -> TxFuture<'t, T> + Send,
        T: Send,
    {
        self.run(&scope, op).await
    }

    async fn run<T, F>(&self, scope: &CancelScope, mut op: F) -> Result<T, DeadlockError>
    where
        F: for<'t> FnMut(&'t mut dyn Transaction) -> TxFuture<'t, T> + Send,
        T: Send,
    {
        let mut attempt: u32 = 0;

        loop {
            scope.check()?;

            let result = self.attempt_once(scope, &mut op).await;
            let is_retry = attempt > 0;

            let err = match result {
                Ok(value) => {
                    if is_retry {
                        self.monitor.record_retry(true);
                        debug!(
                            store = self.store.name(),
                            attempts = attempt + 1,
                            "Transaction succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if is_retry {
                self.monitor.record_retry(false);
            }
            if !self.classifier.is_conflict(&err) {
                return Err(err);
            }
            self.monitor.record_deadlock();

            if attempt >= self.policy.max_retries {
                warn!(
                    store = self.store.name(),
                    attempts = attempt + 1,
                    error = %err,
                    "Conflict retries exhausted"
                );
                return Err(DeadlockError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.backoff(attempt);
            debug!(
                target: TRACE_TARGET,
                store = self.store.name(),
                attempt = attempt,
                delay_us = delay.as_micros() as u64,
                error = %err,
                "Conflict detected, backing off"
            );

            tokio::select! {
                biased;
                fired = scope.fired() => return Err(fired),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn attempt_once<T, F>(&self, scope: &CancelScope, op: &mut F) -> Result<T, DeadlockError>
    where
        F: for<'t> FnMut(&'t mut dyn Transaction) -> TxFuture<'t, T> + Send,
        T: Send,
    {
        let mut tx = tokio::select! {
            biased;
            fired = scope.fired() => return Err(fired),
            begun = self.store.begin() => begun?,
        };

        let result = tokio::select! {
            biased;
            fired = scope.fired() => Err(fired),
            done = op(tx.as_mut()) => done,
        };

        finish(tx, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn detector(max_retries: u32) -> DeadlockDetector<MemoryStore> {
        let store = Arc::new(MemoryStore::with_balances([(1, Decimal::from(100))]));
        let policy = RetryPolicy::new()
            .with_max_retries(max_retries)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5));
        DeadlockDetector::new(store, policy, Arc::new(DeadlockMonitor::new()))
    }

    #[tokio::test]
    async fn test_first_try_success_records_nothing() {
        let d = detector(3);
        let balance = d
            .execute_with_retry(|tx| {
                Box::pin(async move { Ok::<_, DeadlockError>(tx.query_for_update(1).await?) })
            })
            .await
            .unwrap();
        assert_eq!(balance, Decimal::from(100));

        let stats = d.monitor().statistics();
        assert_eq!(stats.deadlock_count, 0);
        assert_eq!(stats.total_retries, 0);
    }

    #[tokio::test]
    async fn test_conflict_then_success() {
        let d = detector(5);
        let calls = AtomicU32::new(0);

        d.execute_with_retry(|tx| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tx.update_balance(1, Decimal::ONE).await?;
                if n < 2 {
                    return Err(StoreError::deadlock("deadlock detected").into());
                }
                Ok::<_, DeadlockError>(())
            })
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            d.store().balance(1),
            Some(Decimal::from(101)),
            "Failed attempts must be rolled back"
        );
        let stats = d.monitor().statistics();
        assert_eq!(stats.deadlock_count, 2);
        assert_eq!(stats.total_retries, 2);
        assert_eq!(stats.successful_retries, 1);
    }

    #[tokio::test]
    async fn test_non_conflict_is_not_retried() {
        let d = detector(5);
        let calls = AtomicU32::new(0);

        let err = d
            .execute_with_retry(|_tx| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    Err::<(), _>(DeadlockError::InvalidTransfer("bad".into()))
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DeadlockError::InvalidTransfer(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.monitor().statistics().deadlock_count, 0);
    }

    #[tokio::test]
    async fn test_commit_conflict_is_retried() {
        let d = detector(3);
        d.store().inject_commit_conflicts(2);

        d.execute_with_retry(|tx| {
            Box::pin(async move {
                tx.update_balance(1, Decimal::from(-10)).await?;
                Ok::<_, DeadlockError>(())
            })
        })
        .await
        .unwrap();

        assert_eq!(d.store().balance(1), Some(Decimal::from(90)));
        assert_eq!(d.monitor().statistics().deadlock_count, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let d = detector(3);
        let token = CancellationToken::new();
        token.cancel();

        let err = d
            .execute_with_timeout(CancelScope::token(token), |_tx| {
                Box::pin(async move { Ok::<_, DeadlockError>(()) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeadlockError::Cancelled));
    }

    #[tokio::test]
    async fn test_timeout_during_operation_rolls_back() {
        let d = detector(3);

        let err = d
            .execute_with_timeout(CancelScope::timeout(Duration::from_millis(20)), |tx| {
                Box::pin(async move {
                    tx.update_balance(1, Decimal::from(-50)).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, DeadlockError>(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DeadlockError::TimedOut(_)), "{err}");
        assert_eq!(d.store().balance(1), Some(Decimal::from(100)));
        assert_eq!(d.store().locked_rows(), 0, "No transaction left open");
    }
}
