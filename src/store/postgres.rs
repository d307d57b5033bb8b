//! PostgreSQL transactional store
//!
//! Rows live in the `accounts` table (see `sql/accounts.sql`). Row locks are
//! taken with `SELECT ... FOR UPDATE`; PostgreSQL's own deadlock detector
//! aborts one side of a cycle with SQLSTATE `40P01`.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row};

use super::{
    CHECK_VIOLATION, DEADLOCK_DETECTED, NUMERIC_OUT_OF_RANGE, SERIALIZATION_FAILURE, StoreError,
    Transaction, TransactionalStore,
};
use crate::core_types::{Account, AccountId};

/// Store backed by a PostgreSQL connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }

    async fn account(&self, id: AccountId) -> Result<Account, StoreError> {
        let row = sqlx::query("SELECT id, balance, version FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(StoreError::NotFound(id))?;

        Ok(Account {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            balance: row.try_get("balance").map_err(map_sqlx_error)?,
            version: row.try_get("version").map_err(map_sqlx_error)?,
        })
    }
}

/// Transaction over a pooled connection.
///
/// `sqlx::Transaction` rolls back on drop, which gives the rollback guarantee.
pub struct PgTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn conn(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query_for_update(&mut self, id: AccountId) -> Result<Decimal, StoreError> {
        let tx = self.conn()?;
        sqlx::query_scalar::<_, Decimal>("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_balance(&mut self, id: AccountId, delta: Decimal) -> Result<(), StoreError> {
        let tx = self.conn()?;
        let result = sqlx::query(
            "UPDATE accounts SET balance = balance + $1, version = version + 1 WHERE id = $2",
        )
        .bind(delta)
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Closed)?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(map_sqlx_error),
            None => Ok(()),
        }
    }
}

/// Map driver errors onto the store taxonomy by SQLSTATE.
pub fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        let code = db.code();
        match code.as_deref() {
            Some(c @ (DEADLOCK_DETECTED | SERIALIZATION_FAILURE)) => {
                return StoreError::Conflict {
                    code: c.to_string(),
                    message: db.message().to_string(),
                };
            }
            Some(CHECK_VIOLATION) => {
                return StoreError::ConstraintViolation(db.message().to_string());
            }
            Some(NUMERIC_OUT_OF_RANGE) => {
                return StoreError::OutOfRange(db.message().to_string());
            }
            _ => {}
        }
    }
    StoreError::Backend(e.to_string())
}
