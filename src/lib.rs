//! Ledger Deadlock - prevention, detection and recovery for concurrent transfers
//!
//! Concurrency control for atomic multi-row updates to a shared ledger of
//! accounts held in a transactional store.
//!
//! # Modules
//!
//! - [`core_types`] - Account, Transfer and ID types
//! - [`ordering`] - Canonical lock order helpers
//! - [`store`] - Transactional store seam (PostgreSQL + in-memory)
//! - [`conflict`] - Conflict classification for retries
//! - [`preventer`] - Ordered-lock transfers (deadlock-free by construction)
//! - [`detector`] - Retry driver with backoff, jitter and cancellation
//! - [`lock_manager`] - In-process advisory locks, fail-fast
//! - [`monitor`] - Conflict and retry statistics
//! - [`simulator`] - Deliberate deadlocks for verification
//!
//! # Paths
//!
//! ```text
//!  happy path      ┌───────────────────┐
//! ───────────────▶│ DeadlockPreventer │──┐
//!                  └───────────────────┘  │   ┌────────────────────┐
//!  defensive path  ┌───────────────────┐  ├─▶│ TransactionalStore │
//! ───────────────▶│ DeadlockDetector  │──┘   └────────────────────┘
//!                  └─────────┬─────────┘
//!                            ▼
//!                  ┌───────────────────┐
//!                  │  DeadlockMonitor  │
//!                  └───────────────────┘
//! ```

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod conflict;
pub mod detector;
pub mod error;
pub mod lock_manager;
pub mod logging;
pub mod monitor;
pub mod ordering;
pub mod preventer;
pub mod simulator;
pub mod store;

// Convenient re-exports at crate root
pub use conflict::{ConflictClassifier, SqlStateClassifier, is_conflict_error};
pub use core_types::{Account, AccountId, Transfer};
pub use detector::{CancelScope, DeadlockDetector, RetryPolicy, TxFuture};
pub use error::DeadlockError;
pub use lock_manager::ResourceLockManager;
pub use monitor::{DeadlockMonitor, DeadlockStatistics};
pub use preventer::{DeadlockPreventer, apply_ordered_batch, apply_ordered_transfer};
pub use simulator::DeadlockSimulator;
pub use store::{MemoryStore, PgStore, StoreError, Transaction, TransactionalStore};
