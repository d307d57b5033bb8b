//! Conflict classification
//!
//! The retry driver only asks one question of an error: is it a conflict?
//! Stores with a different error surface plug in their own
//! [`ConflictClassifier`] without touching the retry loop.

use crate::error::DeadlockError;
use crate::store::{DEADLOCK_DETECTED, SERIALIZATION_FAILURE, StoreError};

/// Decides whether a failed attempt may be retried
pub trait ConflictClassifier: Send + Sync {
    fn is_conflict(&self, err: &DeadlockError) -> bool;
}

/// Default classifier for SQLSTATE-speaking stores.
///
/// The typed [`DeadlockError::Conflict`] signal is authoritative. Text
/// matching is a fallback for untyped driver failures only; business errors
/// are never inspected, so a user message containing "deadlock" stays
/// terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlStateClassifier;

impl ConflictClassifier for SqlStateClassifier {
    fn is_conflict(&self, err: &DeadlockError) -> bool {
        match err {
            DeadlockError::Conflict(_) => true,
            DeadlockError::Store(StoreError::Backend(msg)) => looks_like_conflict(msg),
            _ => false,
        }
    }
}

/// Classify with the default [`SqlStateClassifier`]
pub fn is_conflict_error(err: &DeadlockError) -> bool {
    SqlStateClassifier.is_conflict(err)
}

/// Codes count only in the `SQLSTATE <code>` form; a bare `40001` may be a port.
fn looks_like_conflict(msg: &str) -> bool {
    let tagged = |code: &str| msg.contains(&format!("SQLSTATE {code}"));
    if tagged(DEADLOCK_DETECTED) || tagged(SERIALIZATION_FAILURE) {
        return true;
    }
    let lower = msg.to_ascii_lowercase();
    lower.contains("deadlock detected") || lower.contains("could not serialize access")
}
