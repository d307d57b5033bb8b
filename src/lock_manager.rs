//! Resource Lock Manager
//!
//! In-process advisory locks over named resources. Acquisition is all or
//! nothing over the sorted name set and fails fast with
//! [`DeadlockError::AlreadyLocked`] instead of waiting, so callers retry
//! through their own backoff rather than queueing here.
//!
//! This is a layer above store row locks, not a replacement for them: it
//! only constrains callers that go through the same manager.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::DeadlockError;
use crate::ordering::canonical_resources;

#[derive(Debug, Default)]
pub struct ResourceLockManager {
    held: Mutex<HashSet<String>>,
}

/// Resources marked held; released on drop (success, error, panic or cancel)
struct HeldResources<'a> {
    manager: &'a ResourceLockManager,
    names: Vec<String>,
}

impl Drop for HeldResources<'_> {
    fn drop(&mut self) {
        let mut held = self.manager.held();
        for name in &self.names {
            held.remove(name);
        }
    }
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check-and-insert every resource under the manager mutex
    fn acquire<I, S>(&self, resource_ids: I) -> Result<HeldResources<'_>, DeadlockError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = canonical_resources(resource_ids);

        let mut held = self.held();
        if let Some(busy) = names.iter().find(|n| held.contains(n.as_str())) {
            debug!(resource = %busy, requested = names.len(), "Resource already locked");
            return Err(DeadlockError::AlreadyLocked(busy.clone()));
        }
        held.extend(names.iter().cloned());
        drop(held);

        Ok(HeldResources {
            manager: self,
            names,
        })
    }

    /// Run `f` while holding every resource in `resource_ids`.
    ///
    /// `f` runs outside the manager's mutex; the resources are released
    /// before this returns whatever `f` does.
    pub async fn with_ordered_locks<I, S, F, Fut, T>(
        &self,
        resource_ids: I,
        f: F,
    ) -> Result<T, DeadlockError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DeadlockError>>,
    {
        let _guard = self.acquire(resource_ids)?;
        f().await
    }

    /// Synchronous variant of [`with_ordered_locks`](Self::with_ordered_locks)
    pub fn with_ordered_locks_sync<I, S, F, T>(
        &self,
        resource_ids: I,
        f: F,
    ) -> Result<T, DeadlockError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce() -> Result<T, DeadlockError>,
    {
        let _guard = self.acquire(resource_ids)?;
        f()
    }

    pub fn is_held(&self, resource_id: &str) -> bool {
        self.held().contains(resource_id)
    }

    /// Number of resources currently held; zero between calls
    pub fn held_count(&self) -> usize {
        self.held().len()
    }
}
