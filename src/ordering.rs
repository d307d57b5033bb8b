//! Canonical lock ordering
//!
//! Every multi-resource acquisition in this crate goes through one of these
//! helpers so all callers agree on a single global order: ascending
//! [`AccountId`] for store rows, lexicographic for advisory resources.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::core_types::{AccountId, Transfer};
use crate::error::DeadlockError;

/// Lexicographically sorted, de-duplicated resource names.
pub fn canonical_resources<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_owned()).collect();
    names.sort_unstable();
    names.dedup();
    names
}

/// Net balance delta per distinct account across a batch.
///
/// Iterating the map yields accounts in canonical order. Accounts whose
/// deltas cancel out still appear (with zero) because they must be locked.
///
/// Fails with [`DeadlockError::Overflow`] naming the first account whose
/// running delta leaves the `Decimal` range.
pub fn net_deltas(
    transfers: &[Transfer],
) -> Result<BTreeMap<AccountId, Decimal>, DeadlockError> {
    let mut deltas = BTreeMap::new();
    for t in transfers {
        let from = deltas.entry(t.from_id).or_insert(Decimal::ZERO);
        *from = from
            .checked_sub(t.amount)
            .ok_or(DeadlockError::Overflow(t.from_id))?;

        let to = deltas.entry(t.to_id).or_insert(Decimal::ZERO);
        *to = to
            .checked_add(t.amount)
            .ok_or(DeadlockError::Overflow(t.to_id))?;
    }
    Ok(deltas)
}
