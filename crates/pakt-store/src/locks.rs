//! Per-token exclusive locks.
//!
//! A token placed into an ExoPak or RetroPak is locked at Response time and
//! released when its transaction reaches COMMITTED or ABORTED; a token
//! locked by transaction X cannot be selected by transaction Y. Callers
//! acquire in sorted token-id order, and `try_lock_all` enforces that so
//! two overlapping transactions cannot deadlock.

use std::collections::HashMap;
use std::sync::Mutex;

use pakt_core::error::PaktError;
use pakt_core::types::{TokenId, TransactionId};
use tracing::debug;

#[derive(Default)]
pub struct TokenLocks {
    inner: Mutex<HashMap<TokenId, TransactionId>>,
}

impl TokenLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every id for `tx`, all-or-nothing. Ids are taken in sorted
    /// order. Re-locking ids already held by the same transaction is a
    /// no-op, so retried Response processing stays idempotent.
    pub fn try_lock_all(&self, ids: &[TokenId], tx: TransactionId) -> Result<(), PaktError> {
        let mut sorted: Vec<&TokenId> = ids.iter().collect();
        sorted.sort();
        let mut held = self.inner.lock().expect("token lock table");
        for id in &sorted {
            if let Some(holder) = held.get(*id) {
                if *holder != tx {
                    return Err(PaktError::TokenLocked((*id).to_string()));
                }
            }
        }
        for id in sorted {
            held.insert(id.clone(), tx);
        }
        debug!(tx = %tx, count = ids.len(), "locked tokens");
        Ok(())
    }

    /// Release the ids held by `tx`. Ids locked by another transaction are
    /// left untouched.
    pub fn unlock_all(&self, ids: &[TokenId], tx: TransactionId) {
        let mut held = self.inner.lock().expect("token lock table");
        for id in ids {
            if held.get(id) == Some(&tx) {
                held.remove(id);
            }
        }
    }

    pub fn locked_by(&self, id: &TokenId) -> Option<TransactionId> {
        self.inner.lock().expect("token lock table").get(id).copied()
    }

    pub fn is_locked(&self, id: &TokenId) -> bool {
        self.locked_by(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pakt_core::types::Denomination;

    fn tid(index: u32) -> TokenId {
        TokenId::new("nyc", "batch1", Denomination::new(10).unwrap(), index).unwrap()
    }

    #[test]
    fn lock_is_all_or_nothing() {
        let locks = TokenLocks::new();
        let t1 = TransactionId::generate();
        let t2 = TransactionId::generate();

        locks.try_lock_all(&[tid(0), tid(1)], t1).unwrap();
        // t2 wants 1 and 2; 1 is taken, so 2 must stay free afterwards.
        assert!(locks.try_lock_all(&[tid(1), tid(2)], t2).is_err());
        assert!(!locks.is_locked(&tid(2)));
    }

    #[test]
    fn relock_by_same_transaction_is_idempotent() {
        let locks = TokenLocks::new();
        let t1 = TransactionId::generate();
        locks.try_lock_all(&[tid(0)], t1).unwrap();
        locks.try_lock_all(&[tid(0), tid(1)], t1).unwrap();
        assert_eq!(locks.locked_by(&tid(0)), Some(t1));
    }

    #[test]
    fn unlock_only_releases_own_locks() {
        let locks = TokenLocks::new();
        let t1 = TransactionId::generate();
        let t2 = TransactionId::generate();
        locks.try_lock_all(&[tid(0)], t1).unwrap();
        locks.try_lock_all(&[tid(1)], t2).unwrap();

        locks.unlock_all(&[tid(0), tid(1)], t1);
        assert!(!locks.is_locked(&tid(0)));
        assert_eq!(locks.locked_by(&tid(1)), Some(t2));
    }
}
