//! Per-subscription mutual exclusion within one process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use shelfsync_core::SubscriptionId;

#[derive(Debug, Clone, Default)]
pub struct LockTable {
    held: Arc<Mutex<HashSet<SubscriptionId>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<SubscriptionId>> {
        self.held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Take the lock for `id`, or `None` if someone already holds it.
    pub fn try_lock(&self, id: &SubscriptionId) -> Option<LockGuard> {
        if !self.held().insert(id.clone()) {
            return None;
        }
        Some(LockGuard {
            table: self.clone(),
            id: id.clone(),
        })
    }

    pub fn is_locked(&self, id: &SubscriptionId) -> bool {
        self.held().contains(id)
    }

    pub fn len(&self) -> usize {
        self.held().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its id when dropped, whatever the outcome of the work it guarded.
#[derive(Debug)]
pub struct LockGuard {
    table: LockTable,
    id: SubscriptionId,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.held().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_fails_until_guard_drops() {
        let table = LockTable::new();
        let id = SubscriptionId::from("lib");

        let guard = table.try_lock(&id).expect("first lock");
        assert!(table.try_lock(&id).is_none());
        assert!(table.is_locked(&id));
        assert!(table.try_lock(&"other".into()).is_some());

        drop(guard);
        assert!(!table.is_locked(&id));
        assert!(table.is_empty());
    }

    #[test]
    fn guard_released_on_unwind() {
        let table = LockTable::new();
        let id = SubscriptionId::from("lib");
        let cloned = table.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_lock(&"lib".into()).expect("lock");
            panic!("sync blew up");
        });
        assert!(result.is_err());
        assert!(!table.is_locked(&id));
    }
}
