use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{InstructorId, RoomId};

/// Something a check-then-commit sequence must hold exclusively.
/// Rooms order before instructors, so every caller locks in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Room(RoomId),
    Instructor(InstructorId),
}

/// Advisory locks keyed by room and instructor.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Guards held until dropped.
pub struct LockSet {
    keys: Vec<LockKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockSet {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }

    /// Whether every one of `keys` is already held by this set.
    pub fn covers(&self, keys: &[LockKey]) -> bool {
        keys.iter().all(|key| self.keys.binary_search(key).is_ok())
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key, in sorted order to prevent deadlocks.
    pub async fn acquire(&self, keys: impl IntoIterator<Item = LockKey>) -> LockSet {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let wait_start = Instant::now();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.locks.entry(*key).or_default().value().clone();
            guards.push(lock.lock_owned().await);
        }
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());

        LockSet {
            keys,
            _guards: guards,
        }
    }
}
