use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

/// Per-entity exclusive locks. Operations on different keys never contend.
///
/// When both are needed, the auction lock is always taken before the application lock.
/// An entry lives only while someone holds or waits on it.
#[derive(Debug)]
pub struct EntityLocks<K> {
    table: LockTable<K>,
}

impl<K> Default for EntityLocks<K> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> EntityLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub async fn lock(&self, key: &K) -> EntityGuard<K> {
        let lock = {
            let mut table = self.table.lock().expect("lock table poisoned");
            table.entry(key.clone()).or_default().clone()
        };
        EntityGuard {
            guard: Some(lock.lock_owned().await),
            key: key.clone(),
            table: self.table.clone(),
        }
    }

    /// Keys with a live entry.
    pub fn tracked(&self) -> usize {
        self.table.lock().expect("lock table poisoned").len()
    }
}

/// Holds one entity's lock; the table entry is dropped with the last holder or waiter.
pub struct EntityGuard<K>
where
    K: Eq + Hash,
{
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    table: LockTable<K>,
}

impl<K> Drop for EntityGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock().expect("lock table poisoned");
        // Waiters clone the entry under this same table lock, so a count of one is final.
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.key);
        }
    }
}
