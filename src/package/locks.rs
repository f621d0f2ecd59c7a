use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

type Key = (String, String);

/// One async mutex per (title, source), so fetch/install of the same package never
/// overlaps while distinct packages proceed in parallel.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<Key, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn acquire(&self, title: &str, source: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(
                locks
                    .entry((title.to_string(), source.to_string()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }
}
