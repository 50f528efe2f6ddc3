// backuptool/src/utils/singleflight.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Named single-flight locks.
///
/// The backup and retention-cleanup jobs both mutate the backup directory, so
/// they acquire the lock under the same key; a second trigger while one is in
/// flight is rejected instead of racing on shared files.
#[derive(Default)]
pub struct SingleFlight {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take the lock for `key` without waiting. Returns `None`
    /// when another holder is in flight; the guard releases the key on drop.
    pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().expect("singleflight registry poisoned");
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok()
    }
}
