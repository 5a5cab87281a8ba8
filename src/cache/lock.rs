use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use tracing::warn;

use crate::error::{Error, Result};

/// Exclusive lock backed by `Mutex<bool>` + `Condvar`.
struct QueryLock {
    held: Mutex<bool>,
    wake: Condvar,
}

impl QueryLock {
    fn new() -> Self {
        QueryLock {
            held: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::LockPoisoned("query lock"))?;
        while *held {
            held = self
                .wake
                .wait(held)
                .map_err(|_| Error::LockPoisoned("query lock"))?;
        }
        *held = true;
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::LockPoisoned("query lock"))?;
        if *held {
            *held = false;
            self.wake.notify_one();
        }
        Ok(())
    }
}

/// One lock per query fingerprint, created on demand and dropped once no
/// caller holds or waits on it.
#[derive(Default)]
pub(crate) struct QueryLocks {
    locks: Mutex<HashMap<String, Arc<QueryLock>>>,
}

impl QueryLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `key` is held by the caller.
    pub(crate) fn acquire(&self, key: &str) -> Result<QueryGuard<'_>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| Error::LockPoisoned("query lock map"))?;
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(QueryLock::new())),
            )
        };
        lock.lock()?;
        Ok(QueryGuard {
            owner: self,
            key: key.to_string(),
            lock,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

/// Releases its query lock on drop.
pub(crate) struct QueryGuard<'a> {
    owner: &'a QueryLocks,
    key: String,
    lock: Arc<QueryLock>,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            warn!(query = %self.key, error = %err, "failed to release query lock");
        }
        if let Ok(mut locks) = self.owner.locks.lock() {
            // The map and this guard are the only owners: nobody is waiting.
            if Arc::strong_count(&self.lock) == 2 {
                locks.remove(&self.key);
            }
        }
    }
}
