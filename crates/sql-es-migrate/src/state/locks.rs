//! Per-mapping mutual exclusion shared by jobs and CDC cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per mapping name. The guard releases on drop.
#[derive(Default)]
pub struct MappingLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MappingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, mapping: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(mapping.to_string()).or_default().clone()
    }

    /// Wait for the mapping to be free.
    pub async fn lock(&self, mapping: &str) -> OwnedMutexGuard<()> {
        self.slot(mapping).lock_owned().await
    }

    /// Take the mapping if it is free right now.
    pub fn try_lock(&self, mapping: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(mapping).try_lock_owned().ok()
    }

    pub fn is_locked(&self, mapping: &str) -> bool {
        self.slot(mapping).try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let locks = MappingLocks::new();
        let guard = locks.lock("orders").await;
        assert!(locks.try_lock("orders").is_none());
        assert!(locks.try_lock("customers").is_some());
        drop(guard);
        assert!(locks.try_lock("orders").is_some());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = Arc::new(MappingLocks::new());
        let guard = locks.lock("orders").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("orders").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert!(!locks.is_locked("orders"));
    }
}
