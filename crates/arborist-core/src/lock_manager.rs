//! Per-class read-write lock manager.
//!
//! Grounded on `rate_limiter.rs`'s `DashMap<IpAddr, ...>` keyed-state idiom and
//! `tool_policy/layers.rs`'s `Mutex<HashMap<...>>` per-key concurrency pattern,
//! generalized from per-key exclusion to a genuine per-key read-write lock: many
//! readers of the same class proceed concurrently, a writer excludes everyone else
//! on that class, and classes never contend with each other.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct ClassLockManager {
    locks: DashMap<(String, String), Arc<RwLock<()>>>,
}

impl ClassLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, project_key: &str, class_name: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry((project_key.to_string(), class_name.to_string()))
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Run `f` with a shared read lock on `(project_key, class_name)`. Other readers
    /// of the same class may run concurrently; a writer excludes all of them.
    pub async fn read_class<F, Fut, T>(&self, project_key: &str, class_name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(project_key, class_name);
        let _guard = lock.read().await;
        f().await
    }

    /// Run `f` with an exclusive write lock on `(project_key, class_name)`.
    pub async fn write_class<F, Fut, T>(&self, project_key: &str, class_name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(project_key, class_name);
        let _guard = lock.write().await;
        f().await
    }

    /// Number of distinct `(project, class)` keys currently tracked. Locks are
    /// created lazily and never evicted; this is exposed mainly for tests.
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }
}
