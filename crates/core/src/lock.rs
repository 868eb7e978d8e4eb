//! Per-path mutual exclusion.
//!
//! A [`PathLockRegistry`] lazily creates one lock per distinct key and keeps
//! it for the registry's lifetime. Operations on different keys never block
//! each other; operations on the same key are serialized. The registry is
//! an ordinary value owned by whoever needs it (typically shared through an
//! `Arc`), so independent managers in the same process stay independent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// One lockable slot.
#[derive(Debug)]
pub struct PathLock {
    key: String,
    held: Mutex<bool>,
    released: Condvar,
}

impl PathLock {
    fn new(key: String) -> Self {
        Self {
            key,
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.held.lock().unwrap_or_else(|poisoned| {
            warn!(key = %self.key, "path lock mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn unlock(&self) {
        let mut held = self.state();
        *held = false;
        drop(held);
        self.released.notify_one();
    }
}

/// Registry of path locks, keyed by normalized path (or any string key).
#[derive(Debug, Default)]
pub struct PathLockRegistry {
    locks: Mutex<HashMap<String, Arc<PathLock>>>,
}

impl PathLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `path` is free, then take it.
    pub fn acquire(&self, path: impl AsRef<Path>) -> PathLockGuard {
        self.acquire_key(&lock_key(path.as_ref()))
    }

    /// Like [`acquire`](Self::acquire), but give up after `timeout`.
    pub fn try_acquire_for(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Option<PathLockGuard> {
        self.try_acquire_key_for(&lock_key(path.as_ref()), timeout)
    }

    /// Block until the lock for an arbitrary key is free, then take it.
    pub fn acquire_key(&self, key: &str) -> PathLockGuard {
        let lock = self.slot(key);
        {
            let mut held = lock.state();
            while *held {
                held = lock
                    .released
                    .wait(held)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            *held = true;
        }
        debug!(key, "acquired path lock");
        PathLockGuard {
            lock,
            released: false,
        }
    }

    /// Take the lock for `key`, waiting at most `timeout`.
    pub fn try_acquire_key_for(&self, key: &str, timeout: Duration) -> Option<PathLockGuard> {
        let lock = self.slot(key);
        let deadline = Instant::now() + timeout;
        {
            let mut held = lock.state();
            while *held {
                let now = Instant::now();
                if now >= deadline {
                    warn!(key, ?timeout, "timed out waiting for path lock");
                    return None;
                }
                let (guard, _) = lock
                    .released
                    .wait_timeout(held, deadline - now)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                held = guard;
            }
            *held = true;
        }
        debug!(key, "acquired path lock");
        Some(PathLockGuard {
            lock,
            released: false,
        })
    }

    /// Whether the lock for `path` is currently held.
    pub fn is_locked(&self, path: impl AsRef<Path>) -> bool {
        let key = lock_key(path.as_ref());
        let locks = self.registry();
        locks.get(&key).map(|l| *l.state()).unwrap_or(false)
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &str) -> Arc<PathLock> {
        let mut locks = self.registry();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(PathLock::new(key.to_string())))
            .clone()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<PathLock>>> {
        self.locks.lock().unwrap_or_else(|poisoned| {
            warn!("path lock registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Holds a path lock until released or dropped.
#[derive(Debug)]
pub struct PathLockGuard {
    lock: Arc<PathLock>,
    released: bool,
}

impl PathLockGuard {
    pub fn key(&self) -> &str {
        self.lock.key()
    }

    /// Release the lock. Calling this more than once is harmless.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.lock.unlock();
            debug!(key = %self.lock.key, "released path lock");
        }
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Normalize a path into a registry key.
///
/// Symlinks are resolved when the path (or its parent) exists, so that two
/// spellings of the same directory share one lock even before the
/// directory itself has been created.
pub fn lock_key(path: &Path) -> String {
    normalize_path(path).to_string_lossy().into_owned()
}

pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Ok(parent) = parent.canonicalize() {
            return parent.join(name);
        }
    }
    path.to_path_buf()
}
