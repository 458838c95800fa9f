//! Mutual exclusion for cache mutations.
//!
//! Two layers:
//! - [`KeyLockRegistry`] serializes threads inside this process per logical key
//!   (`snapshot:{user}/{owner}/{repo}/{branch}` or `mirror:{owner}/{repo}`).
//! - [`MirrorLock`] is an flock on `locks/{owner}__{repo}.lock` so a second
//!   process sharing the cache directory cannot fetch into the same mirror.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fs2::FileExt;

/// Default lock timeout (5 minutes) - prevents indefinite hangs
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
struct KeyLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl KeyLock {
    fn state(&self) -> MutexGuard<'_, bool> {
        // A panicking holder still releases through Drop, so the flag is sound.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide map from key to an exclusive lock.
///
/// Entries are created on first use and kept for the life of the registry.
/// Owned by whoever constructs the store; there is no global instance.
#[derive(Debug, Default)]
pub struct KeyLockRegistry {
    locks: DashMap<String, Arc<KeyLock>>,
}

/// Holds a registry key until dropped.
#[derive(Debug)]
pub struct KeyGuard {
    lock: Arc<KeyLock>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut held = self.lock.state();
        *held = false;
        drop(held);
        self.lock.released.notify_one();
    }
}

impl KeyLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<KeyLock> {
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(key.to_string()).or_default().value())
    }

    /// Block until `key` is free, then take it.
    pub fn acquire(&self, key: &str) -> KeyGuard {
        let lock = self.entry(key);
        {
            let mut held = lock.state();
            while *held {
                held = lock
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *held = true;
        }
        KeyGuard { lock }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout` with
    /// `ErrorKind::TimedOut`.
    pub fn acquire_timeout(&self, key: &str, timeout: Duration) -> io::Result<KeyGuard> {
        let lock = self.entry(key);
        let start = Instant::now();
        {
            let mut held = lock.state();
            while *held {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("lock {} not acquired after {:?}", key, timeout),
                    ));
                }
                let (guard, _) = lock
                    .released
                    .wait_timeout(held, timeout - elapsed)
                    .unwrap_or_else(PoisonError::into_inner);
                held = guard;
            }
            *held = true;
        }
        Ok(KeyGuard { lock })
    }

    /// Take `key` only if nobody holds it.
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        let lock = self.entry(key);
        {
            let mut held = lock.state();
            if *held {
                return None;
            }
            *held = true;
        }
        Some(KeyGuard { lock })
    }

    /// Number of keys ever locked through this registry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// A guard that holds an exclusive flock on a mirror's lock file.
/// Lock is released when dropped.
#[derive(Debug)]
pub struct MirrorLock {
    file: File,
}

impl MirrorLock {
    /// Acquire an exclusive lock with a custom timeout.
    /// Returns an error with `ErrorKind::TimedOut` if the lock cannot be acquired
    /// within the specified duration.
    pub fn acquire_with_timeout(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        let file = open_lock_file(lock_path)?;

        // Try to acquire lock with polling and exponential backoff
        let start = Instant::now();
        let mut sleep_duration = Duration::from_millis(10);
        let max_sleep = Duration::from_millis(500);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("lock acquisition timed out after {:?}", timeout),
                        ));
                    }
                    std::thread::sleep(sleep_duration);
                    sleep_duration = (sleep_duration * 2).min(max_sleep);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to acquire lock without blocking.
    /// Returns None if lock is held elsewhere.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Option<Self>> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
}

impl Drop for MirrorLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
