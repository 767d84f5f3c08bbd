//! Cross-process advisory file lock.
//!
//! Every acquisition opens its own file description and takes an exclusive
//! `flock`-style lock on it, so the lock excludes other processes and other
//! threads of this process alike. Acquisition spins with a fixed wait and
//! gives up after a timeout; the timeout is reported to the caller and never
//! retried here.
//!
//! A process that dies while holding the lock releases it with its file
//! descriptors. Nothing records that it died, so state guarded by the lock
//! may be half-updated; the scheduler revalidates everything it reads.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::{AllocResult, AllocatorError};

/// Name of the lock file inside a record directory.
pub const LOCK_FILE_NAME: &str = ".lock";

/// A named lock file plus its acquisition policy.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    wait: Duration,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock backed by `path`, created on first acquisition.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, wait: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            wait,
        }
    }

    /// Lock file for a record directory.
    pub fn in_dir(dir: &Path, timeout: Duration, wait: Duration) -> Self {
        Self::new(dir.join(LOCK_FILE_NAME), timeout, wait)
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held or the timeout expires.
    ///
    /// Fails with an I/O `NotFound` error if the directory holding the lock
    /// file is gone.
    pub fn acquire(&self) -> AllocResult<FileLockGuard> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let started = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => {
                    return Ok(FileLockGuard {
                        file,
                        path: self.path.clone(),
                    })
                }
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(err)) => return Err(err.into()),
            }
            let waited = started.elapsed();
            if waited >= self.timeout {
                return Err(AllocatorError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            thread::sleep(self.wait.min(self.timeout - waited));
        }
    }
}

impl FileLockGuard {
    /// Path of the held lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(lock = %self.path.display(), %err, "failed to release file lock");
        }
    }
}
