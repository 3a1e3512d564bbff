//! Local-mode serialization lock.
//!
//! Every locally-hosted serving endpoint binds the same port, so tests that
//! deploy one must not overlap, even when the test runner executes them in
//! parallel threads or processes. The lock is an exclusive OS advisory lock on
//! a shared file. Release is deferred by [`LockConfig::release_delay`] so the
//! previous server has time to let go of the port.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LockConfig;

/// Failure to open or lock the lock file.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock file (or its parent directory) could not be created or opened.
    #[error("failed to open lock file {}: {source}", path.display())]
    Open {
        /// Lock file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The exclusive lock could not be taken.
    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Blocking, file-backed mutual exclusion for local-mode tests.
#[derive(Debug, Clone)]
pub struct LocalModeLock {
    config: LockConfig,
}

impl LocalModeLock {
    /// Lock backed by `config.path`.
    #[must_use]
    pub fn new(config: LockConfig) -> Self {
        Self { config }
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Block until the lock is held exclusively.
    ///
    /// There is no timeout. The returned guard releases the lock on drop,
    /// after the configured release delay.
    ///
    /// # Errors
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn acquire(&self) -> Result<LocalModeLockGuard, LockError> {
        let path = &self.config.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "waiting for local mode lock");
        file.lock().map_err(|source| LockError::Lock {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "local mode lock acquired");

        Ok(LocalModeLockGuard {
            file,
            path: path.clone(),
            release_delay: self.config.release_delay,
        })
    }
}

/// Holds the local-mode lock until dropped.
///
/// Dropping sleeps for the release delay and then unlocks. This runs on every
/// exit path, including unwinding out of the protected section.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LocalModeLockGuard {
    file: File,
    path: PathBuf,
    release_delay: Duration,
}

impl LocalModeLockGuard {
    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalModeLockGuard {
    fn drop(&mut self) {
        if !self.release_delay.is_zero() {
            std::thread::sleep(self.release_delay);
        }
        // Closing the descriptor would release the lock too; unlock explicitly
        // so a failure is at least visible in the logs.
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to unlock local mode lock");
        } else {
            debug!(path = %self.path.display(), "local mode lock released");
        }
    }
}

/// Run `body` while holding the local-mode lock.
///
/// The lock is released (after the delay) whether `body` returns or panics.
///
/// # Errors
/// Returns an error if the lock cannot be acquired; `body` is not run then.
pub fn with_local_mode_lock<T, F>(config: &LockConfig, body: F) -> Result<T, LockError>
where
    F: FnOnce() -> T,
{
    let _guard = LocalModeLock::new(config.clone()).acquire()?;
    Ok(body())
}
