//! Path-keyed advisory file locking.
//!
//! Every read-modify-write of a shared artifact (the task ledger, the
//! open-questions ledger, the history index) goes through a [`FileLock`].
//! The lock lives in a sibling `<file>.lock` so the guarded file itself can
//! be replaced atomically by rename while the lock is held.
//!
//! Locks are `flock`-style: each acquisition opens its own handle, so they
//! serialize threads inside one process as well as separate processes
//! sharing the filesystem.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskline::lock::FileLock;
//! use std::time::Duration;
//!
//! let lock = FileLock::new("tasks.md").with_timeout(Duration::from_secs(5));
//! let text = lock.with_lock(|| Ok(std::fs::read_to_string("tasks.md")?))?;
//! ```

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, trace};

use crate::error::{Result, TasklineError};

/// Default timeout for ledger status updates.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock file suffix.
const LOCK_SUFFIX: &str = ".lock";

/// First poll interval while waiting for a contended lock.
const INITIAL_POLL: Duration = Duration::from_millis(1);

/// Upper bound on the poll interval.
const MAX_POLL: Duration = Duration::from_millis(25);

/// Whether the lock is held exclusively or shared with other readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Single writer.
    Exclusive,
    /// Any number of readers, no writer.
    Shared,
}

/// Named lock guarding one file path.
#[derive(Debug, Clone)]
pub struct FileLock {
    target: PathBuf,
    timeout: Duration,
}

impl FileLock {
    /// Create a lock for `target` with the default timeout.
    #[must_use]
    pub fn new(target: impl AsRef<Path>) -> Self {
        Self {
            target: target.as_ref().to_path_buf(),
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set the acquisition timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The guarded file.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Acquisition timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Path of the sibling lock file.
    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        lock_file_path(&self.target)
    }

    /// Run `f` while holding the exclusive lock.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        with_lock(&self.target, self.timeout, f)
    }

    /// Run `f` while holding a shared lock.
    pub fn with_read_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        with_read_lock(&self.target, self.timeout, f)
    }
}

/// Run `f` under an exclusive lock on `path`.
///
/// Fails with [`TasklineError::LockTimeout`] without calling `f` when the
/// lock cannot be acquired within `timeout`. The lock is released when this
/// function returns, whether `f` succeeded, failed or panicked.
pub fn with_lock<T>(path: &Path, timeout: Duration, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = LockGuard::acquire(path, timeout, LockMode::Exclusive)?;
    f()
}

/// Run `f` under a shared lock on `path`.
pub fn with_read_lock<T>(
    path: &Path,
    timeout: Duration,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let _guard = LockGuard::acquire(path, timeout, LockMode::Shared)?;
    f()
}

/// Lock file path for a guarded file.
#[must_use]
pub fn lock_file_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(LOCK_SUFFIX);
    target.with_file_name(name)
}

/// Held lock; unlocks on drop.
#[derive(Debug)]
struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    fn acquire(target: &Path, timeout: Duration, mode: LockMode) -> Result<Self> {
        let path = lock_file_path(target);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let started = Instant::now();
        let deadline = started + timeout;
        let mut poll = INITIAL_POLL;

        loop {
            let attempt = match mode {
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
                LockMode::Shared => FileExt::try_lock_shared(&file),
            };

            match attempt {
                Ok(()) => {
                    trace!(
                        "Acquired {:?} lock on {} after {:?}",
                        mode,
                        path.display(),
                        started.elapsed()
                    );
                    return Ok(Self { file, path });
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Lock on {} still contended after {:?}", path.display(), timeout);
                return Err(TasklineError::LockTimeout {
                    path: target.to_path_buf(),
                    timeout,
                });
            }

            std::thread::sleep(poll.min(deadline - now));
            poll = (poll * 2).min(MAX_POLL);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to release lock on {}: {}", self.path.display(), e);
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
