//! Per-task exclusivity across processes.
//!
//! Each (location, name) pair maps to a lock file under a shared directory.
//! Names are task names (`submit`, `parse3`, ...) plus [`PASS_LOCK`].
//! Locks are advisory `flock`s taken with `LOCK_NB`, so a held lock is reported
//! as [`Acquire::Busy`] immediately instead of blocking the caller. The kernel
//! drops the lock when the descriptor closes, which covers both an orderly
//! [`TaskLock::release`] and a process that dies while holding it.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Guards pass transitions (resubmit, finalize) for a location.
pub const PASS_LOCK: &str = "passes";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to create lock directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to open lock file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to lock {}: {source}", path.display())]
    Lock { path: PathBuf, source: io::Error },
}

#[derive(Debug)]
pub enum Acquire {
    Acquired(TaskLock),
    Busy,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn lock_path(&self, location: &str, name: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.lock", sanitize_for_path(location), sanitize_for_path(name)))
    }

    /// Takes the lock for `name` at `location` or reports it busy. Never waits.
    pub fn try_acquire(&self, location: &str, name: &str) -> Result<Acquire, LockError> {
        fs::create_dir_all(&self.dir)
            .map_err(|source| LockError::CreateDir { path: self.dir.clone(), source })?;

        let path = self.lock_path(location, name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Open { path: path.clone(), source })?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Acquire::Acquired(TaskLock { file, path, name: name.to_string() })),
            Err(err) if is_contended(&err) => Ok(Acquire::Busy),
            Err(source) => Err(LockError::Lock { path, source }),
        }
    }
}

/// Held exclusivity for one name. Dropping it releases the lock too.
#[derive(Debug)]
pub struct TaskLock {
    file: File,
    path: PathBuf,
    name: String,
}

impl TaskLock {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        // Closing the descriptor below unlocks even if this fails.
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), %err, "explicit unlock failed");
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn sanitize_for_path(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}
