//! Cross-process exclusive advisory lock guarding writes to the installed
//! package database (spec.md §5 "Cross-process exclusion").

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};
use crate::events::{EventSink, HandleEvent};

/// An acquired advisory lock on `metadir/lock`. Released on drop by the
/// wrapped [`Flock`], which `unlock`s automatically when dropped.
pub struct DbLock {
    #[allow(dead_code)]
    flock: Flock<File>,
    path: PathBuf,
}

impl DbLock {
    /// Path to the lockfile under `metadir`.
    #[must_use]
    pub fn path_for(metadir: &Path) -> PathBuf {
        metadir.join("lock")
    }

    /// Attempts to acquire the lock, first non-blocking; if another process
    /// already holds it, emits a `Warning` event and retries blocking.
    ///
    /// # Errors
    /// Returns [`Error::PermissionDenied`] if blocking acquisition still
    /// fails, or [`Error::IoFailure`] if the lockfile cannot be opened.
    pub fn acquire(metadir: &Path, events: &EventSink) -> Result<Self> {
        let path = Self::path_for(metadir);
        let file = OpenOptions::new().create(true).write(true).open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Self { flock, path }),
            Err((file, _)) => {
                (events)(HandleEvent::Warning {
                    pkgver: None,
                    message: format!("database lock at {} held by another process, waiting...", path.display()),
                });
                match Flock::lock(file, FlockArg::LockExclusive) {
                    Ok(flock) => Ok(Self { flock, path }),
                    Err((_, e)) => Err(Error::PermissionDenied(format!(
                        "failed to acquire database lock at {}: {e}",
                        path.display()
                    ))),
                }
            }
        }
    }

    /// Attempts to acquire the lock without ever blocking.
    ///
    /// # Errors
    /// Returns [`Error::Busy`] if another process holds the lock.
    pub fn try_acquire(metadir: &Path) -> Result<Self> {
        let path = Self::path_for(metadir);
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Self { flock, path }),
            Err((_, _)) => Err(Error::Busy(format!("database lock at {} is held", path.display()))),
        }
    }

    /// The lockfile path this guard holds.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
