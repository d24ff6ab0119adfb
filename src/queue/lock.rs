//! Advisory lock files.
//!
//! A lock is a companion file whose exclusive creation claims ownership.
//! Nothing checks whether the owner is still alive: a process killed while
//! holding a lock leaves it behind until bulk cleanup removes it, unless a
//! lease is configured.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::Result;

/// Exclusive ownership of a lock file.
///
/// Dropping an unreleased lock removes the file, so a unit whose processing
/// failed before retirement becomes claimable again.
#[derive(Debug)]
pub struct AdvisoryLock {
    path: PathBuf,
    released: bool,
}

impl AdvisoryLock {
    /// Try to create the lock file without blocking.
    ///
    /// Returns `Ok(None)` when another holder owns it. With `lease` set, a
    /// lock file older than the lease is broken and acquisition retried once.
    ///
    /// Breakers serialize on a companion `<lock>.break.lock` file and re-check
    /// the age under it, so a lock re-created by a faster breaker is never
    /// broken a second time. An orphaned guard keeps its lock unbreakable until
    /// bulk cleanup removes every `*.lock` file.
    ///
    /// # Errors
    ///
    /// Returns an IO error for anything other than "already exists".
    pub fn try_acquire<P: AsRef<Path>>(path: P, lease: Option<Duration>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if let Some(lock) = Self::create_exclusive(path)? {
            return Ok(Some(lock));
        }
        match lease {
            Some(lease) if Self::is_expired(path, lease) => Self::break_stale(path, lease),
            _ => Ok(None),
        }
    }

    fn break_stale(path: &Path, lease: Duration) -> Result<Option<Self>> {
        let Some(guard) = Self::create_exclusive(&break_guard_path(path))? else {
            debug!(lock = %path.display(), "lock being broken elsewhere");
            return Ok(None);
        };
        if !Self::is_expired(path, lease) {
            guard.release()?;
            return Ok(None);
        }
        warn!(lock = %path.display(), "breaking lock older than lease");
        remove_if_present(path)?;
        let lock = Self::create_exclusive(path);
        guard.release()?;
        lock
    }

    fn create_exclusive(path: &Path) -> Result<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                // Holder identity is informational only.
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    released: false,
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(lock = %path.display(), "lock held elsewhere");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_expired(path: &Path, lease: Duration) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > lease)
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock by deleting its file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file exists but cannot be removed.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_if_present(&self.path)
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_if_present(&self.path) {
                warn!(lock = %self.path.display(), error = %e, "failed to release lock on drop");
            }
        }
    }
}

fn break_guard_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".break.lock");
    PathBuf::from(name)
}

/// Delete a file, treating absence as success.
pub(crate) fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.params.lock");

        let first = AdvisoryLock::try_acquire(&path, None).unwrap();
        assert!(first.is_some());
        assert!(AdvisoryLock::try_acquire(&path, None).unwrap().is_none());

        first.unwrap().release().unwrap();
        assert!(!path.exists());
        assert!(AdvisoryLock::try_acquire(&path, None).unwrap().is_some());
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.dot.lock");
        {
            let _lock = AdvisoryLock::try_acquire(&path, None).unwrap().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_orphaned_lock_stays_stuck_without_lease() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orphan.params.lock");
        fs::write(&path, "4242\n").unwrap();

        assert!(AdvisoryLock::try_acquire(&path, None).unwrap().is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_lease_breaks_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.params.lock");
        fs::write(&path, "4242\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let lock = AdvisoryLock::try_acquire(&path, Some(Duration::from_millis(1))).unwrap();
        assert!(lock.is_some());
    }

    #[test]
    fn test_fresh_lock_survives_lease_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.params.lock");
        let held = AdvisoryLock::try_acquire(&path, None).unwrap().unwrap();

        assert!(AdvisoryLock::try_acquire(&path, Some(Duration::from_secs(60)))
            .unwrap()
            .is_none());
        assert!(path.exists());
        assert!(!break_guard_path(&path).exists());
        held.release().unwrap();
    }

    #[test]
    fn test_pending_break_blocks_other_breakers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.dot.lock");
        fs::write(&path, "4242\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(break_guard_path(&path), "").unwrap();

        assert!(AdvisoryLock::try_acquire(&path, Some(Duration::from_millis(1)))
            .unwrap()
            .is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_release_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.lock");
        let lock = AdvisoryLock::try_acquire(&path, None).unwrap().unwrap();
        fs::remove_file(&path).unwrap();
        assert!(lock.release().is_ok());
    }
}
