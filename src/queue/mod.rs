//! Work Queue Protocol over a shared filesystem
//!
//! Every pipeline hop hands work from one process to another through named
//! files in a directory, with no broker and no persistent connection:
//!
//! ```text
//! publish:  <id>.<suffix>_temp ──rename──> <id>.<suffix>
//! claim:    create <id>.<suffix>.lock (non-blocking), re-check <id>.<suffix>
//! retire:   <id>.<suffix> ──rename──> <id>.<suffix>.<suffix>_processed
//!           delete transitional file, then delete the lock
//! ```
//!
//! The rename on publish guarantees consumers never observe a partial item.
//! The rename on retire removes the well-known name before the lock goes
//! away, so an identifier is never claimed again after retirement.
//!
//! ## Example
//!
//! ```rust
//! use graphoptima::queue::WorkQueue;
//!
//! # fn main() -> graphoptima::Result<()> {
//! let dir = std::env::temp_dir().join(format!("gq-doc-{}", std::process::id()));
//! std::fs::create_dir_all(&dir)?;
//! let queue = WorkQueue::new(&dir, "params");
//!
//! queue.publish("unit-a", b"1.5,0.3,100")?;
//! assert_eq!(queue.scan()?, vec!["unit-a".to_string()]);
//!
//! let claim = queue.claim("unit-a")?.expect("uncontended");
//! assert_eq!(claim.read_to_string()?, "1.5,0.3,100");
//! claim.retire()?;
//!
//! assert!(queue.claim("unit-a")?.is_none());
//! # std::fs::remove_dir_all(&dir)?;
//! # Ok(())
//! # }
//! ```

mod lock;

pub use lock::AdvisoryLock;
pub(crate) use lock::remove_if_present;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace};

use crate::Result;

/// One stage's queue: items named `<id>.<suffix>` inside `dir`.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    dir: PathBuf,
    suffix: String,
    lease: Option<Duration>,
}

impl WorkQueue {
    /// Create a queue over `dir` for items ending in `.<suffix>`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
            lease: None,
        }
    }

    /// Break locks older than `lease` on claim. `None` keeps the default
    /// contract where abandoned locks are never broken.
    #[must_use]
    pub const fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.lease = lease;
        self
    }

    /// Queue directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Item suffix without the leading dot.
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Well-known path of item `id`.
    #[must_use]
    pub fn item_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{}", self.suffix))
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{}_temp", self.suffix))
    }

    fn transitional_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{id}.{suffix}.{suffix}_processed", suffix = self.suffix))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{}.lock", self.suffix))
    }

    /// Atomically publish `payload` as item `id`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the temporary file cannot be written or renamed.
    pub fn publish(&self, id: &str, payload: &[u8]) -> Result<PathBuf> {
        let temp = self.temp_path(id);
        let target = self.item_path(id);
        fs::write(&temp, payload)?;
        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        trace!(item = %target.display(), "published");
        Ok(target)
    }

    /// List candidate identifiers in lexical order.
    ///
    /// Hidden files, temporaries, transitional files and locks never match
    /// because their names do not end in `.<suffix>`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be listed.
    pub fn scan(&self) -> Result<Vec<String>> {
        let tail = format!(".{}", self.suffix);
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(&tail) {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Try to claim item `id`.
    ///
    /// `Ok(None)` covers both contention (the lock is held) and an item that
    /// vanished between scan and lock; callers skip it and move on.
    ///
    /// # Errors
    ///
    /// Returns an IO error only for unexpected filesystem failures.
    pub fn claim(&self, id: &str) -> Result<Option<Claim>> {
        let Some(lock) = AdvisoryLock::try_acquire(self.lock_path(id), self.lease)? else {
            debug!(id, suffix = %self.suffix, "contended, skipping");
            return Ok(None);
        };
        let path = self.item_path(id);
        if !path.exists() {
            debug!(id, suffix = %self.suffix, "already handled elsewhere");
            lock.release()?;
            return Ok(None);
        }
        Ok(Some(Claim {
            id: id.to_string(),
            path,
            transitional: self.transitional_path(id),
            lock,
        }))
    }

    /// Claim, read and retire item `id` in one step.
    ///
    /// Returns `Ok(None)` if the item is absent or contended.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the item cannot be read or retired.
    pub fn take(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match self.claim(id)? {
            Some(claim) => {
                let content = claim.read()?;
                claim.retire()?;
                Ok(Some(content))
            }
            None => Ok(None),
        }
    }
}

/// Exclusive ownership of one queue item.
#[derive(Debug)]
pub struct Claim {
    id: String,
    path: PathBuf,
    transitional: PathBuf,
    lock: AdvisoryLock,
}

impl Claim {
    /// Identifier of the claimed item.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path of the claimed item.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the item content.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the item cannot be read.
    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }

    /// Read the item content as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the item cannot be read and
    /// [`crate::Error::MalformedArtifact`] if it is not UTF-8.
    pub fn read_to_string(&self) -> Result<String> {
        crate::artifact::read_text(&self.path)
    }

    /// Retire the item: rename it away, delete it, then drop the lock.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the rename or a deletion fails. The lock is
    /// still released on drop in that case.
    pub fn retire(self) -> Result<()> {
        match fs::rename(&self.path, &self.transitional) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        remove_if_present(&self.transitional)?;
        trace!(id = %self.id, "retired");
        self.lock.release()
    }
}
