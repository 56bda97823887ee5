//! Cross-process writer election for one market's log tree.
//!
//! Every process touching the tree opens the same sentinel file and makes a
//! non-blocking attempt at an exclusive advisory lock. The winner becomes the
//! writer of record and keeps the lock for the rest of its life: the handle is
//! stored here and never released, since dropping and re-taking an OS lock
//! inside one process is not reliable across platforms.
use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{IoContext, Result};

#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
    held: Mutex<Option<File>>,
}

impl WriterLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts to become the writer without waiting.
    ///
    /// Returns `true` when this handle holds the lock, either from this call
    /// or an earlier one, and `false` while another process holds it.
    pub fn try_acquire(&self) -> Result<bool> {
        let mut held = self.held.lock();
        if held.is_some() {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .at(&self.path)?;
        match file.try_lock() {
            Ok(()) => {
                info!(path = %self.path.display(), "acquired writer lock");
                *held = Some(file);
                Ok(true)
            }
            Err(TryLockError::WouldBlock) => {
                debug!(path = %self.path.display(), "writer lock held by another process");
                Ok(false)
            }
            Err(TryLockError::Error(e)) => Err(e).at(&self.path),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_handle_is_refused_while_first_holds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executions").join("lock");
        let first = WriterLock::new(&path);
        let second = WriterLock::new(&path);
        assert!(first.try_acquire().unwrap());
        assert!(!second.try_acquire().unwrap());
        assert!(first.try_acquire().unwrap());
        assert!(first.is_held());
        assert!(!second.is_held());
    }
}
