//! Exclusive advisory lock over the library folder. Two orchestrators
//! over the same folder must be prevented by this file, not by in-memory
//! state; the lock's lifetime is tied to the orchestrator's.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const LOCK_FILE_NAME: &str = "ml.lock";

#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Acquire `ml.lock` inside `ml_folder`. Fails immediately when
    /// another process holds it.
    pub fn acquire(ml_folder: &Path) -> Result<LockFile> {
        let path = ml_folder.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(Error::from_io)?;
        match file.try_lock() {
            Ok(()) => Ok(LockFile { file, path }),
            Err(TryLockError::WouldBlock) => Err(Error::System {
                code: 0,
                message: format!(
                    "library folder is locked by another instance ({})",
                    path.display()
                ),
            }),
            Err(TryLockError::Error(e)) => Err(Error::from_io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // The file itself stays; only the lock is released.
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_within_folder() {
        let dir = tempfile::tempdir().unwrap();
        let first = LockFile::acquire(dir.path()).unwrap();
        assert!(LockFile::acquire(dir.path()).is_err());
        drop(first);
        LockFile::acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_distinct_folders_do_not_conflict() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let _lock_a = LockFile::acquire(a.path()).unwrap();
        let _lock_b = LockFile::acquire(b.path()).unwrap();
    }
}
