//! The publish lock (§5): an exclusive file lock over `<root>/.nah.lock`
//! held only for the publish phase of a write (`install`, `remove`, NAK
//! compose output) — staging work happens unlocked. Grounded on
//! `ck-zhang-px/crates/px-core/src/core/project/lock.rs`, the only
//! `fs4`-based advisory lock in the pack; that lock is non-blocking
//! (`try_lock_exclusive`) since it guards a whole CLI invocation, while
//! this one blocks, since a publish is short and callers should simply
//! wait their turn rather than fail.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::{ErrorKind, NahError, Result};

/// Held for the lifetime of one publish phase; releases the OS lock
/// when dropped.
pub struct PublishLock {
    _file: File,
}

fn lock_path(root: &Path) -> PathBuf {
    root.join(".nah.lock")
}

impl PublishLock {
    /// Blocks until the exclusive lock over `<root>/.nah.lock` is
    /// acquired.
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = lock_path(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        file.lock_exclusive().map_err(|e| {
            NahError::new(ErrorKind::IoError, "PublishLock::acquire", e.to_string())
                .with_details(serde_json::json!({ "path": path.display().to_string() }))
        })?;
        Ok(PublishLock { _file: file })
    }

    /// Attempts to acquire the lock without blocking, returning `None`
    /// if another process already holds it.
    pub fn try_acquire(root: &Path) -> Result<Option<Self>> {
        let path = lock_path(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(PublishLock { _file: file })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NahError::new(ErrorKind::IoError, "PublishLock::try_acquire", e.to_string())
                .with_details(serde_json::json!({ "path": path.display().to_string() }))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_try_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let first = PublishLock::try_acquire(dir.path()).unwrap();
        assert!(first.is_some());
        let second = PublishLock::try_acquire(dir.path()).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _first = PublishLock::try_acquire(dir.path()).unwrap().unwrap();
        }
        let second = PublishLock::try_acquire(dir.path()).unwrap();
        assert!(second.is_some());
    }
}
