//! Cross-process exclusive lock on the database directory.
//!
//! One processor owns the pipeline at a time: either the in-process driver or
//! an external worker. The lock is a file next to the database holding the
//! owner's pid; liveness is judged by file age, so a crashed owner's lock is
//! taken over once it goes stale.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MemError, Result};

const LOCK_FILE: &str = "memory.db.lock";

/// Held for the lifetime of the owning processor; released on drop.
#[derive(Debug)]
pub struct StorageLock {
    path: PathBuf,
}

impl StorageLock {
    /// Acquire the lock for a database directory.
    ///
    /// Fails with [`MemError::Conflict`] when another live owner holds it.
    /// A lock older than `stale_after` is treated as abandoned and taken over.
    pub fn acquire(db_dir: &Path, stale_after: Duration) -> Result<Self> {
        let path = db_dir.join(LOCK_FILE);

        match Self::try_create(&path) {
            Ok(()) => return Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(MemError::Internal(format!("lock create failed: {e}"))),
        }

        if Self::is_stale(&path, stale_after) {
            tracing::warn!(path = %path.display(), "taking over stale storage lock");
            let _ = std::fs::remove_file(&path);
            Self::try_create(&path)
                .map_err(|e| MemError::Internal(format!("lock takeover failed: {e}")))?;
            return Ok(Self { path });
        }

        Err(MemError::Conflict(format!(
            "database directory is locked by another processor ({})",
            path.display()
        )))
    }

    /// `true` when a live (non-stale) lock is present.
    pub fn is_held(db_dir: &Path, stale_after: Duration) -> bool {
        let path = db_dir.join(LOCK_FILE);
        path.exists() && !Self::is_stale(&path, stale_after)
    }

    /// Touch the lock file so a long-lived owner stays non-stale.
    pub fn refresh(&self) {
        let _ = std::fs::write(&self.path, format!("{}\n", std::process::id()));
    }

    fn try_create(path: &Path) -> std::io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        writeln!(file, "{}", std::process::id())
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return true;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        modified
            .elapsed()
            .map(|age| age > stale_after)
            .unwrap_or(false)
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release storage lock");
        }
    }
}
