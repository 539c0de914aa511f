//! Runtime-wide lock guarding the managed container set.
//!
//! Two layers:
//! - an in-process `RwLock` so tasks in this process queue fairly
//! - an advisory `flock` on `runtime.lock` so other processes sharing the
//!   same storage root are excluded too
//!
//! Ordinary container mutations hold the shared side. `system migrate`,
//! `system renumber` and `system reset` hold the exclusive side from before
//! they read state until after they commit or give up, so no container can
//! be started (or have its runtime binding read) in between.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use rustix::fs::{FlockOperation, flock};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Shared/exclusive lock over the whole runtime.
#[derive(Debug, Clone)]
pub struct RuntimeLock {
    path: PathBuf,
    inner: Arc<RwLock<()>>,
}

/// Held while a container mutation runs.
#[derive(Debug)]
pub struct SharedGuard {
    _file: File,
    _guard: OwnedRwLockReadGuard<()>,
}

/// Held for the whole duration of a maintenance operation.
#[derive(Debug)]
pub struct ExclusiveGuard {
    _file: File,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl RuntimeLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Arc::new(RwLock::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn shared(&self) -> io::Result<SharedGuard> {
        let guard = Arc::clone(&self.inner).read_owned().await;
        let file = lock_file(self.path.clone(), FlockOperation::LockShared).await?;
        Ok(SharedGuard {
            _file: file,
            _guard: guard,
        })
    }

    pub async fn exclusive(&self) -> io::Result<ExclusiveGuard> {
        let guard = Arc::clone(&self.inner).write_owned().await;
        debug!("acquiring exclusive runtime lock {:?}", self.path);
        let file = lock_file(self.path.clone(), FlockOperation::LockExclusive).await?;
        Ok(ExclusiveGuard {
            _file: file,
            _guard: guard,
        })
    }

    /// Non-blocking exclusive attempt; `None` when anyone else holds the lock.
    pub fn try_exclusive(&self) -> io::Result<Option<ExclusiveGuard>> {
        let Ok(guard) = Arc::clone(&self.inner).try_write_owned() else {
            return Ok(None);
        };
        let file = open_lock_file(&self.path)?;
        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Some(ExclusiveGuard {
                _file: file,
                _guard: guard,
            })),
            Err(e) if e == rustix::io::Errno::WOULDBLOCK => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Open `path` and take a `flock` on it off the async runtime.
///
/// The lock is released when the returned file is dropped.
pub(crate) async fn lock_file(path: PathBuf, op: FlockOperation) -> io::Result<File> {
    tokio::task::spawn_blocking(move || {
        let file = open_lock_file(&path)?;
        flock(&file, op)?;
        Ok(file)
    })
    .await
    .map_err(io::Error::other)?
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shared_guards_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RuntimeLock::new(dir.path().join("runtime.lock"));

        let a = lock.shared().await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(2), lock.shared())
            .await
            .expect("second shared guard should not block")
            .unwrap();
        drop((a, b));
    }

    #[tokio::test]
    async fn test_exclusive_blocks_shared() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RuntimeLock::new(dir.path().join("runtime.lock"));

        let exclusive = lock.exclusive().await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(100), lock.shared()).await;
        assert!(pending.is_err(), "shared guard acquired during exclusive hold");

        drop(exclusive);
        let shared = tokio::time::timeout(Duration::from_secs(2), lock.shared()).await;
        assert!(shared.is_ok());
    }

    #[tokio::test]
    async fn test_try_exclusive_reports_contention() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RuntimeLock::new(dir.path().join("runtime.lock"));

        let shared = lock.shared().await.unwrap();
        assert!(lock.try_exclusive().unwrap().is_none());
        drop(shared);
        assert!(lock.try_exclusive().unwrap().is_some());
    }
}
