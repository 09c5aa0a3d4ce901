//! Exclusive per-project migration lock.
//!
//! The engine assumes one migration per project at a time; callers take this
//! lock around `MigrationExecutor::migrate`.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::timestamps::now_utc_rfc3339;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum LockError {
    Busy {
        path: PathBuf,
        holder: Option<LockOwner>,
    },
    Io(std::io::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Busy {
                path,
                holder: Some(holder),
            } => write!(
                f,
                "migration lock busy: {} (held by pid {} since {})",
                path.display(),
                holder.pid,
                holder.acquired_at
            ),
            LockError::Busy { path, holder: None } => {
                write!(f, "migration lock busy: {}", path.display())
            }
            LockError::Io(err) => write!(f, "lock I/O error: {}", err),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Busy { .. } => None,
            LockError::Io(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for LockError {
    fn from(value: std::io::Error) -> Self {
        LockError::Io(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub acquired_at: String,
}

/// Held lock; the lock file is removed on drop.
#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
    _file: File,
}

impl ProjectLock {
    /// Waits up to `timeout` for the lock. A lock file older than
    /// `stale_after` is assumed abandoned and broken.
    pub fn acquire(
        path: &Path,
        timeout: Duration,
        stale_after: Option<Duration>,
    ) -> Result<Self, LockError> {
        let start = Instant::now();
        loop {
            if let Some(guard) = try_acquire(path)? {
                return Ok(guard);
            }
            if stale_after.is_some_and(|limit| lock_age(path).is_some_and(|age| age >= limit)) {
                tracing::warn!(path = %path.display(), "breaking stale migration lock");
                match std::fs::remove_file(path) {
                    Ok(()) => continue,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            if start.elapsed() >= timeout {
                return Err(LockError::Busy {
                    path: path.to_path_buf(),
                    holder: read_owner(path),
                });
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        try_acquire(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn try_acquire(path: &Path) -> Result<Option<ProjectLock>, LockError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => match write_owner(&mut file) {
            Ok(()) => Ok(Some(ProjectLock {
                path: path.to_path_buf(),
                _file: file,
            })),
            Err(err) => {
                drop(file);
                Err(discard_partial_lock(path, err))
            }
        },
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(LockError::Io(err)),
    }
}

fn write_owner(file: &mut File) -> std::io::Result<()> {
    let owner = LockOwner {
        pid: std::process::id(),
        acquired_at: now_utc_rfc3339(),
    };
    let payload = serde_json::to_vec(&owner).map_err(std::io::Error::other)?;
    file.write_all(&payload)?;
    file.sync_data()
}

/// A lock file we created but could not fill in must not outlive the attempt.
fn discard_partial_lock(path: &Path, err: std::io::Error) -> LockError {
    if let Err(remove_err) = std::fs::remove_file(path) {
        tracing::warn!(
            path = %path.display(),
            error = %remove_err,
            "unable to remove half-written lock"
        );
    }
    LockError::Io(err)
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let raw = std::fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use uuid::Uuid;

    use super::{discard_partial_lock, LockError, ProjectLock};

    fn lock_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("cardmig-lock-test-{}", Uuid::now_v7()))
            .join("locks/migration.lock")
    }

    #[test]
    fn try_lock_is_non_blocking_and_records_owner() {
        let path = lock_path();
        let first = ProjectLock::try_acquire(&path)
            .expect("initial lock should not fail")
            .expect("initial lock should succeed");
        let raw = std::fs::read_to_string(first.path()).expect("lock file readable");
        assert!(raw.contains(&format!("\"pid\":{}", std::process::id())));

        let second = ProjectLock::try_acquire(&path).expect("second lock call should not fail");
        assert!(second.is_none());
        drop(first);
        assert!(!path.exists());
    }

    #[test]
    fn acquire_times_out_and_names_holder() {
        let path = lock_path();
        let first = ProjectLock::try_acquire(&path)
            .expect("initial lock should not fail")
            .expect("initial lock should succeed");
        let err = ProjectLock::acquire(&path, Duration::from_millis(20), None)
            .expect_err("lock should time out when already held");
        assert!(matches!(err, LockError::Busy { holder: Some(_), .. }));
        assert!(err.to_string().contains("migration lock busy"));
        assert!(err.to_string().contains("held by pid"));
        drop(first);
    }

    #[test]
    fn stale_lock_is_broken() {
        let path = lock_path();
        std::fs::create_dir_all(path.parent().expect("lock has parent")).expect("lock dir");
        std::fs::write(&path, "{}").expect("stale lock should be writable");

        let guard = ProjectLock::acquire(&path, Duration::from_millis(50), Some(Duration::ZERO))
            .expect("stale lock should be replaced");
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn failed_owner_write_leaves_no_lock_behind() {
        let path = lock_path();
        std::fs::create_dir_all(path.parent().expect("lock has parent")).expect("lock dir");
        std::fs::write(&path, "").expect("half-written lock");

        let err = discard_partial_lock(&path, std::io::Error::other("disk full"));
        assert!(matches!(err, LockError::Io(_)));
        assert!(err.to_string().contains("disk full"));
        assert!(!path.exists());

        let guard = ProjectLock::try_acquire(&path)
            .expect("retry should not fail")
            .expect("retry should succeed");
        drop(guard);
    }
}
