//! Advisory lock files
//!
//! A lock is a zero-length marker file created with an exclusive create
//! (`O_CREAT | O_EXCL`), so two processes racing for the same entry can never
//! both succeed. Locks are only respected by processes that go through this
//! module; nothing stops another program from touching a locked entry.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{JobError, JobResult};

/// Prefix for lock file names. The leading dot keeps lock files out of scans.
pub const LOCK_PREFIX: &str = ".LCK.";

/// Lock file name for a given file name
pub fn lock_file_name(name: &str) -> String {
    format!("{}{}", LOCK_PREFIX, name)
}

/// Create `path` exclusively. `Ok(None)` when it already exists.
fn create_exclusive(path: &Path) -> JobResult<Option<File>> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(JobError::io(path, e)),
    }
}

/// Remove `path`, treating an already missing file as success
fn remove_if_present(path: &Path) -> JobResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(JobError::io(path, e)),
    }
}

#[derive(Debug)]
struct HeldLock {
    // Keeps the descriptor open for as long as the lock is held
    _file: File,
    path: PathBuf,
}

/// Per-entry lock manager
///
/// Holds at most one lock at a time. The lock file goes next to the entry,
/// or into `lock_dir` when the source tree is read-only. With a shared lock
/// directory two entries with the same base name in different
/// sub-directories share a lock; the loser is simply picked up on a later
/// pass.
#[derive(Debug)]
pub struct LockManager {
    lock_dir: Option<PathBuf>,
    force_unlock: bool,
    held: Option<HeldLock>,
}

impl LockManager {
    /// Create a lock manager
    ///
    /// `force_unlock` removes an existing lock file before trying to create
    /// it. This trades safety for liveness after a crashed holder and must
    /// never be the default.
    pub fn new(lock_dir: Option<PathBuf>, force_unlock: bool) -> Self {
        debug!(?lock_dir, force_unlock, "LockManager::new: called");
        Self {
            lock_dir,
            force_unlock,
            held: None,
        }
    }

    /// Where the lock for `path` (absolute, or relative to `scope_dir`) lives
    pub fn lock_path(&self, scope_dir: &Path, path: &Path) -> PathBuf {
        let full = scope_dir.join(path);
        let mut name = OsString::from(LOCK_PREFIX);
        name.push(full.file_name().unwrap_or_default());
        let dir = match &self.lock_dir {
            Some(dir) => dir.clone(),
            None => full.parent().map(Path::to_path_buf).unwrap_or_else(|| scope_dir.to_path_buf()),
        };
        dir.join(name)
    }

    /// Try once to lock `path`
    ///
    /// Returns `Ok(false)` when another holder has the lock; the caller is
    /// expected to move on to its next candidate. Any other failure is an
    /// error. A lock already held by this manager is released first.
    pub fn acquire(&mut self, scope_dir: &Path, path: &Path) -> JobResult<bool> {
        let lock_path = self.lock_path(scope_dir, path);
        debug!(?lock_path, "LockManager::acquire: called");

        if self.held.is_some() {
            debug!("LockManager::acquire: releasing previously held lock");
            self.release()?;
        }

        if self.force_unlock && lock_path.is_file() {
            warn!(?lock_path, "Removing existing lock file (force unlock)");
            remove_if_present(&lock_path)?;
        }

        match create_exclusive(&lock_path)? {
            Some(file) => {
                debug!(?lock_path, "LockManager::acquire: lock created");
                self.held = Some(HeldLock {
                    _file: file,
                    path: lock_path,
                });
                Ok(true)
            }
            None => {
                debug!(?lock_path, "LockManager::acquire: already locked");
                Ok(false)
            }
        }
    }

    /// Close and delete the held lock. Does nothing when no lock is held.
    pub fn release(&mut self) -> JobResult<()> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        debug!(path = ?held.path, "LockManager::release: called");
        let HeldLock { _file: file, path } = held;
        drop(file);
        remove_if_present(&path)
    }

    /// Path of the currently held lock file
    pub fn held(&self) -> Option<&Path> {
        self.held.as_ref().map(|h| h.path.as_path())
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release lock on drop: {}", e);
        }
    }
}

/// Single-instance lock for a whole application
///
/// Uses the same exclusive-create primitive as entry locks, against
/// `<dir>/.LCK.<application>`.
#[derive(Debug)]
pub struct AppLock {
    path: PathBuf,
    file: Option<File>,
}

impl AppLock {
    pub fn new(dir: impl AsRef<Path>, application: &str) -> Self {
        let path = dir.as_ref().join(lock_file_name(application));
        debug!(?path, "AppLock::new: called");
        Self { path, file: None }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Try to become the running instance
    ///
    /// With `force`, an existing lock (presumably left by a crashed
    /// instance) is removed first.
    pub fn try_acquire(&mut self, force: bool) -> JobResult<bool> {
        debug!(path = ?self.path, force, "AppLock::try_acquire: called");
        if self.file.is_some() {
            return Ok(true);
        }
        if force {
            warn!(path = ?self.path, "Removing existing application lock (force)");
            remove_if_present(&self.path)?;
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| JobError::io(parent, e))?;
        }
        match create_exclusive(&self.path)? {
            Some(file) => {
                self.file = Some(file);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release the application lock if this instance holds it
    pub fn release(&mut self) -> JobResult<()> {
        if let Some(file) = self.file.take() {
            debug!(path = ?self.path, "AppLock::release: called");
            drop(file);
            remove_if_present(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for AppLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release application lock on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_next_to_entry() {
        let locks = LockManager::new(None, false);
        let path = locks.lock_path(Path::new("/q/input"), Path::new("sub/job.txt"));
        assert_eq!(path, PathBuf::from("/q/input/sub/.LCK.job.txt"));
    }

    #[test]
    fn test_lock_path_with_lock_dir() {
        let locks = LockManager::new(Some(PathBuf::from("/q/locks")), false);
        let path = locks.lock_path(Path::new("/q/input"), Path::new("/q/input/sub/job.txt"));
        assert_eq!(path, PathBuf::from("/q/locks/.LCK.job.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_path_keeps_raw_names_apart() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let locks = LockManager::new(Some(PathBuf::from("/q/locks")), false);
        let first = locks.lock_path(Path::new("/q/input"), Path::new(OsStr::from_bytes(b"job\xff.txt")));
        let second = locks.lock_path(Path::new("/q/input"), Path::new(OsStr::from_bytes(b"job\xfe.txt")));
        assert_ne!(first, second);
        assert_eq!(first.file_name().unwrap().as_bytes(), b".LCK.job\xff.txt");
    }

    #[test]
    fn test_only_one_manager_wins() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("job.txt"), "x").unwrap();

        let mut first = LockManager::new(None, false);
        let mut second = LockManager::new(None, false);

        assert!(first.acquire(temp.path(), Path::new("job.txt")).unwrap());
        assert!(!second.acquire(temp.path(), Path::new("job.txt")).unwrap());
        assert!(temp.path().join(".LCK.job.txt").exists());
        assert!(second.held().is_none());

        first.release().unwrap();
        assert!(!temp.path().join(".LCK.job.txt").exists());
        assert!(second.acquire(temp.path(), Path::new("job.txt")).unwrap());
    }

    #[test]
    fn test_racing_threads_single_winner() {
        let temp = TempDir::new().unwrap();
        let scope = temp.path().to_path_buf();
        let start = std::sync::Arc::new(std::sync::Barrier::new(8));
        let done = std::sync::Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let scope = scope.clone();
                let start = start.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut locks = LockManager::new(None, false);
                    start.wait();
                    let won = locks.acquire(&scope, Path::new("entry.dat")).unwrap();
                    // Keep the lock alive until every thread has tried
                    done.wait();
                    won
                })
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut other = LockManager::new(None, false);
        assert!(other.acquire(temp.path(), Path::new("a.txt")).unwrap());

        let mut locks = LockManager::new(None, false);
        locks.release().unwrap();
        locks.release().unwrap();

        assert!(temp.path().join(".LCK.a.txt").exists());
    }

    #[test]
    fn test_force_unlock_clears_stale_lock() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(".LCK.job.txt"), "").unwrap();

        let mut polite = LockManager::new(None, false);
        assert!(!polite.acquire(temp.path(), Path::new("job.txt")).unwrap());

        let mut forceful = LockManager::new(None, true);
        assert!(forceful.acquire(temp.path(), Path::new("job.txt")).unwrap());
    }

    #[test]
    fn test_missing_lock_dir_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut locks = LockManager::new(Some(temp.path().join("nope")), false);
        let result = locks.acquire(temp.path(), Path::new("job.txt"));
        assert!(matches!(result, Err(JobError::Io { .. })));
    }

    #[test]
    fn test_drop_releases_lock() {
        let temp = TempDir::new().unwrap();
        {
            let mut locks = LockManager::new(None, false);
            assert!(locks.acquire(temp.path(), Path::new("job.txt")).unwrap());
        }
        assert!(!temp.path().join(".LCK.job.txt").exists());
    }

    #[test]
    fn test_app_lock_single_instance() {
        let temp = TempDir::new().unwrap();
        let mut first = AppLock::new(temp.path(), "loader");
        let mut second = AppLock::new(temp.path(), "loader");

        assert!(first.try_acquire(false).unwrap());
        assert!(!second.try_acquire(false).unwrap());
        assert!(temp.path().join(".LCK.loader").exists());

        second.release().unwrap();
        assert!(temp.path().join(".LCK.loader").exists());

        first.release().unwrap();
        assert!(!temp.path().join(".LCK.loader").exists());
        assert!(second.try_acquire(false).unwrap());
    }

    #[test]
    fn test_app_lock_force() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(".LCK.loader"), "").unwrap();

        let mut lock = AppLock::new(temp.path(), "loader");
        assert!(!lock.try_acquire(false).unwrap());
        assert!(lock.try_acquire(true).unwrap());
        assert!(lock.is_held());
    }
}
