//! Advisory file locks on profile directories
//!
//! Two independent locks live in every profile:
//!
//! ```text
//! <profile>/instance.lock            held by the running instance itself
//! <profile>/instancemanagement.lock  held by this service during start/stop
//! ```
//!
//! Both are OS-level exclusive locks taken through `fs2`. Probing never blocks.

use crate::error::InstanceOperationError;
use crate::profile::profile_name;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const PROFILE_LOCK_FILE: &str = "instance.lock";
pub const MANAGEMENT_LOCK_FILE: &str = "instancemanagement.lock";

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Try to lock `path` exclusively without waiting
fn try_lock(path: &Path) -> io::Result<Option<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if is_contended(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whether a live process holds the profile lock of `profile_dir`
///
/// A missing lock file means the profile is not running. The check takes the
/// lock for an instant and gives it back.
pub fn is_profile_locked(profile_dir: &Path) -> io::Result<bool> {
    let path = profile_dir.join(PROFILE_LOCK_FILE);
    if !path.is_file() {
        return Ok(false);
    }
    let file = OpenOptions::new().read(true).write(true).open(&path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            file.unlock()?;
            Ok(false)
        }
        Err(e) if is_contended(&e) => Ok(true),
        Err(e) => Err(e),
    }
}

/// The lock a running instance holds on its own profile
#[derive(Debug)]
pub struct ProfileLock {
    file: File,
    path: PathBuf,
}

impl ProfileLock {
    /// `None` if another process already runs on this profile
    pub fn try_acquire(profile_dir: &Path) -> io::Result<Option<Self>> {
        std::fs::create_dir_all(profile_dir)?;
        let path = profile_dir.join(PROFILE_LOCK_FILE);
        Ok(try_lock(&path)?.map(|file| Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProfileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!(path = %self.path.display(), error = %e, "Failed to unlock profile");
        }
    }
}

/// Serializes management operations on one profile
#[derive(Debug)]
pub struct ManagementLock {
    file: File,
    path: PathBuf,
    profile: String,
}

impl ManagementLock {
    pub fn try_acquire(profile_dir: &Path) -> io::Result<Option<Self>> {
        std::fs::create_dir_all(profile_dir)?;
        let path = profile_dir.join(MANAGEMENT_LOCK_FILE);
        Ok(try_lock(&path)?.map(|file| Self {
            file,
            path,
            profile: profile_name(profile_dir),
        }))
    }

    /// Try the lock repeatedly until it is free or `timeout` has passed
    pub async fn acquire(
        profile_dir: &Path,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self, InstanceOperationError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            match Self::try_acquire(profile_dir) {
                Ok(Some(lock)) => {
                    debug!(profile = %lock.profile, "Acquired management lock");
                    return Ok(lock);
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(InstanceOperationError::io(
                        profile_dir.join(MANAGEMENT_LOCK_FILE),
                        e,
                    ))
                }
            }
            if Instant::now() + retry_interval > deadline {
                let profile = profile_name(profile_dir);
                warn!(profile = %profile, "Management lock is held by someone else");
                return Err(InstanceOperationError::LockContention {
                    profile,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(retry_interval).await;
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Unlock and delete the lock file
    pub fn release(self) -> io::Result<()> {
        self.file.unlock()?;
        let path = self.path.clone();
        drop(self.file);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Management locks taken by a running operation, awaiting release
#[derive(Debug, Default)]
pub struct ManagementLockTable {
    held: Mutex<HashMap<PathBuf, ManagementLock>>,
}

impl ManagementLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile_dir: PathBuf, lock: ManagementLock) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.insert(profile_dir, lock);
    }

    pub fn take(&self, profile_dir: &Path) -> Option<ManagementLock> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(profile_dir)
    }

    pub fn is_held(&self, profile_dir: &Path) -> bool {
        let held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.contains_key(profile_dir)
    }

    pub fn len(&self) -> usize {
        self.held.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_profile_lock_check() {
        let dir = TempDir::new().unwrap();
        let profile = dir.path().join("p1");
        std::fs::create_dir_all(&profile).unwrap();
        assert!(!is_profile_locked(&profile).unwrap());

        let lock = ProfileLock::try_acquire(&profile).unwrap().unwrap();
        assert!(is_profile_locked(&profile).unwrap());
        assert!(ProfileLock::try_acquire(&profile).unwrap().is_none());

        drop(lock);
        assert!(!is_profile_locked(&profile).unwrap());
        // checking does not remove the file
        assert!(profile.join(PROFILE_LOCK_FILE).is_file());
    }

    #[tokio::test]
    async fn test_management_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let profile = dir.path().join("p1");

        let first = ManagementLock::acquire(
            &profile,
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        let err = ManagementLock::acquire(
            &profile,
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, InstanceOperationError::LockContention { .. }));
        assert!(err.is_retryable());

        first.release().unwrap();
        assert!(!profile.join(MANAGEMENT_LOCK_FILE).exists());
        let again = ManagementLock::acquire(
            &profile,
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert_eq!(again.profile(), "p1");
    }

    #[test]
    fn test_lock_table() {
        let dir = TempDir::new().unwrap();
        let profile = dir.path().join("p1");
        let table = ManagementLockTable::new();
        let lock = ManagementLock::try_acquire(&profile).unwrap().unwrap();

        table.insert(profile.clone(), lock);
        assert!(table.is_held(&profile));
        assert!(ManagementLock::try_acquire(&profile).unwrap().is_none());

        table.take(&profile).unwrap().release().unwrap();
        assert!(table.is_empty());
    }
}
