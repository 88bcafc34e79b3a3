//! Files kept inside a profile directory

use crate::lock::{is_profile_locked, PROFILE_LOCK_FILE};
use std::io;
use std::path::Path;

/// Plain-text marker naming the installation a profile was started with
pub const INSTALLATION_MARKER_FILE: &str = "installation";

pub const CONFIGURATION_FILE: &str = "configuration.json";

/// Process id of the instance running on the profile, written once it holds the profile lock
pub const SHUTDOWN_DATA_FILE: &str = "internal/shutdown.dat";

/// Created by whoever wants the instance on the profile to shut down
pub const SHUTDOWN_REQUEST_FILE: &str = "internal/shutdown.request";

/// Profile name of a profile directory
pub fn profile_name(profile_dir: &Path) -> String {
    profile_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| profile_dir.to_string_lossy().into_owned())
}

pub fn write_installation_marker(profile_dir: &Path, installation_id: &str) -> io::Result<()> {
    std::fs::create_dir_all(profile_dir)?;
    std::fs::write(profile_dir.join(INSTALLATION_MARKER_FILE), installation_id)
}

pub fn read_installation_marker(profile_dir: &Path) -> io::Result<Option<String>> {
    match std::fs::read_to_string(profile_dir.join(INSTALLATION_MARKER_FILE)) {
        Ok(id) => Ok(Some(id.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Record the pid of the instance owning the profile and clear old shutdown requests
pub fn write_shutdown_data(profile_dir: &Path, pid: u32) -> io::Result<()> {
    let path = profile_dir.join(SHUTDOWN_DATA_FILE);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    remove_if_present(&profile_dir.join(SHUTDOWN_REQUEST_FILE))?;
    std::fs::write(path, pid.to_string())
}

pub fn read_shutdown_pid(profile_dir: &Path) -> io::Result<Option<u32>> {
    match std::fs::read_to_string(profile_dir.join(SHUTDOWN_DATA_FILE)) {
        Ok(text) => Ok(text.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Ask the instance on the profile to shut down
pub fn request_shutdown(profile_dir: &Path) -> io::Result<()> {
    let path = profile_dir.join(SHUTDOWN_REQUEST_FILE);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, "")
}

pub fn is_shutdown_requested(profile_dir: &Path) -> bool {
    profile_dir.join(SHUTDOWN_REQUEST_FILE).is_file()
}

/// Remove the shutdown files once the instance is gone
pub fn clear_shutdown_data(profile_dir: &Path) -> io::Result<()> {
    remove_if_present(&profile_dir.join(SHUTDOWN_REQUEST_FILE))?;
    remove_if_present(&profile_dir.join(SHUTDOWN_DATA_FILE))?;
    Ok(())
}

/// Delete the lock file and installation marker of a profile nobody runs on
///
/// Returns `false` without touching anything while the profile is locked.
pub fn remove_stale_markers(profile_dir: &Path) -> io::Result<bool> {
    if is_profile_locked(profile_dir)? {
        return Ok(false);
    }
    remove_if_present(&profile_dir.join(PROFILE_LOCK_FILE))?;
    remove_if_present(&profile_dir.join(INSTALLATION_MARKER_FILE))?;
    Ok(true)
}
