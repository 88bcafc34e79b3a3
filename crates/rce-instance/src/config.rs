//! Instance management configuration

use crate::error::{InstanceManagementError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder in the URL and filename patterns
const PLACEHOLDER: &str = "*";

/// Placeholder for the profile directory in launch arguments
pub const PROFILE_PLACEHOLDER: &str = "{profile}";

/// Configuration of the `instanceManagement` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceManagementConfig {
    /// Holds the `profiles`, `templates` and `downloads` directories
    #[serde(default)]
    pub data_root: Option<PathBuf>,

    #[serde(default)]
    pub installations_root: Option<PathBuf>,

    /// Installation used for the `:self` id; defaults to the directory of the running executable
    #[serde(default)]
    pub self_installation: Option<PathBuf>,

    /// Remote folder holding `VERSION` and the product packages; `*` is the URL qualifier
    #[serde(default)]
    pub download_source_folder_url_pattern: String,

    /// Package file name inside the source folder; `*` is the version
    #[serde(default)]
    pub download_filename_pattern: String,

    #[serde(default = "default_executable_name")]
    pub executable_name: String,

    #[serde(default = "default_launch_arguments")]
    pub launch_arguments: Vec<String>,

    /// Printed on stdout by an instance once it is up
    #[serde(default = "default_startup_marker")]
    pub startup_marker: String,

    /// Printed on stderr by an instance whose profile is already in use
    #[serde(default = "default_lock_failure_marker")]
    pub lock_failure_marker: String,

    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lock_retry_interval")]
    pub lock_retry_interval_ms: u64,

    /// Default budget of start/stop commands
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

impl Default for InstanceManagementConfig {
    fn default() -> Self {
        Self {
            data_root: None,
            installations_root: None,
            self_installation: None,
            download_source_folder_url_pattern: String::new(),
            download_filename_pattern: String::new(),
            executable_name: default_executable_name(),
            launch_arguments: default_launch_arguments(),
            startup_marker: default_startup_marker(),
            lock_failure_marker: default_lock_failure_marker(),
            lock_timeout_ms: default_lock_timeout(),
            lock_retry_interval_ms: default_lock_retry_interval(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

/// Resolved directory structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLayout {
    pub data_root: PathBuf,
    pub installations_root: PathBuf,
    pub profiles: PathBuf,
    pub templates: PathBuf,
    pub downloads: PathBuf,
}

impl InstanceManagementConfig {
    /// Config rooted at `data_root` and `installations_root`
    pub fn with_roots(data_root: impl Into<PathBuf>, installations_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: Some(data_root.into()),
            installations_root: Some(installations_root.into()),
            ..Default::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Validate the directory settings and create missing directories
    pub fn layout(&self) -> Result<DirectoryLayout> {
        let (Some(data_root), Some(installations_root)) = (&self.data_root, &self.installations_root)
        else {
            return Err(InstanceManagementError::Disabled(
                "Data or installation root directory (or both) unspecified".into(),
            ));
        };

        let layout = DirectoryLayout {
            data_root: data_root.clone(),
            installations_root: installations_root.clone(),
            profiles: data_root.join("profiles"),
            templates: data_root.join("templates"),
            downloads: data_root.join("downloads"),
        };

        let all = [
            &layout.data_root,
            &layout.installations_root,
            &layout.profiles,
            &layout.templates,
            &layout.downloads,
        ];
        for (i, a) in all.iter().enumerate() {
            if all[i + 1..].iter().any(|b| a == b) {
                return Err(InstanceManagementError::Disabled(
                    "Two or more configured directories are equal, but they must be unique".into(),
                ));
            }
        }

        for dir in all {
            std::fs::create_dir_all(dir).map_err(|e| {
                InstanceManagementError::Disabled(format!(
                    "The configured path '{}' could not be created: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(layout)
    }

    /// Whether both download patterns are set
    pub fn validate_download_settings(&self) -> Result<()> {
        if self.download_source_folder_url_pattern.is_empty() {
            return Err(InstanceManagementError::Disabled(
                "Parameter 'downloadSourceFolderUrlPattern' has not been defined, but is required".into(),
            ));
        }
        if self.download_filename_pattern.is_empty() {
            return Err(InstanceManagementError::Disabled(
                "Parameter 'downloadFilenamePattern' has not been defined, but is required".into(),
            ));
        }
        Ok(())
    }

    /// Source folder URL for a qualifier, always ending in `/`
    pub fn source_folder_url(&self, url_qualifier: &str) -> String {
        let mut pattern = self.download_source_folder_url_pattern.clone();
        if !pattern.is_empty() && !pattern.ends_with('/') {
            pattern.push('/');
        }
        pattern.replace(PLACEHOLDER, url_qualifier)
    }

    pub fn version_file_url(&self, url_qualifier: &str) -> String {
        format!("{}VERSION", self.source_folder_url(url_qualifier))
    }

    pub fn package_url(&self, url_qualifier: &str, version: &str) -> String {
        format!(
            "{}{}",
            self.source_folder_url(url_qualifier),
            self.download_filename_pattern.replace(PLACEHOLDER, version)
        )
    }

    /// Launch arguments with the profile placeholder filled in
    pub fn launch_arguments_for(&self, profile: &Path) -> Vec<String> {
        let profile = profile.to_string_lossy();
        self.launch_arguments
            .iter()
            .map(|arg| arg.replace(PROFILE_PLACEHOLDER, &profile))
            .collect()
    }
}

// Default value helpers
fn default_executable_name() -> String {
    if cfg!(windows) {
        "rce.exe".into()
    } else {
        "rce".into()
    }
}

fn default_launch_arguments() -> Vec<String> {
    vec!["--profile".into(), PROFILE_PLACEHOLDER.into(), "--batch".into()]
}

fn default_startup_marker() -> String {
    "Early startup complete".into()
}

fn default_lock_failure_marker() -> String {
    "Failed to lock profile".into()
}

fn default_lock_timeout() -> u64 {
    5_000
}

fn default_lock_retry_interval() -> u64 {
    100
}

fn default_operation_timeout() -> u64 {
    60
}
