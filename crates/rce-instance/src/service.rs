//! Instance management service
//!
//! Owns the profile → installation map and everything needed to install
//! product packages and to start, stop, configure and dispose instances.

use crate::config::{DirectoryLayout, InstanceManagementConfig};
use crate::configuration::{
    hash_passphrase, ConfigurationOperation, ConfigurationSequence, InstanceConfiguration,
};
use crate::error::{
    InstanceConfigurationError, InstanceManagementError, InstanceOperationError, Result,
};
use crate::lock::{is_profile_locked, ManagementLock, ManagementLockTable};
use crate::operations::{
    standard_chain, InstanceOperations, InstanceOutcome, OperationReport,
    ProcessInstanceOperations,
};
use crate::output::TextOutputReceiver;
use crate::package::{install_from_zip, HttpPackageSource, PackageSource};
use crate::profile::{
    profile_name, read_installation_marker, remove_stale_markers, write_installation_marker,
    CONFIGURATION_FILE,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Installation id of the installation running this service
pub const MASTER_INSTALLATION_ID: &str = ":self";

/// Prefix of installation ids naming a local directory
pub const LOCAL_INSTALLATION_PREFIX: &str = "local:";

const VERSION_SUFFIX: &str = ".version";
const PASSPHRASE_FILE: &str = "im_master.passphrase";
const INDENT: &str = "  ";

/// How to treat an existing installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallationPolicy {
    /// Install only if there is no installation with this id
    OnlyIfMissing,
    /// Reinstall if the remote version differs from the installed one
    IfVersionDiffers,
    /// Download again even if the package is cached, then reinstall
    ForceDownload,
    /// Reinstall from the cached package if present
    ForceReinstall,
}

/// Result of an install request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { version: String },
    AlreadyPresent,
    SameVersion { version: String },
}

/// What to list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    All,
    Instances,
    Installations,
    Templates,
}

impl FromStr for ListScope {
    type Err = InstanceManagementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "instances" => Ok(Self::Instances),
            "installations" => Ok(Self::Installations),
            "templates" => Ok(Self::Templates),
            other => Err(InstanceManagementError::malformed_command(format!(
                "unknown list scope '{}'",
                other
            ))),
        }
    }
}

/// Listing entry of a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    pub running: bool,
    pub installation: Option<String>,
}

/// Installs product packages and manages instances on profile directories
pub struct InstanceManagementService {
    config: InstanceManagementConfig,
    layout: std::result::Result<DirectoryLayout, String>,
    operations: Arc<dyn InstanceOperations>,
    packages: Arc<dyn PackageSource>,
    installations_by_profile: RwLock<HashMap<String, String>>,
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn list_dir_sorted(dir: &Path) -> io::Result<Vec<std::fs::DirEntry>> {
    let mut entries = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

impl InstanceManagementService {
    /// Create the service; an invalid directory configuration leaves it disabled
    pub fn new(
        config: InstanceManagementConfig,
        operations: Arc<dyn InstanceOperations>,
        packages: Arc<dyn PackageSource>,
    ) -> Self {
        let layout = config.layout().map_err(|e| {
            error!(error = %e, "Disabling local instance management due to missing or invalid configuration");
            e.to_string()
        });
        let service = Self {
            config,
            layout,
            operations,
            packages,
            installations_by_profile: RwLock::new(HashMap::new()),
        };
        if service.layout.is_ok() {
            if let Err(e) = service.rebuild_installation_map() {
                warn!(error = %e, "Failed to read installation markers of profiles");
            }
        }
        service
    }

    /// Service launching real instance processes and downloading over HTTP
    pub fn with_local_processes(config: InstanceManagementConfig) -> Self {
        let locks = Arc::new(ManagementLockTable::new());
        let base = Arc::new(ProcessInstanceOperations::new(config.clone(), locks.clone()));
        let operations = standard_chain(base, locks);
        let packages = Arc::new(HttpPackageSource::new(config.clone()));
        Self::new(config, operations, packages)
    }

    pub fn config(&self) -> &InstanceManagementConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.layout.is_ok()
    }

    pub fn reason_not_started(&self) -> Option<&str> {
        self.layout.as_ref().err().map(String::as_str)
    }

    fn layout(&self) -> Result<&DirectoryLayout> {
        self.layout
            .as_ref()
            .map_err(|reason| InstanceManagementError::Disabled(reason.clone()))
    }

    pub fn is_special_installation_id(&self, id: &str) -> bool {
        id == MASTER_INSTALLATION_ID || id.starts_with(LOCAL_INSTALLATION_PREFIX)
    }

    fn validate_id(&self, id: &str) -> Result<()> {
        if is_valid_id(id) {
            Ok(())
        } else {
            Err(InstanceManagementError::malformed_id(id))
        }
    }

    fn validate_instance_ids(&self, ids: &[String], for_shutdown: bool) -> Result<()> {
        let unique: BTreeSet<&String> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(InstanceManagementError::malformed_command(
                "multiple instances with identical id",
            ));
        }
        let layout = self.layout()?;
        for id in ids {
            self.validate_id(id)?;
            if for_shutdown && !layout.profiles.join(id).is_dir() {
                return Err(InstanceManagementError::malformed_command(format!(
                    "tried to shutdown instance '{}', which doesn't exist",
                    id
                )));
            }
        }
        Ok(())
    }

    // ── Profile → installation map ──────────────────────────────────────

    fn rebuild_installation_map(&self) -> Result<()> {
        let layout = self.layout()?;
        let mut map = HashMap::new();
        for entry in list_dir_sorted(&layout.profiles)? {
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(installation) = read_installation_marker(&entry.path())? {
                map.insert(entry.file_name().to_string_lossy().into_owned(), installation);
            }
        }
        debug!(profiles = map.len(), "Rebuilt profile installation map");
        *self
            .installations_by_profile
            .write()
            .unwrap_or_else(|p| p.into_inner()) = map;
        Ok(())
    }

    /// Installation a profile was last started with
    pub fn installation_of(&self, instance_id: &str) -> Option<String> {
        self.installations_by_profile
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(instance_id)
            .cloned()
    }

    fn profiles_of_installation(&self, installation_id: &str) -> Vec<String> {
        let map = self
            .installations_by_profile
            .read()
            .unwrap_or_else(|p| p.into_inner());
        let mut profiles: Vec<String> = map
            .iter()
            .filter(|(_, installation)| installation.as_str() == installation_id)
            .map(|(profile, _)| profile.clone())
            .collect();
        profiles.sort();
        profiles
    }

    /// Running instances started from `installation_id`
    pub fn instances_running_installation(&self, installation_id: &str) -> Result<Vec<String>> {
        let mut running = Vec::new();
        for profile in self.profiles_of_installation(installation_id) {
            if self.is_instance_running(&profile)? {
                running.push(profile);
            }
        }
        Ok(running)
    }

    pub fn is_instance_running(&self, instance_id: &str) -> Result<bool> {
        self.validate_id(instance_id)?;
        let layout = self.layout()?;
        Ok(is_profile_locked(&layout.profiles.join(instance_id))?)
    }

    pub fn resolve_relative_path_within_profile(
        &self,
        instance_id: &str,
        relative: &str,
    ) -> Result<PathBuf> {
        self.validate_id(instance_id)?;
        Ok(self.layout()?.profiles.join(instance_id).join(relative))
    }

    fn all_profiles(&self) -> Result<Vec<String>> {
        let layout = self.layout()?;
        let mut profiles = Vec::new();
        for entry in list_dir_sorted(&layout.profiles)? {
            if entry.file_type()?.is_dir() {
                profiles.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(profiles)
    }

    fn resolve_installation_dir(&self, installation_id: &str) -> Result<PathBuf> {
        let dir = if installation_id == MASTER_INSTALLATION_ID {
            match &self.config.self_installation {
                Some(dir) => dir.clone(),
                None => std::env::current_exe()?
                    .parent()
                    .map(Path::to_path_buf)
                    .ok_or_else(|| {
                        InstanceManagementError::InstallationNotFound(installation_id.into())
                    })?,
            }
        } else if let Some(path) = installation_id.strip_prefix(LOCAL_INSTALLATION_PREFIX) {
            PathBuf::from(path)
        } else {
            self.validate_id(installation_id)?;
            self.layout()?.installations_root.join(installation_id)
        };
        if !dir.is_dir() {
            return Err(InstanceManagementError::InstallationNotFound(
                installation_id.into(),
            ));
        }
        Ok(dir)
    }

    // ── Start / stop ────────────────────────────────────────────────────

    /// Start the given instances from an installation
    ///
    /// Instances already running are skipped. Every started profile gets an
    /// installation marker.
    #[instrument(skip(self, output), fields(installation = %installation_id))]
    pub async fn start_instances(
        &self,
        installation_id: &str,
        instance_ids: &[String],
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        if installation_id.is_empty() || instance_ids.is_empty() {
            return Err(InstanceManagementError::malformed_command(
                "either no installation id or instance id defined",
            ));
        }
        let layout = self.layout()?;
        let installation_dir = self.resolve_installation_dir(installation_id)?;
        self.validate_instance_ids(instance_ids, false)?;

        let mut profiles = Vec::new();
        for id in instance_ids {
            if self.is_instance_running(id)? {
                output.add_output(&format!("Profile with id: {} is already running.", id));
                continue;
            }
            let profile = layout.profiles.join(id);
            write_installation_marker(&profile, installation_id)?;
            profiles.push(profile);
        }
        if profiles.is_empty() {
            return Ok(OperationReport::new());
        }

        let report = self
            .operations
            .start_instances(profiles, installation_dir, timeout, output)
            .await?;

        {
            let mut map = self
                .installations_by_profile
                .write()
                .unwrap_or_else(|p| p.into_inner());
            for (profile, outcome) in report.outcomes() {
                if *outcome == InstanceOutcome::Started {
                    map.insert(profile.to_string(), installation_id.to_string());
                }
            }
        }

        if !report.is_success() {
            warn!(failures = %report.failure_summary(), "Some instances failed to start");
            return Err(InstanceManagementError::BatchFailed {
                operation: "start",
                report,
            });
        }
        info!(count = report.len(), "Instances started");
        Ok(report)
    }

    /// Stop the given instances; profiles not running are reported, not signalled
    #[instrument(skip(self, output))]
    pub async fn stop_instances(
        &self,
        instance_ids: &[String],
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        if instance_ids.is_empty() {
            output.add_output("No instance to stop defined.. aborting.");
            return Ok(OperationReport::new());
        }
        self.validate_instance_ids(instance_ids, true)?;
        let layout = self.layout()?;

        let mut report = OperationReport::new();
        let mut profiles = Vec::new();
        for id in instance_ids {
            if !self.is_instance_running(id)? {
                output.add_output(&format!("Instance with id: {} is currently not running.", id));
                report.record(id, InstanceOutcome::NotRunning);
                continue;
            }
            profiles.push(layout.profiles.join(id));
        }
        if profiles.is_empty() {
            return Ok(report);
        }

        let result = self
            .operations
            .shutdown_instances(profiles.clone(), timeout, output)
            .await;
        let cleanup = self.forget_stopped(&profiles);
        report.merge(result?);
        cleanup?;

        if !report.is_success() {
            warn!(failures = %report.failure_summary(), "Some instances failed to stop");
            return Err(InstanceManagementError::BatchFailed {
                operation: "stop",
                report,
            });
        }
        info!(count = report.len(), "Instances stopped");
        Ok(report)
    }

    /// Drop markers and map entries of profiles that are no longer running
    fn forget_stopped(&self, profiles: &[PathBuf]) -> Result<()> {
        for profile in profiles {
            match remove_stale_markers(profile) {
                Ok(true) => {
                    self.installations_by_profile
                        .write()
                        .unwrap_or_else(|p| p.into_inner())
                        .remove(&profile_name(profile));
                }
                Ok(false) => {}
                Err(e) => {
                    error!(profile = %profile.display(), error = %e, "Failed to remove profile markers");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Start every profile using the given installation
    pub async fn start_all_instances(
        &self,
        installation_id: &str,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        let profiles = self.all_profiles()?;
        self.start_instances(installation_id, &profiles, timeout, output)
            .await
    }

    /// Stop the instances of one installation, or all instances for `None`
    pub async fn stop_all_instances(
        &self,
        installation_id: Option<&str>,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        let profiles = match installation_id {
            Some(id) if !id.is_empty() => self.profiles_of_installation(id),
            _ => self.all_profiles()?,
        };
        self.stop_instances(&profiles, timeout, output).await
    }

    // ── Installations ───────────────────────────────────────────────────

    /// Install or update an installation that no instance is running on
    #[instrument(skip(self, output))]
    pub async fn setup_installation(
        &self,
        installation_id: &str,
        url_qualifier: &str,
        policy: InstallationPolicy,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<InstallOutcome> {
        self.validate_id(installation_id)?;
        self.layout()?;
        self.config.validate_download_settings()?;

        if !self.instances_running_installation(installation_id)?.is_empty() {
            return Err(InstanceManagementError::InstallationRunning(
                installation_id.into(),
            ));
        }
        self.install(installation_id, url_qualifier, policy, output.as_ref())
            .await
    }

    /// Stop the instances running on an installation, replace it and start them again
    #[instrument(skip(self, output))]
    pub async fn reinstall(
        &self,
        installation_id: &str,
        url_qualifier: &str,
        policy: InstallationPolicy,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<InstallOutcome> {
        self.validate_id(installation_id)?;
        self.layout()?;
        self.config.validate_download_settings()?;
        if policy == InstallationPolicy::OnlyIfMissing {
            return Err(InstanceManagementError::malformed_command(
                "reinstall does not support installing only if missing",
            ));
        }

        let running = self.instances_running_installation(installation_id)?;
        if !running.is_empty() {
            info!(instances = ?running, "Stopping instances before reinstalling");
            self.stop_instances(&running, timeout, output.clone()).await?;
        }

        let outcome = match self
            .install(installation_id, url_qualifier, policy, output.as_ref())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(instances = ?running, "Reinstall failed; stopped instances stay stopped");
                return Err(e);
            }
        };

        if !running.is_empty() {
            self.start_instances(installation_id, &running, timeout, output)
                .await?;
        }
        Ok(outcome)
    }

    async fn install(
        &self,
        installation_id: &str,
        url_qualifier: &str,
        policy: InstallationPolicy,
        output: &dyn TextOutputReceiver,
    ) -> Result<InstallOutcome> {
        match policy {
            InstallationPolicy::OnlyIfMissing => {
                if self.layout()?.installations_root.join(installation_id).exists() {
                    output.add_output(&format!(
                        "Installation with ID {} already exists.",
                        installation_id
                    ));
                    return Ok(InstallOutcome::AlreadyPresent);
                }
                self.install_if_version_differs(installation_id, url_qualifier, output)
                    .await
            }
            InstallationPolicy::IfVersionDiffers => {
                self.install_if_version_differs(installation_id, url_qualifier, output)
                    .await
            }
            InstallationPolicy::ForceDownload => {
                let version = self.fetch_version(url_qualifier, output).await?;
                self.replace_installation(installation_id, &version, url_qualifier, true, output)
                    .await
            }
            InstallationPolicy::ForceReinstall => {
                let version = self.fetch_version(url_qualifier, output).await?;
                self.replace_installation(installation_id, &version, url_qualifier, false, output)
                    .await
            }
        }
    }

    async fn fetch_version(
        &self,
        url_qualifier: &str,
        output: &dyn TextOutputReceiver,
    ) -> Result<String> {
        output.add_output("Fetching remote version information");
        let version = self.packages.fetch_version(url_qualifier).await?;
        if version.is_empty() {
            return Err(InstanceManagementError::VersionUnavailable(
                url_qualifier.into(),
            ));
        }
        info!(url_qualifier, version = %version, "Identified version of remote installation package");
        Ok(version)
    }

    async fn install_if_version_differs(
        &self,
        installation_id: &str,
        url_qualifier: &str,
        output: &dyn TextOutputReceiver,
    ) -> Result<InstallOutcome> {
        let version = self.fetch_version(url_qualifier, output).await?;
        if self.installed_version(installation_id)?.as_deref() == Some(version.as_str()) {
            output.add_output("Remote and installed version are the same; no change required");
            return Ok(InstallOutcome::SameVersion { version });
        }
        self.replace_installation(installation_id, &version, url_qualifier, false, output)
            .await
    }

    /// Version recorded for an installation
    pub fn installed_version(&self, installation_id: &str) -> Result<Option<String>> {
        let path = self
            .layout()?
            .installations_root
            .join(format!("{}{}", installation_id, VERSION_SUFFIX));
        match std::fs::read_to_string(path) {
            Ok(version) => Ok(Some(version.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// First free `<version>.zip`, `<version>(1).zip`, ... in the download cache
    fn fresh_download_path(&self, version: &str) -> Result<PathBuf> {
        let downloads = &self.layout()?.downloads;
        let mut path = downloads.join(format!("{}.zip", version));
        let mut i = 1;
        while path.exists() {
            path = downloads.join(format!("{}({}).zip", version, i));
            i += 1;
        }
        Ok(path)
    }

    async fn replace_installation(
        &self,
        installation_id: &str,
        version: &str,
        url_qualifier: &str,
        force_download: bool,
        output: &dyn TextOutputReceiver,
    ) -> Result<InstallOutcome> {
        let layout = self.layout()?;

        let package = if force_download {
            info!("Reinstalling with 'force new download' option set");
            let package = self.fresh_download_path(version)?;
            self.packages
                .download_package(url_qualifier, version, &package)
                .await?;
            package
        } else {
            let package = layout.downloads.join(format!("{}.zip", version));
            if package.exists() {
                info!(version, "Version is already present in downloads cache, not downloading");
            } else {
                self.packages
                    .download_package(url_qualifier, version, &package)
                    .await?;
            }
            package
        };

        let installation_dir = layout.installations_root.join(installation_id);
        if installation_dir.exists() {
            output.add_output(&format!("Deleting old installation {}", installation_id));
            tokio::fs::remove_dir_all(&installation_dir).await?;
        }
        output.add_output(&format!("Setting up new installation {}", installation_id));
        let target = installation_dir.clone();
        tokio::task::spawn_blocking(move || install_from_zip(&package, &target))
            .await
            .map_err(io::Error::other)??;

        debug!(installation = installation_id, version, "Writing version information");
        std::fs::write(
            layout
                .installations_root
                .join(format!("{}{}", installation_id, VERSION_SUFFIX)),
            version,
        )?;
        Ok(InstallOutcome::Installed {
            version: version.to_string(),
        })
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// Apply configuration changes to an instance, creating its profile if needed
    ///
    /// Holds the management lock of the profile while the file is written.
    #[instrument(skip(self, sequence, output))]
    pub async fn configure_instance(
        &self,
        instance_id: &str,
        sequence: &ConfigurationSequence,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<()> {
        self.validate_id(instance_id)?;
        let layout = self.layout()?;
        sequence.validate()?;

        let profile = layout.profiles.join(instance_id);
        std::fs::create_dir_all(&profile)?;
        let lock = ManagementLock::acquire(
            &profile,
            self.config.lock_timeout(),
            self.config.lock_retry_interval(),
        )
        .await?;

        let result = self.apply_configuration(instance_id, &profile, sequence, output.as_ref());
        match (result, lock.release()) {
            (result, Ok(())) => result,
            (Ok(()), Err(source)) => Err(InstanceOperationError::LockRelease {
                profile: instance_id.to_string(),
                source,
                original: None,
            }
            .into()),
            (Err(original), Err(source)) => {
                error!(profile = instance_id, error = %source, "Failed to release management lock after failed configuration");
                Err(original)
            }
        }
    }

    fn apply_configuration(
        &self,
        instance_id: &str,
        profile: &Path,
        sequence: &ConfigurationSequence,
        output: &dyn TextOutputReceiver,
    ) -> Result<()> {
        let layout = self.layout()?;
        let config_file = profile.join(CONFIGURATION_FILE);
        if !config_file.exists() {
            write_empty_configuration(&config_file)?;
        }

        match sequence.first() {
            Some(ConfigurationOperation::Reset) => {
                write_empty_configuration(&config_file)?;
                output.add_output(&format!(
                    "Clearing/resetting the configuration of instance {}",
                    instance_id
                ));
            }
            Some(ConfigurationOperation::ApplyTemplate { template }) => {
                self.validate_id(template)?;
                let source = layout.templates.join(template).join(CONFIGURATION_FILE);
                if !source.is_file() {
                    return Err(InstanceConfigurationError::TemplateNotFound(template.clone()).into());
                }
                output.add_output(&format!(
                    "Replacing configuration of instance {} with template {}",
                    instance_id, template
                ));
                std::fs::copy(&source, &config_file)?;
            }
            _ => {}
        }

        let im_password_hash = if sequence.needs_im_credentials() {
            Some(self.im_master_password_hash()?)
        } else {
            None
        };

        let mut configuration = InstanceConfiguration::load(&config_file)?;
        for line in configuration.apply_sequence(instance_id, sequence, im_password_hash.as_deref())? {
            output.add_output(&line);
        }
        configuration.save()?;
        output.add_output(&format!(
            "Updated the configuration file of instance {}",
            instance_id
        ));
        Ok(())
    }

    /// Hash of the passphrase shared by all instances; created on first use
    fn im_master_password_hash(&self) -> Result<String> {
        let path = self.layout()?.data_root.join(PASSPHRASE_FILE);
        let passphrase = match std::fs::read_to_string(&path) {
            Ok(passphrase) => passphrase.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let passphrase = random_alphanumeric(10);
                std::fs::write(&path, &passphrase)?;
                passphrase
            }
            Err(e) => return Err(e.into()),
        };
        Ok(hash_passphrase(&passphrase, &random_alphanumeric(16)))
    }

    // ── Listing and disposal ────────────────────────────────────────────

    pub fn instances(&self) -> Result<Vec<InstanceInfo>> {
        let mut instances = Vec::new();
        for id in self.all_profiles()? {
            let running = self.is_instance_running(&id)?;
            instances.push(InstanceInfo {
                installation: self.installation_of(&id),
                running,
                id,
            });
        }
        Ok(instances)
    }

    /// `(installation id, version)` for every installation with a version marker
    pub fn installations(&self) -> Result<Vec<(String, String)>> {
        let layout = self.layout()?;
        let mut installations = Vec::new();
        for entry in list_dir_sorted(&layout.installations_root)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(VERSION_SUFFIX) {
                if entry.file_type()?.is_file() {
                    let version = std::fs::read_to_string(entry.path())?;
                    installations.push((id.to_string(), version.trim().to_string()));
                }
            }
        }
        Ok(installations)
    }

    pub fn templates(&self) -> Result<Vec<String>> {
        let layout = self.layout()?;
        let mut templates = Vec::new();
        for entry in list_dir_sorted(&layout.templates)? {
            if entry.file_type()?.is_dir() {
                templates.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(templates)
    }

    pub fn list(&self, scope: ListScope, output: &dyn TextOutputReceiver) -> Result<()> {
        if matches!(scope, ListScope::All | ListScope::Instances) {
            let instances = self.instances()?;
            if instances.is_empty() {
                output.add_output("No instances found.");
            } else {
                output.add_output("Instances: ");
                for instance in instances {
                    let state = match (instance.running, instance.installation) {
                        (true, Some(installation)) => format!("Running ({})", installation),
                        (true, None) => "Running".to_string(),
                        (false, _) => "Not running".to_string(),
                    };
                    output.add_output(&format!("{}{} ({})", INDENT, instance.id, state));
                }
            }
        }
        if matches!(scope, ListScope::All | ListScope::Installations) {
            let installations = self.installations()?;
            if installations.is_empty() {
                output.add_output("No installations found.");
            } else {
                output.add_output("Installations: ");
                for (id, version) in installations {
                    output.add_output(&format!("{}{} ({})", INDENT, id, version));
                }
            }
        }
        if matches!(scope, ListScope::All | ListScope::Templates) {
            let templates = self.templates()?;
            if templates.is_empty() {
                output.add_output("No templates found.");
            } else {
                output.add_output("Templates: ");
                for template in templates {
                    output.add_output(&format!("{}{}", INDENT, template));
                }
            }
        }
        Ok(())
    }

    /// Delete a profile that is not in use
    #[instrument(skip(self, output))]
    pub fn dispose_instance(&self, instance_id: &str, output: &dyn TextOutputReceiver) -> Result<()> {
        self.validate_id(instance_id)?;
        let profile = self.layout()?.profiles.join(instance_id);
        if !profile.is_dir() {
            return Err(InstanceManagementError::InstanceNotFound(instance_id.into()));
        }
        if is_profile_locked(&profile)? {
            return Err(InstanceManagementError::InstanceInUse(instance_id.into()));
        }
        std::fs::remove_dir_all(&profile)?;
        self.installations_by_profile
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(instance_id);
        info!(instance = instance_id, "Disposed instance");
        output.add_output(&format!("Disposed instance {}", instance_id));
        Ok(())
    }

    pub fn show_information(&self, output: &dyn TextOutputReceiver) -> Result<()> {
        let layout = match self.layout() {
            Ok(layout) => layout,
            Err(e) => {
                output.add_output(&e.to_string());
                return Ok(());
            }
        };
        output.add_output(&format!("Instances' root directory: {}", layout.profiles.display()));
        output.add_output(&format!(
            "Installations' root directory: {}",
            layout.installations_root.display()
        ));
        output.add_output(&format!("Templates' root directory: {}", layout.templates.display()));
        output.add_output(&format!("Data root directory: {}", layout.data_root.display()));
        output.add_output(&format!("Download cache directory: {}", layout.downloads.display()));

        let cached: Vec<String> = list_dir_sorted(&layout.downloads)?
            .iter()
            .map(|e| e.file_name().to_string_lossy().replace(".zip", ""))
            .collect();
        if cached.is_empty() {
            output.add_output("No download cached.");
        } else {
            output.add_output("Downloads cached: ");
            for name in cached {
                output.add_output(&format!("{}{}", INDENT, name));
            }
        }
        Ok(())
    }
}

fn write_empty_configuration(path: &Path) -> io::Result<()> {
    std::fs::write(path, "{\n}\n")
}

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ProfileLock;
    use crate::output::CollectingOutputReceiver;
    use crate::package::test_support::write_zip;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    /// Never called in these tests
    struct NoOperations;

    #[async_trait]
    impl InstanceOperations for NoOperations {
        async fn start_instances(
            &self,
            _profiles: Vec<PathBuf>,
            _installation: PathBuf,
            _timeout: Duration,
            _output: Arc<dyn TextOutputReceiver>,
        ) -> crate::operations::Result<OperationReport> {
            unreachable!("no instance is started here")
        }

        async fn shutdown_instances(
            &self,
            _profiles: Vec<PathBuf>,
            _timeout: Duration,
            _output: Arc<dyn TextOutputReceiver>,
        ) -> crate::operations::Result<OperationReport> {
            unreachable!("no instance is stopped here")
        }
    }

    struct FixedPackage;

    #[async_trait]
    impl PackageSource for FixedPackage {
        async fn fetch_version(&self, _url_qualifier: &str) -> Result<String> {
            Ok("1.0".into())
        }

        async fn download_package(&self, _q: &str, _v: &str, destination: &Path) -> Result<()> {
            write_zip(destination, &[("rce/rce", "#!/bin/sh\n")]);
            Ok(())
        }
    }

    fn service(dir: &TempDir) -> InstanceManagementService {
        let mut config =
            InstanceManagementConfig::with_roots(dir.path().join("data"), dir.path().join("inst"));
        config.download_source_folder_url_pattern = "https://example.org/*".into();
        config.download_filename_pattern = "rce-*.zip".into();
        InstanceManagementService::new(config, Arc::new(NoOperations), Arc::new(FixedPackage))
    }

    #[test]
    fn test_disabled_without_roots() {
        let service = InstanceManagementService::new(
            InstanceManagementConfig::default(),
            Arc::new(NoOperations),
            Arc::new(FixedPackage),
        );
        assert!(!service.is_started());
        assert!(service.reason_not_started().is_some());
        assert!(matches!(
            service.is_instance_running("p1"),
            Err(InstanceManagementError::Disabled(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_ids_fail_before_io() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let output = Arc::new(CollectingOutputReceiver::new());

        let err = service
            .start_instances("main", &["bad id".to_string()], Duration::from_secs(1), output.clone())
            .await
            .unwrap_err();
        // the installation is checked first and does not exist
        assert!(matches!(err, InstanceManagementError::InstallationNotFound(_)));

        std::fs::create_dir_all(dir.path().join("inst").join("main")).unwrap();
        let err = service
            .start_instances("main", &["bad id".to_string()], Duration::from_secs(1), output.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceManagementError::MalformedId(_)));
        assert!(!dir.path().join("data/profiles/bad id").exists());

        let err = service
            .start_instances(
                "main",
                &["p1".to_string(), "p1".to_string()],
                Duration::from_secs(1),
                output.clone(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceManagementError::MalformedCommand(_)));

        let err = service
            .stop_instances(&["ghost".to_string()], Duration::from_secs(1), output)
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceManagementError::MalformedCommand(_)));
        assert!(matches!(
            service.dispose_instance("../x", &CollectingOutputReceiver::new()),
            Err(InstanceManagementError::MalformedId(_))
        ));
    }

    #[test]
    fn test_special_installation_ids() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        assert!(service.is_special_installation_id(":self"));
        assert!(service.is_special_installation_id("local:/opt/rce"));
        assert!(!service.is_special_installation_id("main"));

        let local = dir.path().join("custom");
        std::fs::create_dir_all(&local).unwrap();
        let resolved = service
            .resolve_installation_dir(&format!("local:{}", local.display()))
            .unwrap();
        assert_eq!(resolved, local);
        assert!(service.resolve_installation_dir("local:/does/not/exist").is_err());
    }

    #[test]
    fn test_dispose() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let output = CollectingOutputReceiver::new();
        let profile = dir.path().join("data/profiles/p1");
        std::fs::create_dir_all(&profile).unwrap();

        let lock = ProfileLock::try_acquire(&profile).unwrap().unwrap();
        let err = service.dispose_instance("p1", &output).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Instance with ID p1 currently in use. To stop it use 'im stop p1'."
        );

        drop(lock);
        service.dispose_instance("p1", &output).unwrap();
        assert!(!profile.exists());
        assert!(matches!(
            service.dispose_instance("p1", &output),
            Err(InstanceManagementError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_listing() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let output = CollectingOutputReceiver::new();
        service.list(ListScope::All, &output).unwrap();
        assert_eq!(
            output.lines(),
            vec!["No instances found.", "No installations found.", "No templates found."]
        );

        std::fs::create_dir_all(dir.path().join("data/profiles/p1")).unwrap();
        std::fs::create_dir_all(dir.path().join("data/templates/basic")).unwrap();
        std::fs::write(dir.path().join("inst/main.version"), "10.2.0").unwrap();

        let output = CollectingOutputReceiver::new();
        service.list(ListScope::All, &output).unwrap();
        assert_eq!(
            output.lines(),
            vec![
                "Instances: ",
                "  p1 (Not running)",
                "Installations: ",
                "  main (10.2.0)",
                "Templates: ",
                "  basic",
            ]
        );
        assert_eq!("templates".parse::<ListScope>().unwrap(), ListScope::Templates);
        assert!("everything".parse::<ListScope>().is_err());
    }

    #[test]
    fn test_installation_map_rebuilt_from_markers() {
        let dir = TempDir::new().unwrap();
        {
            let _ = service(&dir);
        }
        write_installation_marker(&dir.path().join("data/profiles/p1"), "main").unwrap();
        let service = service(&dir);
        assert_eq!(service.installation_of("p1").as_deref(), Some("main"));
        assert_eq!(service.installation_of("p2"), None);
    }

    #[tokio::test]
    async fn test_configure_with_template_and_im_access() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let template = dir.path().join("data/templates/relay");
        std::fs::create_dir_all(&template).unwrap();
        std::fs::write(
            template.join(CONFIGURATION_FILE),
            r#"{ "general": { "isRelay": true } }"#,
        )
        .unwrap();

        let output = Arc::new(CollectingOutputReceiver::new());
        let sequence = ConfigurationSequence::new()
            .apply_template("relay")
            .set_name("Relay 1")
            .enable_im_ssh_access(31999);
        service
            .configure_instance("r1", &sequence, output.clone())
            .await
            .unwrap();

        let file = dir.path().join("data/profiles/r1").join(CONFIGURATION_FILE);
        let config = InstanceConfiguration::load(&file).unwrap();
        assert_eq!(config.get("general/isRelay"), Some(&json!(true)));
        assert_eq!(config.get("general/instanceName"), Some(&json!("Relay 1")));
        assert_eq!(config.get("sshServer/port"), Some(&json!(31999)));
        assert!(dir.path().join("data").join(PASSPHRASE_FILE).is_file());
        assert!(output.contains("with template relay"));
        assert!(output.contains("Updated the configuration file of instance r1"));

        // management lock released again
        assert!(ManagementLock::try_acquire(&dir.path().join("data/profiles/r1"))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_misplaced_reset_leaves_file_alone() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let output = Arc::new(CollectingOutputReceiver::new());
        service
            .configure_instance("p1", &ConfigurationSequence::new().set_name("before"), output.clone())
            .await
            .unwrap();

        let err = service
            .configure_instance(
                "p1",
                &ConfigurationSequence::new().set_name("after").reset(),
                output,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstanceManagementError::Configuration(
                InstanceConfigurationError::MisplacedFirstOperation { .. }
            )
        ));
        let file = dir.path().join("data/profiles/p1").join(CONFIGURATION_FILE);
        let config = InstanceConfiguration::load(&file).unwrap();
        assert_eq!(config.get("general/instanceName"), Some(&json!("before")));
    }

    #[tokio::test]
    async fn test_force_download_never_overwrites_cache() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let output: Arc<dyn TextOutputReceiver> = Arc::new(CollectingOutputReceiver::new());
        for _ in 0..2 {
            service
                .setup_installation("main", "q", InstallationPolicy::ForceDownload, output.clone())
                .await
                .unwrap();
        }
        let downloads = dir.path().join("data/downloads");
        assert!(downloads.join("1.0.zip").is_file());
        assert!(downloads.join("1.0(1).zip").is_file());
        assert!(dir.path().join("inst/main/rce").is_file());

        let outcome = service
            .setup_installation("main", "q", InstallationPolicy::OnlyIfMissing, output)
            .await
            .unwrap();
        assert_eq!(outcome, InstallOutcome::AlreadyPresent);
    }
}
