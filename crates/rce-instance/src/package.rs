//! Product packages: remote version lookup, download and extraction

use crate::config::InstanceManagementConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Where product packages come from
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Version string published for `url_qualifier`
    async fn fetch_version(&self, url_qualifier: &str) -> Result<String>;

    /// Download the package of `version` to `destination`, replacing it
    async fn download_package(
        &self,
        url_qualifier: &str,
        version: &str,
        destination: &Path,
    ) -> Result<()>;
}

/// Package source behind plain HTTP(S) URLs
#[derive(Debug, Clone)]
pub struct HttpPackageSource {
    client: reqwest::Client,
    config: InstanceManagementConfig,
}

impl HttpPackageSource {
    pub fn new(config: InstanceManagementConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl PackageSource for HttpPackageSource {
    async fn fetch_version(&self, url_qualifier: &str) -> Result<String> {
        self.config.validate_download_settings()?;
        let url = self.config.version_file_url(url_qualifier);
        debug!(url = %url, "Fetching remote version information");
        let text = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text.trim().to_string())
    }

    async fn download_package(
        &self,
        url_qualifier: &str,
        version: &str,
        destination: &Path,
    ) -> Result<()> {
        self.config.validate_download_settings()?;
        let url = self.config.package_url(url_qualifier, version);
        debug!(url = %url, destination = %destination.display(), "Downloading installation package");
        let bytes = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        tokio::fs::write(destination, &bytes).await?;
        Ok(())
    }
}

/// Entries all below one top-level directory lose that directory on extraction
fn common_root(names: &[PathBuf]) -> Option<PathBuf> {
    let first = names.first()?.components().next()?;
    let Component::Normal(root) = first else {
        return None;
    };
    let shared = names.iter().all(|name| {
        let mut components = name.components();
        components.next() == Some(first)
            && (components.next().is_some() || names.len() > 1)
    });
    shared.then(|| PathBuf::from(root))
}

/// Extract a product zip into `installation_dir`
///
/// Blocking; run it off the async executor.
pub fn install_from_zip(zip_file: &Path, installation_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(zip_file)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let name = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsafe path in package: {}", entry.name()),
            )
        })?;
        names.push(name);
    }
    let root = common_root(&names);

    std::fs::create_dir_all(installation_dir)?;
    for (i, name) in names.iter().enumerate() {
        let relative = match &root {
            Some(root) => name.strip_prefix(root).unwrap_or(name.as_path()),
            None => name.as_path(),
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = installation_dir.join(relative);
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }
    debug!(
        package = %zip_file.display(),
        installation = %installation_dir.display(),
        entries = names.len(),
        "Extracted installation package"
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use std::path::Path;
    use zip::write::FileOptions;

    /// Write a zip with the given `(name, content)` files
    pub fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o755);
        for (name, content) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
}
