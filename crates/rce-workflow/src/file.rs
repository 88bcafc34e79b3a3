//! Loading and saving `.wf` workflow files
//!
//! Files are JSON documents carrying a `workflowVersion`. Older files can be
//! upgraded on load; whether that happens, and whether the upgraded file is
//! written back, depends on the [`UpdatePolicy`].

use rce_types::WorkflowDescription;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Newest workflow file format this build understands
pub const CURRENT_WORKFLOW_VERSION: u32 = 5;

/// What to do with files in an older format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Fail with [`WorkflowFileError::UpdateRequired`]
    AbortIfUpdateRequired,
    /// Upgrade in memory only
    Silent,
    /// Upgrade, keep a backup of the original and rewrite the file
    NonSilent,
}

/// Errors raised while reading or writing workflow files
#[derive(Debug, Error)]
pub enum WorkflowFileError {
    #[error("Failed to access workflow file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file could not be turned into a workflow description
    #[error("Failed to parse workflow file {path}: {message}")]
    Parse {
        path: PathBuf,
        message: String,
        /// Whatever could be read, for display
        partial: Option<Box<WorkflowDescription>>,
    },

    #[error("Workflow file {path} has version {found}, newest supported is {supported}")]
    NewerVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("Workflow file {path} has version {found} and must be updated to {supported}")]
    UpdateRequired {
        path: PathBuf,
        found: u32,
        supported: u32,
        description: Box<WorkflowDescription>,
    },

    #[error("Failed to serialize workflow: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl WorkflowFileError {
    /// Description parsed before the failure, if any
    pub fn partial_description(&self) -> Option<&WorkflowDescription> {
        match self {
            Self::Parse { partial, .. } => partial.as_deref(),
            Self::UpdateRequired { description, .. } => Some(description),
            _ => None,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of a successful load
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub description: WorkflowDescription,
    /// Format version found in the file
    pub original_version: u32,
    pub updated: bool,
    /// Copy of the original file written before rewriting it
    pub backup: Option<PathBuf>,
}

/// Reads workflow files, upgrading old formats
#[derive(Debug, Clone)]
pub struct WorkflowFileLoader {
    supported_version: u32,
}

impl Default for WorkflowFileLoader {
    fn default() -> Self {
        Self {
            supported_version: CURRENT_WORKFLOW_VERSION,
        }
    }
}

impl WorkflowFileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, path: &Path, policy: UpdatePolicy) -> Result<LoadedWorkflow, WorkflowFileError> {
        let text = std::fs::read_to_string(path).map_err(|e| WorkflowFileError::io(path, e))?;
        let value: Value = serde_json::from_str(&text).map_err(|e| WorkflowFileError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
            partial: None,
        })?;

        let found = value
            .get("workflowVersion")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if found > self.supported_version {
            return Err(WorkflowFileError::NewerVersion {
                path: path.to_path_buf(),
                found,
                supported: self.supported_version,
            });
        }

        if found == self.supported_version {
            let description = parse_description(path, value)?;
            return Ok(LoadedWorkflow {
                description,
                original_version: found,
                updated: false,
                backup: None,
            });
        }

        if policy == UpdatePolicy::AbortIfUpdateRequired {
            let mut description =
                serde_json::from_value(upgrade(value.clone(), found, self.supported_version))
                    .ok()
                    .or_else(|| partial_description(&value))
                    .unwrap_or_else(|| WorkflowDescription::new("", found));
            description.workflow_version = found;
            return Err(WorkflowFileError::UpdateRequired {
                path: path.to_path_buf(),
                found,
                supported: self.supported_version,
                description: Box::new(description),
            });
        }

        let upgraded = upgrade(value, found, self.supported_version);
        let description = parse_description(path, upgraded)?;
        info!(path = %path.display(), from = found, to = self.supported_version, "Upgraded workflow file");

        let backup = if policy == UpdatePolicy::NonSilent {
            let backup = backup_path(path, found);
            std::fs::write(&backup, &text).map_err(|e| WorkflowFileError::io(&backup, e))?;
            self.save(path, &description)?;
            Some(backup)
        } else {
            None
        };

        Ok(LoadedWorkflow {
            description,
            original_version: found,
            updated: true,
            backup,
        })
    }

    /// Write `description` without any start-time placement
    pub fn save(&self, path: &Path, description: &WorkflowDescription) -> Result<(), WorkflowFileError> {
        let text = serde_json::to_string_pretty(&description.to_persistent())?;
        std::fs::write(path, text).map_err(|e| WorkflowFileError::io(path, e))?;
        debug!(path = %path.display(), "Saved workflow file");
        Ok(())
    }
}

fn parse_description(path: &Path, value: Value) -> Result<WorkflowDescription, WorkflowFileError> {
    let partial = partial_description(&value);
    serde_json::from_value(value).map_err(|e| WorkflowFileError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
        partial: partial.map(Box::new),
    })
}

/// Header fields only, for showing something about a broken file
fn partial_description(value: &Value) -> Option<WorkflowDescription> {
    let object = value.as_object()?;
    let name = object.get("name").and_then(Value::as_str).unwrap_or_default();
    let version = object
        .get("workflowVersion")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let mut description = WorkflowDescription::new(name, version);
    if let Some(id) = object.get("identifier").and_then(Value::as_str) {
        description.identifier = id.to_string();
    }
    Some(description)
}

/// Step an old document up to `to`, one format version at a time
fn upgrade(mut value: Value, from: u32, to: u32) -> Value {
    for version in from..to {
        if let Some(nodes) = value.get_mut("nodes").and_then(Value::as_array_mut) {
            for node in nodes.iter_mut().filter_map(Value::as_object_mut) {
                match version {
                    // node identifiers became mandatory
                    0..=3 => {
                        node.entry("identifier")
                            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
                    }
                    // component versions became mandatory
                    _ => {
                        node.entry("componentVersion")
                            .or_insert_with(|| Value::String("1.0".into()));
                    }
                }
            }
        }
    }
    if let Some(object) = value.as_object_mut() {
        object.insert("workflowVersion".into(), Value::from(to));
        object
            .entry("identifier")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
    }
    value
}

fn backup_path(path: &Path, version: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());
    path.with_file_name(format!("{}_backup_{}.wf", stem, version))
}
