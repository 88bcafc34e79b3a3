//! Configuration for rce-daemon

use rce_instance::InstanceManagementConfig;
use rce_notification::NotificationConfig;
use rce_workflow::WorkflowExecutionConfig;
use serde::{Deserialize, Serialize};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Identity of this node
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub workflow: WorkflowExecutionConfig,

    #[serde(default)]
    pub instance_management: InstanceManagementConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id; falls back to the profile's instance name, then to the host
    #[serde(default)]
    pub node_id: Option<String>,

    /// Whether this node accepts workflow controllers
    #[serde(default = "default_true")]
    pub workflow_host: bool,

    /// How often subscriptions to workflow state topics are renewed on
    /// nodes that are not covered yet
    #[serde(default = "default_subscription_refresh")]
    pub subscription_refresh_secs: u64,
}

impl NodeConfig {
    pub fn subscription_refresh(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.subscription_refresh_secs.max(1))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            workflow_host: true,
            subscription_refresh_secs: default_subscription_refresh(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_subscription_refresh() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, an optional file and `RCE_` variables
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `RCE_INSTANCE_MANAGEMENT__DATA_ROOT`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RCE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert!(config.node.workflow_host);
        assert!(config.node.node_id.is_none());
        assert_eq!(config.node.subscription_refresh_secs, 10);
        assert_eq!(config.logging.level, "info");
        assert!(config.instance_management.data_root.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rced.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "node": {{ "node_id": "relay-1" }},
                "notifications": {{ "batch_max_size": 7 }},
                "instance_management": {{ "data_root": "/srv/rce/data", "installations_root": "/srv/rce/inst" }}
            }}"#
        )
        .unwrap();

        let config = DaemonConfig::load(path.to_str()).unwrap();
        assert_eq!(config.node.node_id.as_deref(), Some("relay-1"));
        assert_eq!(config.notifications.batch_max_size, 7);
        assert_eq!(
            config.instance_management.data_root,
            Some(std::path::PathBuf::from("/srv/rce/data"))
        );
        assert!(config.node.workflow_host);
    }
}
