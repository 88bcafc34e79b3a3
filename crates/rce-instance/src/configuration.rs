//! Declarative edits of an instance's `configuration.json`
//!
//! A [`ConfigurationSequence`] is an ordered list of [`ConfigurationOperation`]s.
//! Resetting and applying a template replace the whole file, so they are only
//! accepted as the first entry of a sequence.

use crate::error::InstanceConfigurationError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, InstanceConfigurationError>;

/// Account the management service uses to reach instances over SSH
pub const IM_MASTER_USER_NAME: &str = "im_master";
pub const IM_MASTER_ROLE: &str = "im_master_role";
pub const IM_MASTER_ALLOWED_COMMANDS: &str = "ra.*|sysmon.*|components.*|net.*|wf.*|stop.*";

/// Outgoing network connection of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConnection {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub connect_on_startup: bool,
    #[serde(default = "default_initial_delay")]
    pub auto_retry_initial_delay: u64,
    #[serde(default = "default_maximum_delay")]
    pub auto_retry_maximum_delay: u64,
    #[serde(default = "default_delay_multiplier")]
    pub auto_retry_delay_multiplier: f64,
}

impl NetworkConnection {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            connect_on_startup: true,
            auto_retry_initial_delay: default_initial_delay(),
            auto_retry_maximum_delay: default_maximum_delay(),
            auto_retry_delay_multiplier: default_delay_multiplier(),
        }
    }
}

/// Outgoing SSH remote access connection of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnection {
    pub name: String,
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub login_name: String,
}

/// One configuration change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConfigurationOperation {
    Reset,
    ApplyTemplate { template: String },
    SetName { name: String },
    SetComment { comment: String },
    SetRelayFlag { enabled: bool },
    SetWorkflowHostFlag { enabled: bool },
    SetTempDirectory { path: String },
    AddConnection(NetworkConnection),
    RemoveConnection { name: String },
    AddServerPort { name: String, ip: String, port: u16 },
    RemoveServerPort { name: String },
    EnableSshServer,
    DisableSshServer,
    ConfigureSshServer { ip: String, port: u16 },
    EnableImSshAccess { port: u16 },
    SetIpFilter { enabled: bool },
    AddAllowedIp { ip: String },
    RemoveAllowedIp { ip: String },
    SetRequestTimeout { millis: u64 },
    SetForwardingTimeout { millis: u64 },
    AddSshConnection(SshConnection),
    RemoveSshConnection { name: String },
    PublishComponent { component: String },
    UnpublishComponent { component: String },
    SetBackgroundMonitoring { ids: String, interval_secs: u32 },
}

impl ConfigurationOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::ApplyTemplate { .. } => "apply-template",
            Self::SetName { .. } => "set-name",
            Self::SetComment { .. } => "set-comment",
            Self::SetRelayFlag { .. } => "set-relay-option",
            Self::SetWorkflowHostFlag { .. } => "set-workflow-host-option",
            Self::SetTempDirectory { .. } => "set-tempdir-path",
            Self::AddConnection(_) => "add-connection",
            Self::RemoveConnection { .. } => "remove-connection",
            Self::AddServerPort { .. } => "add-server-port",
            Self::RemoveServerPort { .. } => "remove-server-port",
            Self::EnableSshServer => "enable-ssh-server",
            Self::DisableSshServer => "disable-ssh-server",
            Self::ConfigureSshServer { .. } => "configure-ssh-server",
            Self::EnableImSshAccess { .. } => "enable-im-ssh-access",
            Self::SetIpFilter { .. } => "set-ip-filter-option",
            Self::AddAllowedIp { .. } => "add-allowed-inbound-ip",
            Self::RemoveAllowedIp { .. } => "remove-allowed-inbound-ip",
            Self::SetRequestTimeout { .. } => "set-request-timeout",
            Self::SetForwardingTimeout { .. } => "set-forwarding-timeout",
            Self::AddSshConnection(_) => "add-ssh-connection",
            Self::RemoveSshConnection { .. } => "remove-ssh-connection",
            Self::PublishComponent { .. } => "publish-component",
            Self::UnpublishComponent { .. } => "unpublish-component",
            Self::SetBackgroundMonitoring { .. } => "set-background-monitoring",
        }
    }

    /// Operations replacing the whole file
    pub fn replaces_file(&self) -> bool {
        matches!(self, Self::Reset | Self::ApplyTemplate { .. })
    }
}

/// Ordered configuration changes, built by chaining
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationSequence {
    operations: Vec<ConfigurationOperation>,
}

impl ConfigurationSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON array of operations
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn push(mut self, operation: ConfigurationOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn operations(&self) -> &[ConfigurationOperation] {
        &self.operations
    }

    pub fn first(&self) -> Option<&ConfigurationOperation> {
        self.operations.first()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Non-empty, and a file-replacing operation may only come first
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(InstanceConfigurationError::EmptySequence);
        }
        match self
            .operations
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, op)| op.replaces_file())
        {
            Some((position, operation)) => Err(InstanceConfigurationError::MisplacedFirstOperation {
                operation: operation.name(),
                position,
            }),
            None => Ok(()),
        }
    }

    pub fn needs_im_credentials(&self) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, ConfigurationOperation::EnableImSshAccess { .. }))
    }

    pub fn reset(self) -> Self {
        self.push(ConfigurationOperation::Reset)
    }

    pub fn apply_template(self, template: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::ApplyTemplate {
            template: template.into(),
        })
    }

    pub fn set_name(self, name: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::SetName { name: name.into() })
    }

    pub fn set_comment(self, comment: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::SetComment {
            comment: comment.into(),
        })
    }

    pub fn set_relay_flag(self, enabled: bool) -> Self {
        self.push(ConfigurationOperation::SetRelayFlag { enabled })
    }

    pub fn set_workflow_host_flag(self, enabled: bool) -> Self {
        self.push(ConfigurationOperation::SetWorkflowHostFlag { enabled })
    }

    pub fn set_temp_directory(self, path: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::SetTempDirectory { path: path.into() })
    }

    pub fn add_connection(self, connection: NetworkConnection) -> Self {
        self.push(ConfigurationOperation::AddConnection(connection))
    }

    pub fn remove_connection(self, name: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::RemoveConnection { name: name.into() })
    }

    pub fn add_server_port(self, name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        self.push(ConfigurationOperation::AddServerPort {
            name: name.into(),
            ip: ip.into(),
            port,
        })
    }

    pub fn remove_server_port(self, name: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::RemoveServerPort { name: name.into() })
    }

    pub fn enable_ssh_server(self) -> Self {
        self.push(ConfigurationOperation::EnableSshServer)
    }

    pub fn disable_ssh_server(self) -> Self {
        self.push(ConfigurationOperation::DisableSshServer)
    }

    pub fn configure_ssh_server(self, ip: impl Into<String>, port: u16) -> Self {
        self.push(ConfigurationOperation::ConfigureSshServer { ip: ip.into(), port })
    }

    pub fn enable_im_ssh_access(self, port: u16) -> Self {
        self.push(ConfigurationOperation::EnableImSshAccess { port })
    }

    pub fn set_ip_filter(self, enabled: bool) -> Self {
        self.push(ConfigurationOperation::SetIpFilter { enabled })
    }

    pub fn add_allowed_ip(self, ip: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::AddAllowedIp { ip: ip.into() })
    }

    pub fn remove_allowed_ip(self, ip: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::RemoveAllowedIp { ip: ip.into() })
    }

    pub fn set_request_timeout(self, millis: u64) -> Self {
        self.push(ConfigurationOperation::SetRequestTimeout { millis })
    }

    pub fn set_forwarding_timeout(self, millis: u64) -> Self {
        self.push(ConfigurationOperation::SetForwardingTimeout { millis })
    }

    pub fn add_ssh_connection(self, connection: SshConnection) -> Self {
        self.push(ConfigurationOperation::AddSshConnection(connection))
    }

    pub fn remove_ssh_connection(self, name: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::RemoveSshConnection { name: name.into() })
    }

    pub fn publish_component(self, component: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::PublishComponent {
            component: component.into(),
        })
    }

    pub fn unpublish_component(self, component: impl Into<String>) -> Self {
        self.push(ConfigurationOperation::UnpublishComponent {
            component: component.into(),
        })
    }

    pub fn set_background_monitoring(self, ids: impl Into<String>, interval_secs: u32) -> Self {
        self.push(ConfigurationOperation::SetBackgroundMonitoring {
            ids: ids.into(),
            interval_secs,
        })
    }
}

/// Salted SHA-256 of an SSH passphrase, as stored in account entries
pub fn hash_passphrase(passphrase: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(passphrase.as_bytes());
    format!("$sha256${}${}", salt, hex::encode(hasher.finalize()))
}

/// In-memory view of one `configuration.json`
#[derive(Debug, Clone)]
pub struct InstanceConfiguration {
    path: PathBuf,
    document: Value,
}

impl InstanceConfiguration {
    /// Load `path`; a missing file counts as an empty configuration
    pub fn load(path: &Path) -> Result<Self> {
        let document = match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => json!({}),
            Ok(text) => serde_json::from_str(&text).map_err(|source| {
                InstanceConfigurationError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => json!({}),
            Err(source) => {
                return Err(InstanceConfigurationError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if !document.is_object() {
            return Err(InstanceConfigurationError::NotAnObject("/".into()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            document,
        })
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Value at a `/`-separated path
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(&self.document, |node, key| node.get(key))
    }

    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.document).map_err(|source| {
            InstanceConfigurationError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        std::fs::write(&self.path, text).map_err(|source| InstanceConfigurationError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Apply all operations in order, returning one user-facing line per change
    ///
    /// File-replacing operations are expected to have been carried out by the
    /// caller already; here they are only checked for their position.
    pub fn apply_sequence(
        &mut self,
        instance_id: &str,
        sequence: &ConfigurationSequence,
        im_password_hash: Option<&str>,
    ) -> Result<Vec<String>> {
        sequence.validate()?;
        let mut messages = Vec::new();
        for operation in sequence.operations() {
            if let Some(message) = self.apply(instance_id, operation, im_password_hash)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn apply(
        &mut self,
        instance_id: &str,
        operation: &ConfigurationOperation,
        im_password_hash: Option<&str>,
    ) -> Result<Option<String>> {
        use ConfigurationOperation as Op;

        let message = match operation {
            Op::Reset | Op::ApplyTemplate { .. } => return Ok(None),
            Op::SetName { name } => {
                self.set("general", "instanceName", json!(name))?;
                format!("Setting instance name of instance {} to {}", instance_id, name)
            }
            Op::SetComment { comment } => {
                self.set("general", "comment", json!(comment))?;
                format!("Setting comment field of instance {} to {}", instance_id, comment)
            }
            Op::SetRelayFlag { enabled } => {
                self.set("general", "isRelay", json!(enabled))?;
                format!("The relay flag of instance {} is set to {}", instance_id, enabled)
            }
            Op::SetWorkflowHostFlag { enabled } => {
                self.set("general", "isWorkflowHost", json!(enabled))?;
                format!("Set workflow host flag of instance {} to {}", instance_id, enabled)
            }
            Op::SetTempDirectory { path } => {
                self.set("general", "tempDirectory", json!(path))?;
                format!("Setting temp directory of instance {}", instance_id)
            }
            Op::AddConnection(connection) => {
                let entry = json!({
                    "host": connection.host,
                    "port": connection.port,
                    "connectOnStartup": connection.connect_on_startup,
                    "autoRetryInitialDelay": connection.auto_retry_initial_delay,
                    "autoRetryMaximumDelay": connection.auto_retry_maximum_delay,
                    "autoRetryDelayMultiplier": connection.auto_retry_delay_multiplier,
                });
                self.set("network/connections", &connection.name, entry)?;
                format!("Adding connection {} to instance {}", connection.name, instance_id)
            }
            Op::RemoveConnection { name } => {
                self.remove_entry("network/connections", name, "connection")?;
                format!("Removing connection {} from instance {}", name, instance_id)
            }
            Op::AddServerPort { name, ip, port } => {
                self.set("network/serverPorts", name, json!({ "ip": ip, "port": port }))?;
                format!("Adding server port {} to instance {}", name, instance_id)
            }
            Op::RemoveServerPort { name } => {
                self.remove_entry("network/serverPorts", name, "server port")?;
                format!("Removing server port {} from instance {}", name, instance_id)
            }
            Op::EnableSshServer => {
                self.set("sshServer", "enabled", json!(true))?;
                format!("Enabling ssh server of instance {}", instance_id)
            }
            Op::DisableSshServer => {
                self.set("sshServer", "enabled", json!(false))?;
                format!("Disabling ssh server of instance {}", instance_id)
            }
            Op::ConfigureSshServer { ip, port } => {
                self.set("sshServer", "enabled", json!(true))?;
                self.set("sshServer", "ip", json!(ip))?;
                self.set("sshServer", "port", json!(port))?;
                format!("Configuring ssh server of instance {} on {}:{}", instance_id, ip, port)
            }
            Op::EnableImSshAccess { port } => {
                let hash = im_password_hash.ok_or(InstanceConfigurationError::MissingCredentials)?;
                self.enable_im_ssh_access(*port, hash)?;
                format!("Configuring ssh access for IM on instance {}", instance_id)
            }
            Op::SetIpFilter { enabled } => {
                self.set("network/ipFilter", "enabled", json!(enabled))?;
                format!("Set ip filter flag of instance {} to {}", instance_id, enabled)
            }
            Op::AddAllowedIp { ip } => {
                self.add_to_list("network/ipFilter", "allowedIPs", ip)?;
                format!("Added allowed IP {} to instance {}", ip, instance_id)
            }
            Op::RemoveAllowedIp { ip } => {
                self.remove_from_list("network/ipFilter", "allowedIPs", ip, "ip")?;
                format!("Removed allowed IP {} from {}", ip, instance_id)
            }
            Op::SetRequestTimeout { millis } => {
                self.set("network", "requestTimeoutMsec", json!(millis))?;
                format!("Set request timeout of instance {} to {}", instance_id, millis)
            }
            Op::SetForwardingTimeout { millis } => {
                self.set("network", "forwardingTimeoutMsec", json!(millis))?;
                format!("Set forwarding timeout of instance {} to {}", instance_id, millis)
            }
            Op::AddSshConnection(connection) => {
                let entry = json!({
                    "displayName": connection.display_name,
                    "host": connection.host,
                    "port": connection.port,
                    "loginName": connection.login_name,
                });
                self.set("sshRemoteAccess/sshConnections", &connection.name, entry)?;
                format!("Adding SSH connection {} to instance {}", connection.name, instance_id)
            }
            Op::RemoveSshConnection { name } => {
                self.remove_entry("sshRemoteAccess/sshConnections", name, "ssh connection")?;
                format!("Removing SSH connection {} from instance {}", name, instance_id)
            }
            Op::PublishComponent { component } => {
                self.add_to_list("publishing", "components", component)?;
                format!("Published component {} on instance {}", component, instance_id)
            }
            Op::UnpublishComponent { component } => {
                self.remove_from_list("publishing", "components", component, "component")?;
                format!("Unpublished component {} on instance {}", component, instance_id)
            }
            Op::SetBackgroundMonitoring { ids, interval_secs } => {
                self.set("backgroundMonitoring", "enableIds", json!(ids))?;
                self.set("backgroundMonitoring", "intervalSeconds", json!(interval_secs))?;
                format!(
                    "Setting background monitoring interval for instance {} to {}",
                    instance_id, interval_secs
                )
            }
        };
        Ok(Some(message))
    }

    fn enable_im_ssh_access(&mut self, port: u16, password_hash: &str) -> Result<()> {
        self.set("sshServer", "enabled", json!(true))?;
        let server = self.segment("sshServer")?;
        server.entry("ip").or_insert_with(|| json!("127.0.0.1"));
        server.entry("port").or_insert_with(|| json!(port));

        self.set(
            "sshServer/accounts",
            IM_MASTER_USER_NAME,
            json!({
                "role": IM_MASTER_ROLE,
                "enabled": true,
                "passwordHash": password_hash,
            }),
        )?;
        self.set(
            "sshServer/roles",
            IM_MASTER_ROLE,
            json!({ "allowedCommandPatterns": [IM_MASTER_ALLOWED_COMMANDS] }),
        )
    }

    /// Object at `path`, created on the way if missing
    fn segment(&mut self, path: &str) -> Result<&mut Map<String, Value>> {
        let mut node = &mut self.document;
        for key in path.split('/').filter(|s| !s.is_empty()) {
            let object = node
                .as_object_mut()
                .ok_or_else(|| InstanceConfigurationError::NotAnObject(path.to_string()))?;
            node = object.entry(key.to_string()).or_insert_with(|| json!({}));
        }
        node.as_object_mut()
            .ok_or_else(|| InstanceConfigurationError::NotAnObject(path.to_string()))
    }

    fn set(&mut self, segment: &str, key: &str, value: Value) -> Result<()> {
        self.segment(segment)?.insert(key.to_string(), value);
        Ok(())
    }

    fn remove_entry(&mut self, segment: &str, name: &str, kind: &'static str) -> Result<()> {
        match self.segment(segment)?.remove(name) {
            Some(_) => Ok(()),
            None => Err(InstanceConfigurationError::EntryNotPresent {
                kind,
                name: name.to_string(),
            }),
        }
    }

    /// Append `item`, moving it to the end if already listed
    fn add_to_list(&mut self, segment: &str, key: &str, item: &str) -> Result<()> {
        let object = self.segment(segment)?;
        let mut items = string_list(object.get(key));
        items.retain(|i| i != item);
        items.push(item.to_string());
        object.insert(key.to_string(), json!(items));
        Ok(())
    }

    fn remove_from_list(
        &mut self,
        segment: &str,
        key: &str,
        item: &str,
        kind: &'static str,
    ) -> Result<()> {
        let object = self.segment(segment)?;
        let mut items = string_list(object.get(key));
        let before = items.len();
        items.retain(|i| i != item);
        if items.len() == before {
            return Err(InstanceConfigurationError::EntryNotPresent {
                kind,
                name: item.to_string(),
            });
        }
        object.insert(key.to_string(), json!(items));
        Ok(())
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_initial_delay() -> u64 {
    5
}

fn default_maximum_delay() -> u64 {
    300
}

fn default_delay_multiplier() -> f64 {
    1.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn empty(dir: &TempDir) -> InstanceConfiguration {
        InstanceConfiguration::load(&dir.path().join("configuration.json")).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_object() {
        let dir = TempDir::new().unwrap();
        assert_eq!(empty(&dir).document(), &json!({}));
    }

    #[test]
    fn test_general_and_network_settings() {
        let dir = TempDir::new().unwrap();
        let mut config = empty(&dir);
        let sequence = ConfigurationSequence::new()
            .set_name("Relay A")
            .set_relay_flag(true)
            .set_workflow_host_flag(false)
            .add_connection(NetworkConnection::new("hub", "10.0.0.1", 21000))
            .add_server_port("default", "0.0.0.0", 21000)
            .set_request_timeout(40_000)
            .publish_component("rce/Script");

        let messages = config.apply_sequence("a", &sequence, None).unwrap();
        assert_eq!(messages.len(), 7);
        assert_eq!(config.get("general/instanceName"), Some(&json!("Relay A")));
        assert_eq!(config.get("general/isRelay"), Some(&json!(true)));
        assert_eq!(config.get("network/connections/hub/port"), Some(&json!(21000)));
        assert_eq!(config.get("network/serverPorts/default/ip"), Some(&json!("0.0.0.0")));
        assert_eq!(config.get("network/requestTimeoutMsec"), Some(&json!(40_000)));
        assert_eq!(config.get("publishing/components"), Some(&json!(["rce/Script"])));

        config.save().unwrap();
        let reloaded = InstanceConfiguration::load(&dir.path().join("configuration.json")).unwrap();
        assert_eq!(reloaded.document(), config.document());
    }

    #[test]
    fn test_lists_have_no_duplicates() {
        let dir = TempDir::new().unwrap();
        let mut config = empty(&dir);
        let sequence = ConfigurationSequence::new()
            .add_allowed_ip("10.0.0.1")
            .add_allowed_ip("10.0.0.2")
            .add_allowed_ip("10.0.0.1")
            .remove_allowed_ip("10.0.0.2");
        config.apply_sequence("a", &sequence, None).unwrap();
        assert_eq!(
            config.get("network/ipFilter/allowedIPs"),
            Some(&json!(["10.0.0.1"]))
        );
    }

    #[test]
    fn test_removing_missing_entries_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = empty(&dir);
        for sequence in [
            ConfigurationSequence::new().remove_allowed_ip("1.2.3.4"),
            ConfigurationSequence::new().remove_connection("nope"),
            ConfigurationSequence::new().remove_server_port("nope"),
            ConfigurationSequence::new().remove_ssh_connection("nope"),
            ConfigurationSequence::new().unpublish_component("nope"),
        ] {
            let err = config.apply_sequence("a", &sequence, None).unwrap_err();
            assert!(matches!(err, InstanceConfigurationError::EntryNotPresent { .. }));
        }
    }

    #[test]
    fn test_reset_only_first() {
        let dir = TempDir::new().unwrap();
        let mut config = empty(&dir);

        let ok = ConfigurationSequence::new().reset().set_name("x");
        assert!(config.apply_sequence("a", &ok, None).is_ok());

        let late = ConfigurationSequence::new().set_name("x").apply_template("basic");
        let err = config.apply_sequence("a", &late, None).unwrap_err();
        assert!(matches!(
            err,
            InstanceConfigurationError::MisplacedFirstOperation { position: 1, .. }
        ));

        let err = config
            .apply_sequence("a", &ConfigurationSequence::new(), None)
            .unwrap_err();
        assert!(matches!(err, InstanceConfigurationError::EmptySequence));
    }

    #[test]
    fn test_im_ssh_access_keeps_existing_server_settings() {
        let dir = TempDir::new().unwrap();
        let mut config = empty(&dir);
        let sequence = ConfigurationSequence::new()
            .configure_ssh_server("192.168.0.5", 31005)
            .enable_im_ssh_access(31999);

        assert!(matches!(
            config.apply_sequence("a", &sequence, None),
            Err(InstanceConfigurationError::MissingCredentials)
        ));

        let hash = hash_passphrase("secret", "salt");
        config.apply_sequence("a", &sequence, Some(&hash)).unwrap();
        assert_eq!(config.get("sshServer/port"), Some(&json!(31005)));
        assert_eq!(config.get("sshServer/ip"), Some(&json!("192.168.0.5")));
        assert_eq!(
            config.get("sshServer/accounts/im_master/passwordHash"),
            Some(&json!(hash))
        );
        assert_eq!(
            config.get("sshServer/roles/im_master_role/allowedCommandPatterns"),
            Some(&json!([IM_MASTER_ALLOWED_COMMANDS]))
        );
    }

    #[test]
    fn test_sequence_from_json() {
        let sequence = ConfigurationSequence::from_json(
            r#"[
                { "op": "reset" },
                { "op": "set_name", "name": "node-1" },
                { "op": "add_connection", "name": "hub", "host": "hub.local", "port": 21000 },
                { "op": "set_background_monitoring", "ids": "basic", "interval_secs": 10 }
            ]"#,
        )
        .unwrap();
        assert_eq!(sequence.operations().len(), 4);
        assert_eq!(sequence.first(), Some(&ConfigurationOperation::Reset));
        assert_eq!(
            sequence.operations()[2],
            ConfigurationOperation::AddConnection(NetworkConnection::new("hub", "hub.local", 21000))
        );
    }

    #[test]
    fn test_passphrase_hash_format() {
        let hash = hash_passphrase("secret", "abc");
        assert!(hash.starts_with("$sha256$abc$"));
        assert_eq!(hash.len(), "$sha256$abc$".len() + 64);
    }
}
