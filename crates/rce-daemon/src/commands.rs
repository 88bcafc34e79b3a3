//! Execution of `rced im` commands against the instance management service

use crate::cli::ImCommand;
use crate::error::{DaemonError, DaemonResult};
use rce_instance::{ConfigurationSequence, InstanceManagementService, ListScope, TextOutputReceiver};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Run one management command, writing user-facing lines to `output`
pub async fn run_im_command(
    service: &InstanceManagementService,
    command: ImCommand,
    output: Arc<dyn TextOutputReceiver>,
) -> DaemonResult<()> {
    let timeout = |secs: Option<u64>| {
        secs.map(Duration::from_secs)
            .unwrap_or_else(|| service.config().operation_timeout())
    };
    debug!(?command, "Running instance management command");

    match command {
        ImCommand::Install {
            installation,
            url_qualifier,
            policy,
        } => {
            service
                .setup_installation(&installation, &url_qualifier, policy.into(), output)
                .await?;
        }
        ImCommand::Reinstall {
            installation,
            url_qualifier,
            policy,
            timeout: secs,
        } => {
            service
                .reinstall(&installation, &url_qualifier, policy.into(), timeout(secs), output)
                .await?;
        }
        ImCommand::Start {
            installation,
            instances,
            timeout: secs,
        } => {
            service
                .start_instances(&installation, &instances, timeout(secs), output)
                .await?;
        }
        ImCommand::Stop {
            instances,
            timeout: secs,
        } => {
            service
                .stop_instances(&instances, timeout(secs), output)
                .await?;
        }
        ImCommand::StartAll {
            installation,
            timeout: secs,
        } => {
            service
                .start_all_instances(&installation, timeout(secs), output)
                .await?;
        }
        ImCommand::StopAll {
            installation,
            timeout: secs,
        } => {
            service
                .stop_all_instances(installation.as_deref(), timeout(secs), output)
                .await?;
        }
        ImCommand::Configure { instance, file } => {
            let text = std::fs::read_to_string(&file)?;
            let sequence = ConfigurationSequence::from_json(&text).map_err(|source| {
                DaemonError::ConfigurationSequence {
                    path: file.clone(),
                    source,
                }
            })?;
            service
                .configure_instance(&instance, &sequence, output)
                .await?;
        }
        ImCommand::List { scope } => {
            let scope: ListScope = scope.parse()?;
            service.list(scope, output.as_ref())?;
        }
        ImCommand::Dispose { instance } => {
            service.dispose_instance(&instance, output.as_ref())?;
        }
        ImCommand::Info => {
            service.show_information(output.as_ref())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rce_instance::{CollectingOutputReceiver, InstanceManagementConfig, InstanceManagementError};
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> InstanceManagementService {
        InstanceManagementService::with_local_processes(InstanceManagementConfig::with_roots(
            dir.path().join("data"),
            dir.path().join("inst"),
        ))
    }

    #[tokio::test]
    async fn test_configure_from_file() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let file = dir.path().join("sequence.json");
        std::fs::write(
            &file,
            r#"[ { "op": "set_name", "name": "Workstation" }, { "op": "set_relay_flag", "enabled": true } ]"#,
        )
        .unwrap();

        let output = Arc::new(CollectingOutputReceiver::new());
        run_im_command(
            &service,
            ImCommand::Configure {
                instance: "ws1".into(),
                file,
            },
            output.clone(),
        )
        .await
        .unwrap();
        assert!(output.contains("Updated the configuration file of instance ws1"));

        run_im_command(&service, ImCommand::List { scope: "instances".into() }, output.clone())
            .await
            .unwrap();
        assert!(output.contains("ws1 (Not running)"));
    }

    #[tokio::test]
    async fn test_errors_are_reported() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let output = Arc::new(CollectingOutputReceiver::new());

        let err = run_im_command(&service, ImCommand::Dispose { instance: "nope".into() }, output.clone())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Instance(InstanceManagementError::InstanceNotFound(_))
        ));

        let err = run_im_command(&service, ImCommand::List { scope: "things".into() }, output)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Instance(InstanceManagementError::MalformedCommand(_))
        ));
    }
}
