//! `rced` launched and stopped as a managed instance
#![cfg(unix)]

use rce_instance::{
    CollectingOutputReceiver, InstanceManagementConfig, InstanceManagementService,
    InstanceOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

fn service_for_this_build(dir: &TempDir) -> (InstanceManagementService, PathBuf) {
    let exe = PathBuf::from(env!("CARGO_BIN_EXE_rced"));
    let mut config =
        InstanceManagementConfig::with_roots(dir.path().join("data"), dir.path().join("inst"));
    config.self_installation = exe.parent().map(Path::to_path_buf);
    config.executable_name = exe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap();
    (InstanceManagementService::with_local_processes(config), exe)
}

#[tokio::test]
async fn test_start_lock_and_stop() {
    let dir = TempDir::new().unwrap();
    let (service, exe) = service_for_this_build(&dir);
    let output = Arc::new(CollectingOutputReceiver::new());
    let ids = vec!["p1".to_string()];

    let report = service
        .start_instances(":self", &ids, Duration::from_secs(60), output.clone())
        .await
        .unwrap();
    assert_eq!(report.outcome("p1"), Some(&InstanceOutcome::Started));
    assert!(service.is_instance_running("p1").unwrap());
    assert_eq!(service.installation_of("p1").as_deref(), Some(":self"));

    // a second node on the same profile gives up right away
    let profile = dir.path().join("data/profiles/p1");
    let second = timeout(
        Duration::from_secs(30),
        tokio::process::Command::new(&exe)
            .arg("--profile")
            .arg(&profile)
            .arg("--batch")
            .output(),
    )
    .await
    .expect("second node did not exit")
    .unwrap();
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("Failed to lock profile"));

    let report = service
        .stop_instances(&ids, Duration::from_secs(30), output.clone())
        .await
        .unwrap();
    assert_eq!(report.outcome("p1"), Some(&InstanceOutcome::Stopped));
    assert!(!service.is_instance_running("p1").unwrap());
    assert_eq!(service.installation_of("p1"), None);
    assert!(output.contains("Instance p1 started"));
    assert!(output.contains("Instance p1 stopped"));
}

#[tokio::test]
async fn test_stop_from_another_management_process() {
    let dir = TempDir::new().unwrap();
    let (launcher, _) = service_for_this_build(&dir);
    let output = Arc::new(CollectingOutputReceiver::new());
    let ids = vec!["p2".to_string()];

    let report = launcher
        .start_instances(":self", &ids, Duration::from_secs(60), output.clone())
        .await
        .unwrap();
    assert_eq!(report.outcome("p2"), Some(&InstanceOutcome::Started));

    // each `rced im` invocation builds its own service
    let (stopper, _) = service_for_this_build(&dir);
    assert!(stopper.is_instance_running("p2").unwrap());
    let report = stopper
        .stop_instances(&ids, Duration::from_secs(30), output.clone())
        .await
        .unwrap();
    assert_eq!(report.outcome("p2"), Some(&InstanceOutcome::Stopped));
    assert!(!stopper.is_instance_running("p2").unwrap());
    assert!(!launcher.is_instance_running("p2").unwrap());
    assert!(output.contains("Instance p2 stopped"));
}
