//! Lock release after every start/stop batch

use super::{InstanceOperations, OperationReport, Result};
use crate::error::InstanceOperationError;
use crate::lock::ManagementLockTable;
use crate::output::TextOutputReceiver;
use crate::profile::{profile_name, remove_stale_markers};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Releases the management locks of a batch once the inner call returns,
/// whatever its outcome, and cleans up after failed profiles
pub struct LockReleasingOperations {
    inner: Arc<dyn InstanceOperations>,
    locks: Arc<ManagementLockTable>,
}

pub fn releasing_locks(
    inner: Arc<dyn InstanceOperations>,
    locks: Arc<ManagementLockTable>,
) -> Arc<dyn InstanceOperations> {
    Arc::new(LockReleasingOperations { inner, locks })
}

impl LockReleasingOperations {
    fn finish(
        &self,
        profiles: &[PathBuf],
        result: Result<OperationReport>,
    ) -> Result<OperationReport> {
        let failed: Vec<&PathBuf> = match &result {
            Ok(report) => profiles
                .iter()
                .filter(|p| {
                    report
                        .outcome(&profile_name(p))
                        .map_or(false, |o| !o.is_success())
                })
                .collect(),
            Err(_) => profiles.iter().collect(),
        };

        let mut cleanup_error = None;
        for profile in failed {
            match remove_stale_markers(profile) {
                Ok(true) => debug!(profile = %profile.display(), "Removed stale profile markers"),
                Ok(false) => {}
                Err(e) => {
                    error!(profile = %profile.display(), error = %e, "Failed to remove stale profile markers");
                    cleanup_error.get_or_insert((profile_name(profile), e));
                }
            }
        }

        for profile in profiles {
            let Some(lock) = self.locks.take(profile) else {
                continue;
            };
            if let Err(e) = lock.release() {
                error!(profile = %profile.display(), error = %e, "Failed to release management lock");
                cleanup_error.get_or_insert((profile_name(profile), e));
            }
        }

        match (result, cleanup_error) {
            (result, None) => result,
            (Ok(_), Some((profile, source))) => Err(InstanceOperationError::LockRelease {
                profile,
                source,
                original: None,
            }),
            (Err(original), Some((profile, source))) => Err(InstanceOperationError::LockRelease {
                profile,
                source,
                original: Some(Box::new(original)),
            }),
        }
    }
}

#[async_trait]
impl InstanceOperations for LockReleasingOperations {
    async fn start_instances(
        &self,
        profiles: Vec<PathBuf>,
        installation: PathBuf,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        let result = self
            .inner
            .start_instances(profiles.clone(), installation, timeout, output)
            .await;
        self.finish(&profiles, result)
    }

    async fn shutdown_instances(
        &self,
        profiles: Vec<PathBuf>,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        let result = self
            .inner
            .shutdown_instances(profiles.clone(), timeout, output)
            .await;
        self.finish(&profiles, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{ManagementLock, MANAGEMENT_LOCK_FILE, PROFILE_LOCK_FILE};
    use crate::operations::InstanceOutcome;
    use crate::output::CollectingOutputReceiver;
    use crate::profile::{write_installation_marker, INSTALLATION_MARKER_FILE};
    use tempfile::TempDir;

    /// Takes the management lock like the process layer and reports a fixed outcome
    struct LockingStub {
        locks: Arc<ManagementLockTable>,
        outcome: Option<InstanceOutcome>,
    }

    #[async_trait]
    impl InstanceOperations for LockingStub {
        async fn start_instances(
            &self,
            profiles: Vec<PathBuf>,
            _installation: PathBuf,
            _timeout: Duration,
            _output: Arc<dyn TextOutputReceiver>,
        ) -> Result<OperationReport> {
            let mut report = OperationReport::new();
            for profile in profiles {
                let lock = ManagementLock::try_acquire(&profile).unwrap().unwrap();
                self.locks.insert(profile.clone(), lock);
                match &self.outcome {
                    Some(outcome) => report.record(profile_name(&profile), outcome.clone()),
                    None => {
                        return Err(InstanceOperationError::ExecutableMissing(PathBuf::from("x")))
                    }
                }
            }
            Ok(report)
        }

        async fn shutdown_instances(
            &self,
            profiles: Vec<PathBuf>,
            timeout: Duration,
            output: Arc<dyn TextOutputReceiver>,
        ) -> Result<OperationReport> {
            self.start_instances(profiles, PathBuf::new(), timeout, output)
                .await
        }
    }

    fn setup(outcome: Option<InstanceOutcome>) -> (TempDir, PathBuf, Arc<ManagementLockTable>, Arc<dyn InstanceOperations>) {
        let dir = TempDir::new().unwrap();
        let profile = dir.path().join("p1");
        write_installation_marker(&profile, "inst").unwrap();
        std::fs::write(profile.join(PROFILE_LOCK_FILE), "").unwrap();
        let locks = Arc::new(ManagementLockTable::new());
        let stub = Arc::new(LockingStub {
            locks: locks.clone(),
            outcome,
        });
        let ops = releasing_locks(stub, locks.clone());
        (dir, profile, locks, ops)
    }

    #[tokio::test]
    async fn test_success_releases_lock_and_keeps_markers() {
        let (_dir, profile, locks, ops) = setup(Some(InstanceOutcome::Started));
        let report = ops
            .start_instances(
                vec![profile.clone()],
                PathBuf::new(),
                Duration::from_secs(1),
                Arc::new(CollectingOutputReceiver::new()),
            )
            .await
            .unwrap();
        assert!(report.is_success());
        assert!(locks.is_empty());
        assert!(!profile.join(MANAGEMENT_LOCK_FILE).exists());
        assert!(profile.join(INSTALLATION_MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn test_failure_removes_stale_markers() {
        let (_dir, profile, locks, ops) = setup(Some(InstanceOutcome::TimedOut));
        let report = ops
            .start_instances(
                vec![profile.clone()],
                PathBuf::new(),
                Duration::from_secs(1),
                Arc::new(CollectingOutputReceiver::new()),
            )
            .await
            .unwrap();
        assert!(!report.is_success());
        assert!(locks.is_empty());
        assert!(!profile.join(INSTALLATION_MARKER_FILE).exists());
        assert!(!profile.join(PROFILE_LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_error_still_releases() {
        let (_dir, profile, locks, ops) = setup(None);
        let err = ops
            .shutdown_instances(
                vec![profile.clone()],
                Duration::from_secs(1),
                Arc::new(CollectingOutputReceiver::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceOperationError::ExecutableMissing(_)));
        assert!(locks.is_empty());
        assert!(ManagementLock::try_acquire(&profile).unwrap().is_some());
    }
}
