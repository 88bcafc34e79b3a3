//! Process-level start and stop of instances

use super::{InstanceOperations, InstanceOutcome, OperationReport, Result};
use crate::config::InstanceManagementConfig;
use crate::error::InstanceOperationError;
use crate::lock::{is_profile_locked, ManagementLock, ManagementLockTable};
use crate::output::TextOutputReceiver;
use crate::profile::{
    clear_shutdown_data, profile_name, read_shutdown_pid, request_shutdown,
};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// How long a discarded process gets to go away after being killed
const KILL_GRACE: Duration = Duration::from_secs(2);

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchVerdict {
    Ready,
    ProfileLocked,
    Exited,
}

/// First verdict wins; later ones are dropped
struct VerdictSlot {
    sender: Mutex<Option<oneshot::Sender<LaunchVerdict>>>,
    open_streams: AtomicUsize,
}

impl VerdictSlot {
    fn new(sender: oneshot::Sender<LaunchVerdict>, streams: usize) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            open_streams: AtomicUsize::new(streams),
        }
    }

    fn resolve(&self, verdict: LaunchVerdict) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(verdict);
        }
    }

    /// Both streams at EOF without a marker means the process is gone
    fn stream_closed(&self) {
        if self.open_streams.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.resolve(LaunchVerdict::Exited);
        }
    }
}

fn watch_stream<R>(
    reader: R,
    profile: String,
    marker: String,
    on_marker: LaunchVerdict,
    slot: Arc<VerdictSlot>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    trace!(profile = %profile, "{}", line);
                    if line.contains(&marker) {
                        slot.resolve(on_marker);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(profile = %profile, error = %e, "Instance output stream failed");
                    break;
                }
            }
        }
        slot.stream_closed();
    });
}

/// Launches instance executables and watches their output for the startup markers
///
/// Management locks taken here are parked in the shared [`ManagementLockTable`]
/// and stay held when a call returns; releasing them is left to the caller.
pub struct ProcessInstanceOperations {
    config: InstanceManagementConfig,
    locks: Arc<ManagementLockTable>,
    children: Mutex<HashMap<PathBuf, Child>>,
}

impl ProcessInstanceOperations {
    pub fn new(config: InstanceManagementConfig, locks: Arc<ManagementLockTable>) -> Self {
        Self {
            config,
            locks,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn locks(&self) -> &Arc<ManagementLockTable> {
        &self.locks
    }

    /// Processes launched here that were not stopped yet
    pub fn tracked_count(&self) -> usize {
        self.children.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn track(&self, profile: PathBuf, child: Child) {
        let mut children = self.children.lock().unwrap_or_else(|p| p.into_inner());
        children.insert(profile, child);
    }

    fn untrack(&self, profile: &Path) -> Option<Child> {
        let mut children = self.children.lock().unwrap_or_else(|p| p.into_inner());
        children.remove(profile)
    }

    fn child_alive(&self, profile: &Path) -> bool {
        let mut children = self.children.lock().unwrap_or_else(|p| p.into_inner());
        children
            .get_mut(profile)
            .map_or(false, |child| matches!(child.try_wait(), Ok(None)))
    }

    fn is_running(&self, profile: &Path) -> bool {
        let locked = match is_profile_locked(profile) {
            Ok(locked) => locked,
            Err(e) => {
                debug!(profile = %profile.display(), error = %e, "Checking the profile lock failed");
                false
            }
        };
        locked || self.child_alive(profile)
    }

    async fn take_management_lock(&self, profile: &Path) -> std::result::Result<(), InstanceOutcome> {
        match ManagementLock::acquire(
            profile,
            self.config.lock_timeout(),
            self.config.lock_retry_interval(),
        )
        .await
        {
            Ok(lock) => {
                self.locks.insert(profile.to_path_buf(), lock);
                Ok(())
            }
            Err(InstanceOperationError::LockContention { .. }) => Err(InstanceOutcome::LockContention),
            Err(e) => Err(InstanceOutcome::Failed(e.to_string())),
        }
    }

    /// Kill a process whose launch did not work out
    async fn discard(&self, profile: &Path) {
        if let Some(mut child) = self.untrack(profile) {
            if let Err(e) = child.start_kill() {
                debug!(profile = %profile.display(), error = %e, "Kill failed, process probably gone");
            }
            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        }
    }

    fn spawn(&self, executable: &Path, installation: &Path, profile: &Path) -> std::io::Result<Child> {
        Command::new(executable)
            .args(self.config.launch_arguments_for(profile))
            .current_dir(installation)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

#[cfg(unix)]
async fn request_termination(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        child.start_kill()
    }
}

#[cfg(not(unix))]
async fn request_termination(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

async fn terminate(mut child: Child, timeout: Duration) -> InstanceOutcome {
    if let Err(e) = request_termination(&mut child).await {
        warn!(error = %e, "Failed to signal instance");
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(%status, "Instance terminated");
            InstanceOutcome::Stopped
        }
        Ok(Err(e)) => InstanceOutcome::Failed(format!("Failed to wait for instance: {}", e)),
        Err(_) => {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            InstanceOutcome::Failed(format!(
                "Instance did not stop within {}ms and was killed",
                timeout.as_millis()
            ))
        }
    }
}

impl ProcessInstanceOperations {
    /// Lock, launch and await one profile; its startup deadline begins once the process runs
    async fn start_one(
        &self,
        profile: PathBuf,
        executable: &Path,
        installation: &Path,
        timeout: Duration,
        output: &dyn TextOutputReceiver,
    ) -> InstanceOutcome {
        let name = profile_name(&profile);
        if let Err(outcome) = self.take_management_lock(&profile).await {
            return outcome;
        }

        let mut child = match self.spawn(executable, installation, &profile) {
            Ok(child) => child,
            Err(e) => {
                warn!(profile = %name, error = %e, "Failed to launch instance");
                return InstanceOutcome::Failed(format!("Failed to launch: {}", e));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let streams = usize::from(stdout.is_some()) + usize::from(stderr.is_some());
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(VerdictSlot::new(tx, streams));
        if let Some(stdout) = stdout {
            watch_stream(
                stdout,
                name.clone(),
                self.config.startup_marker.clone(),
                LaunchVerdict::Ready,
                slot.clone(),
            );
        }
        if let Some(stderr) = stderr {
            watch_stream(
                stderr,
                name.clone(),
                self.config.lock_failure_marker.clone(),
                LaunchVerdict::ProfileLocked,
                slot.clone(),
            );
        }
        if streams == 0 {
            slot.resolve(LaunchVerdict::Exited);
        }

        info!(profile = %name, pid = ?child.id(), "Launched instance");
        self.track(profile.clone(), child);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(LaunchVerdict::Ready)) => {
                output.add_output(&format!("Instance {} started", name));
                InstanceOutcome::Started
            }
            Ok(Ok(LaunchVerdict::ProfileLocked)) => {
                self.discard(&profile).await;
                output.add_output(&format!("Instance {} failed to lock its profile", name));
                InstanceOutcome::Failed("Profile is locked by another process".into())
            }
            Ok(Ok(LaunchVerdict::Exited)) | Ok(Err(_)) => {
                self.discard(&profile).await;
                output.add_output(&format!("Instance {} exited during startup", name));
                InstanceOutcome::Failed("Instance exited before startup completed".into())
            }
            // no verdict either way: stop it so nothing runs unaccounted for
            Err(_) => {
                warn!(profile = %name, "No startup verdict before the deadline, stopping instance again");
                self.discard(&profile).await;
                output.add_output(&format!(
                    "Startup of instance {} timed out; it was stopped again",
                    name
                ));
                InstanceOutcome::TimedOut
            }
        }
    }

    async fn stop_one(
        &self,
        profile: PathBuf,
        timeout: Duration,
        output: &dyn TextOutputReceiver,
    ) -> InstanceOutcome {
        let name = profile_name(&profile);
        if !self.is_running(&profile) {
            output.add_output(&format!("Instance with id: {} is currently not running.", name));
            return InstanceOutcome::NotRunning;
        }
        if let Err(outcome) = self.take_management_lock(&profile).await {
            return outcome;
        }

        let outcome = match self.untrack(&profile) {
            Some(child) => terminate(child, timeout).await,
            None => stop_by_request(&profile, timeout).await,
        };
        if outcome == InstanceOutcome::Stopped {
            output.add_output(&format!("Instance {} stopped", name));
        }
        outcome
    }
}

/// Stop an instance launched elsewhere through its shutdown request file
async fn stop_by_request(profile: &Path, timeout: Duration) -> InstanceOutcome {
    if let Err(e) = request_shutdown(profile) {
        return InstanceOutcome::Failed(format!("Failed to request shutdown: {}", e));
    }
    debug!(profile = %profile.display(), "Requested shutdown");

    if wait_for_profile_unlock(profile, timeout).await {
        if let Err(e) = clear_shutdown_data(profile) {
            debug!(profile = %profile.display(), error = %e, "Failed to remove shutdown files");
        }
        return InstanceOutcome::Stopped;
    }

    match read_shutdown_pid(profile) {
        Ok(Some(pid)) => {
            warn!(profile = %profile.display(), pid, "Instance ignored the shutdown request, killing it");
            if let Err(e) = kill_pid(pid).await {
                warn!(pid, error = %e, "Failed to kill instance");
            }
            wait_for_profile_unlock(profile, KILL_GRACE).await;
            InstanceOutcome::Failed(format!(
                "Instance did not stop within {}ms and was killed",
                timeout.as_millis()
            ))
        }
        _ => InstanceOutcome::Failed(format!(
            "Instance did not stop within {}ms",
            timeout.as_millis()
        )),
    }
}

/// Poll the profile lock until it is free; false if it stayed taken for `timeout`
async fn wait_for_profile_unlock(profile: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match is_profile_locked(profile) {
            Ok(false) => return true,
            Ok(true) => {}
            Err(e) => {
                debug!(profile = %profile.display(), error = %e, "Checking the profile lock failed");
                return false;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
async fn kill_pid(pid: u32) -> std::io::Result<()> {
    Command::new("kill")
        .arg("-KILL")
        .arg(pid.to_string())
        .status()
        .await
        .map(|_| ())
}

#[cfg(not(unix))]
async fn kill_pid(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl InstanceOperations for ProcessInstanceOperations {
    #[instrument(skip(self, output), fields(count = profiles.len()))]
    async fn start_instances(
        &self,
        profiles: Vec<PathBuf>,
        installation: PathBuf,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        let executable = installation.join(&self.config.executable_name);
        if !executable.is_file() {
            return Err(InstanceOperationError::ExecutableMissing(executable));
        }

        let (executable, installation) = (&executable, &installation);
        let launches = profiles.into_iter().map(|profile| {
            let output = output.clone();
            async move {
                let name = profile_name(&profile);
                let outcome = self
                    .start_one(profile, executable, installation, timeout, output.as_ref())
                    .await;
                (name, outcome)
            }
        });

        let mut report = OperationReport::new();
        for (name, outcome) in join_all(launches).await {
            report.record(name, outcome);
        }
        Ok(report)
    }

    #[instrument(skip(self, output), fields(count = profiles.len()))]
    async fn shutdown_instances(
        &self,
        profiles: Vec<PathBuf>,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        let stops = profiles.into_iter().map(|profile| {
            let output = output.clone();
            async move {
                let name = profile_name(&profile);
                let outcome = self.stop_one(profile, timeout, output.as_ref()).await;
                (name, outcome)
            }
        });

        let mut report = OperationReport::new();
        for (name, outcome) in join_all(stops).await {
            report.record(name, outcome);
        }
        Ok(report)
    }
}
