use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use hiveutils::ProcessMonitor;
use nix::sys::signal::Signal;
use tokio::{
    process::{Child, Command},
    sync::watch,
    time::Instant,
};

use crate::{
    config::{DEFAULT_SOCKET_WAIT_TIMEOUT, DEFAULT_VMM_STOP_TIMEOUT},
    files::InstanceFiles,
    slot::Slot,
    utils, SandhiveError, SandhiveResult,
};

use super::{
    wait_for_exit, FirecrackerClient, MemBackend, MemBackendType, SnapshotLoad, Vmm, VmmExit,
    VmmLauncher, VmmLogMonitor, VmmSpec,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for the exit of a process group that was sent `SIGKILL`.
const KILL_GRACE: Duration = Duration::from_secs(5);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Launches Firecracker VMMs restored from template snapshots.
#[derive(Debug, Clone)]
pub struct FirecrackerLauncher {
    firecracker_exe: PathBuf,
    socket_wait_timeout: Duration,
}

/// A supervised process tree running one VMM.
///
/// The tree is `unshare` (group leader) → `sh` → `ip netns exec` → `firecracker`. `unshare`
/// runs with `--kill-child`, so signalling the group or killing the leader takes everything down.
#[derive(Debug)]
pub struct FirecrackerVmm {
    pid: u32,
    sandbox_id: String,
    socket_path: PathBuf,
    exit: watch::Receiver<Option<VmmExit>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirecrackerLauncher {
    /// Creates a launcher for the given firecracker binary.
    pub fn new(firecracker_exe: impl Into<PathBuf>) -> Self {
        Self {
            firecracker_exe: firecracker_exe.into(),
            socket_wait_timeout: DEFAULT_SOCKET_WAIT_TIMEOUT,
        }
    }

    /// The shell script run inside the new PID and mount namespaces.
    pub fn launch_script(&self, slot: &Slot, files: &InstanceFiles) -> String {
        format!(
            "mount --bind {} {} && exec ip netns exec {} {} --api-sock {}",
            shell_quote(files.get_env_instance_path()),
            shell_quote(files.get_build_dir_path()),
            shell_quote(Path::new(&slot.namespace_name())),
            shell_quote(&self.firecracker_exe),
            shell_quote(files.get_socket_path()),
        )
    }

    async fn restore(&self, vmm: &FirecrackerVmm, spec: VmmSpec) -> SandhiveResult<()> {
        vmm.wait_for_socket(self.socket_wait_timeout).await?;

        let client = FirecrackerClient::new(&vmm.socket_path);
        client
            .load_snapshot(&SnapshotLoad {
                snapshot_path: spec.files.snapfile_path(),
                mem_backend: MemBackend {
                    backend_type: MemBackendType::File,
                    backend_path: spec.files.memfile_path(),
                },
                enable_diff_snapshots: true,
                resume_vm: true,
            })
            .await
            .map_err(|e| SandhiveError::SnapshotLoadFailed(e.to_string()))?;

        tracing::info!(sandbox_id = %vmm.sandbox_id, pid = vmm.pid, "snapshot restored");

        // The guest agent polls MMDS, so a late or failed push only delays it.
        let sandbox_id = vmm.sandbox_id.clone();
        let metadata = spec.metadata;
        tokio::spawn(async move {
            match client.put_mmds(&metadata).await {
                Ok(()) => tracing::debug!(sandbox_id = %sandbox_id, "mmds populated"),
                Err(e) => tracing::warn!(sandbox_id = %sandbox_id, "failed to push mmds: {e}"),
            }
        });

        Ok(())
    }
}

impl FirecrackerVmm {
    /// Spawns `command` as the leader of a new process group and supervises it.
    ///
    /// Output is re-emitted through [`VmmLogMonitor`]; the exit is published once the process
    /// has been reaped.
    pub async fn spawn(
        mut command: Command,
        sandbox_id: &str,
        socket_path: impl Into<PathBuf>,
    ) -> SandhiveResult<Self> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| SandhiveError::VmmSpawnFailed(e.to_string()))?;

        let Some(pid) = child.id() else {
            return Err(SandhiveError::VmmSpawnFailed(
                "process exited before reporting a pid".to_string(),
            ));
        };

        let mut monitor = VmmLogMonitor::new(sandbox_id);
        if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
            if let Err(e) = monitor.start(pid, stdout, stderr).await {
                kill_unsupervised(child, pid, sandbox_id).await;
                return Err(e.into());
            }
        }

        let (tx, exit) = watch::channel(None);
        let id = sandbox_id.to_string();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => VmmExit::from(status),
                Err(e) => {
                    tracing::error!(sandbox_id = %id, pid, "failed to reap vmm: {e}");
                    VmmExit::default()
                }
            };

            if let Err(e) = monitor.stop().await {
                tracing::debug!(sandbox_id = %id, "vmm monitor stop: {e}");
            }

            tracing::info!(sandbox_id = %id, pid, "vmm exited with {status}");
            tx.send_replace(Some(status));
        });

        tracing::info!(sandbox_id, pid, "vmm spawned");
        Ok(Self {
            pid,
            sandbox_id: sandbox_id.to_string(),
            socket_path: socket_path.into(),
            exit,
        })
    }

    /// The Firecracker API socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn wait_for_socket(&self, timeout: Duration) -> SandhiveResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let exited = *self.exit.borrow();
            if let Some(exit) = exited {
                return Err(SandhiveError::VmmSpawnFailed(format!(
                    "vmm exited with {exit} before its api socket appeared"
                )));
            }

            if tokio::fs::try_exists(&self.socket_path).await? {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(SandhiveError::VmmSpawnFailed(format!(
                    "api socket {} did not appear within {timeout:?}",
                    self.socket_path.display()
                )));
            }

            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    async fn terminate(&self, timeout: Duration, signal: Signal) -> SandhiveResult<VmmExit> {
        if let Some(exit) = self.exit() {
            return Ok(exit);
        }

        let mut exit = self.exit.clone();
        hiveutils::signal_process_group(self.pid, signal)?;
        if let Ok(status) = tokio::time::timeout(timeout, wait_for_exit(&mut exit)).await {
            return Ok(status);
        }

        tracing::warn!(
            sandbox_id = %self.sandbox_id,
            pid = self.pid,
            "vmm did not exit within {timeout:?} of {signal}, killing its process group"
        );
        hiveutils::signal_process_group(self.pid, Signal::SIGKILL)?;
        tokio::time::timeout(KILL_GRACE, wait_for_exit(&mut exit))
            .await
            .map_err(|_| {
                SandhiveError::custom(anyhow::anyhow!(
                    "vmm process group {} survived SIGKILL",
                    self.pid
                ))
            })
    }

    async fn remove_socket(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    sandbox_id = %self.sandbox_id,
                    "failed to remove {}: {e}",
                    self.socket_path.display()
                );
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether `pid` leads the process tree of the VMM launched for `sandbox_id`.
///
/// The leader's command line carries the launch script, which names the sandbox's API socket.
pub fn is_vmm_process(pid: u32, sandbox_id: &str) -> bool {
    hiveutils::process_cmdline(pid).is_some_and(|cmdline| {
        cmdline.contains("--api-sock") && cmdline.contains(&utils::socket_filename(sandbox_id))
    })
}

/// Kills and reaps the process group of a child that could not be put under supervision.
async fn kill_unsupervised(mut child: Child, pid: u32, sandbox_id: &str) {
    if let Err(e) = hiveutils::signal_process_group(pid, Signal::SIGKILL) {
        tracing::warn!(sandbox_id, pid, "failed to kill unsupervised vmm: {e}");
        return;
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(sandbox_id, pid, "failed to reap unsupervised vmm: {e}");
    }
}

/// Quotes `path` for `sh` with single quotes.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl VmmLauncher for FirecrackerLauncher {
    async fn launch(&self, spec: VmmSpec) -> SandhiveResult<Arc<dyn Vmm>> {
        let script = self.launch_script(&spec.slot, &spec.files);
        let mut command = Command::new("unshare");
        command.args(["-pfm", "--kill-child", "--", "sh", "-c", script.as_str()]);

        let vmm = FirecrackerVmm::spawn(
            command,
            spec.files.get_sandbox_id(),
            spec.files.get_socket_path(),
        )
        .await?;

        if let Err(e) = self.restore(&vmm, spec).await {
            if let Err(stop_err) = vmm.stop(DEFAULT_VMM_STOP_TIMEOUT, Signal::SIGTERM).await {
                tracing::warn!(
                    sandbox_id = %vmm.sandbox_id,
                    "failed to stop vmm after a failed start: {stop_err}"
                );
            }
            return Err(e);
        }

        Ok(Arc::new(vmm))
    }
}

#[async_trait]
impl Vmm for FirecrackerVmm {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn subscribe(&self) -> watch::Receiver<Option<VmmExit>> {
        self.exit.clone()
    }

    async fn stop(&self, timeout: Duration, signal: Signal) -> SandhiveResult<VmmExit> {
        let result = self.terminate(timeout, signal).await;
        self.remove_socket().await;
        result
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(Path::new("/a b/c")), "'/a b/c'");
        assert_eq!(shell_quote(Path::new("/it's")), r"'/it'\''s'");
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vmm = FirecrackerVmm::spawn(sh("exit 7"), "sbx", dir.path().join("fc.sock")).await?;
        assert_eq!(vmm.wait().await, VmmExit::with_code(7));
        assert_eq!(vmm.exit(), Some(VmmExit::with_code(7)));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_stop_kills_group_and_removes_socket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("fc.sock");
        std::fs::write(&socket, b"")?;

        // Ignores SIGTERM, so only the SIGKILL escalation ends it.
        let vmm = FirecrackerVmm::spawn(sh("trap '' TERM; exec sleep 30"), "sbx", &socket).await?;
        let exit = vmm
            .stop(Duration::from_millis(200), Signal::SIGTERM)
            .await?;

        assert!(exit.signal.is_some());
        assert!(!hiveutils::process_exists(vmm.pid()));
        assert!(!socket.exists());

        // Stopping again is a no-op returning the same exit.
        assert_eq!(vmm.stop(Duration::from_secs(1), Signal::SIGTERM).await?, exit);
        Ok(())
    }

    #[tokio::test]
    async fn test_socket_wait_fails_when_process_exits() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vmm = FirecrackerVmm::spawn(sh("exit 1"), "sbx", dir.path().join("fc.sock")).await?;
        vmm.wait().await;

        let err = vmm
            .wait_for_socket(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandhiveError::VmmSpawnFailed(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_kill_unsupervised_takes_down_the_group() -> anyhow::Result<()> {
        let child = sh("sleep 30 & wait").process_group(0).spawn()?;
        let pid = child.id().expect("child has a pid");

        kill_unsupervised(child, pid, "sbx").await;
        assert!(!hiveutils::process_exists(pid));
        Ok(())
    }

    #[tokio::test]
    async fn test_is_vmm_process_matches_the_api_socket() -> anyhow::Result<()> {
        let mut child = sh("sleep 30; : --api-sock /run/sandhive/fc-sbx-1.sock").spawn()?;
        let pid = child.id().expect("child has a pid");

        assert!(is_vmm_process(pid, "sbx-1"));
        assert!(!is_vmm_process(pid, "sbx-10"));
        assert!(!is_vmm_process(std::process::id(), "sbx-1"));

        child.kill().await?;
        child.wait().await?;
        assert!(!is_vmm_process(pid, "sbx-1"));
        Ok(())
    }
}
