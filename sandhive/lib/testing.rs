//! Fakes shared by the unit tests.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::sync::watch;

use crate::{
    files::CopyCloner,
    instance::InstanceAssembler,
    network::{NetworkBuilder, SimulatedNetwork},
    slot::{MemoryKv, SlotAllocator},
    utils::{BUILD_ID_FILENAME, MEMFILE_FILENAME, ROOTFS_FILENAME, SNAPFILE_FILENAME},
    vmm::{Vmm, VmmExit, VmmLauncher, VmmSpec},
    SandhiveError, SandhiveResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Above the kernel's `pid_max`, so signalling a fake pid never reaches a real process.
const FAKE_PID_BASE: u32 = 5_000_000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A VMM that exists only as an exit channel.
pub struct FakeVmm {
    pid: u32,
    exit: watch::Sender<Option<VmmExit>>,
}

/// Launches [`FakeVmm`]s and remembers them by sandbox id.
#[derive(Default)]
pub struct FakeLauncher {
    next_pid: AtomicU32,
    fail: AtomicBool,
    launched: Mutex<HashMap<String, Arc<FakeVmm>>>,
}

/// An assembler wired to in-memory fakes, plus handles to inspect them.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub kv: Arc<MemoryKv>,
    pub net: Arc<SimulatedNetwork>,
    pub launcher: Arc<FakeLauncher>,
    pub assembler: Arc<InstanceAssembler>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeVmm {
    /// Ends the VMM as if it was killed out of band.
    pub fn crash(&self) {
        self.exit.send_replace(Some(VmmExit::with_signal(9)));
    }
}

impl FakeLauncher {
    /// Makes every following launch fail like a snapshot load would.
    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// The VMM launched for a sandbox.
    pub fn vmm(&self, sandbox_id: &str) -> Option<Arc<FakeVmm>> {
        self.launched.lock().unwrap().get(sandbox_id).cloned()
    }
}

impl Harness {
    /// Builds a harness with one template `tpl` on disk.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_template(&dir.path().join("envs"), "tpl").await;

        let kv = Arc::new(MemoryKv::new());
        let net = Arc::new(SimulatedNetwork::new());
        let launcher = Arc::new(FakeLauncher::default());
        let assembler = InstanceAssembler::builder()
            .allocator(SlotAllocator::new(kv.clone(), "node0000"))
            .network(NetworkBuilder::new(
                net.clone(),
                "ens4",
                dir.path().join("hosts"),
            ))
            .cloner(Arc::new(CopyCloner))
            .launcher(launcher.clone())
            .envs_root(dir.path().join("envs"))
            .runtime_dir(dir.path().join("run"))
            .build();

        Self {
            dir,
            kv,
            net,
            launcher,
            assembler: Arc::new(assembler),
        }
    }

    /// The hosts file the simulated network writes to.
    pub fn hosts(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("hosts")).unwrap_or_default()
    }

    /// Whether the sandbox still has an instance directory.
    pub fn has_instance_dir(&self, template_id: &str, sandbox_id: &str) -> bool {
        self.dir
            .path()
            .join("envs")
            .join(template_id)
            .join(crate::utils::ENV_INSTANCES_SUBDIR)
            .join(sandbox_id)
            .exists()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes a complete template directory.
pub async fn write_template(envs: &Path, template_id: &str) {
    let env = envs.join(template_id);
    tokio::fs::create_dir_all(&env).await.unwrap();
    tokio::fs::write(env.join(BUILD_ID_FILENAME), "build-1")
        .await
        .unwrap();
    for name in [ROOTFS_FILENAME, SNAPFILE_FILENAME, MEMFILE_FILENAME] {
        tokio::fs::write(env.join(name), name).await.unwrap();
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Vmm for FakeVmm {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn subscribe(&self) -> watch::Receiver<Option<VmmExit>> {
        self.exit.subscribe()
    }

    async fn stop(&self, _timeout: Duration, signal: Signal) -> SandhiveResult<VmmExit> {
        if let Some(exit) = self.exit() {
            return Ok(exit);
        }
        let exit = VmmExit::with_signal(signal as i32);
        self.exit.send_replace(Some(exit));
        Ok(exit)
    }
}

#[async_trait]
impl VmmLauncher for FakeLauncher {
    async fn launch(&self, spec: VmmSpec) -> SandhiveResult<Arc<dyn Vmm>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SandhiveError::SnapshotLoadFailed(
                "injected failure".to_string(),
            ));
        }

        let (exit, _) = watch::channel(None);
        let vmm = Arc::new(FakeVmm {
            pid: FAKE_PID_BASE + self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit,
        });
        self.launched
            .lock()
            .unwrap()
            .insert(spec.files.get_sandbox_id().clone(), vmm.clone());
        Ok(vmm)
    }
}
