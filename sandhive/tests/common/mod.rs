//! An in-process node: in-memory KV, simulated network, fake VMMs and the real control plane.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use nix::sys::signal::Signal;
use sandhive::{
    cache::{
        AnalyticsSink, BuildCache, DriverEvictor, ManualClock, Reconciler,
        RunningSandboxesEvent, SandboxCache,
    },
    config::{Catalog, DEFAULT_SANDBOX_TTL, SLOT_COUNT},
    driver::{TaskDriver, TaskStore},
    files::CopyCloner,
    instance::InstanceAssembler,
    network::{NetworkBuilder, SimulatedNetwork},
    server::{create_router, ServerState, API_KEY_HEADER},
    slot::{MemoryKv, SlotAllocator},
    utils::{BUILD_ID_FILENAME, ENV_INSTANCES_SUBDIR, MEMFILE_FILENAME, ROOTFS_FILENAME, SNAPFILE_FILENAME},
    vmm::{Vmm, VmmExit, VmmLauncher, VmmSpec},
    SandhiveResult,
};
use serde_json::Value;
use tokio::sync::watch;
use tower::ServiceExt;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

pub const NODE: &str = "node0000";

pub const BUILD_SECRET: &str = "build-secret";

const FAKE_PID_BASE: u32 = 5_000_000;

const CATALOG: &str = r#"
    [[tiers]]
    id = "base"
    concurrent_instances = 2
    max_length_hours = 24

    [[teams]]
    id = "T"
    api_key = "key-t"
    tier = "base"

    [[teams]]
    id = "A"
    api_key = "key-a"
    tier = "base"

    [[teams]]
    id = "B"
    api_key = "key-b"
    tier = "base"

    [[templates]]
    id = "tpl_abc"
    team_id = "T"
    public = true
    aliases = ["python"]

    [[templates]]
    id = "tpl_private"
    team_id = "T"
"#;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

pub struct FakeVmm {
    pid: u32,
    exit: watch::Sender<Option<VmmExit>>,
}

#[derive(Default)]
pub struct FakeLauncher {
    next_pid: AtomicU32,
    launched: Mutex<HashMap<String, Arc<FakeVmm>>>,
}

#[derive(Default)]
pub struct RecordingAnalytics {
    pub events: Mutex<Vec<RunningSandboxesEvent>>,
}

pub struct Node {
    pub dir: tempfile::TempDir,
    pub kv: Arc<MemoryKv>,
    pub net: Arc<SimulatedNetwork>,
    pub launcher: Arc<FakeLauncher>,
    pub clock: Arc<ManualClock>,
    pub driver: Arc<TaskDriver>,
    pub cache: Arc<SandboxCache>,
    pub builds: Arc<BuildCache>,
    pub analytics: Arc<RecordingAnalytics>,
    pub reconciler: Reconciler,
    pub router: Router,
}

pub struct Response {
    pub status: StatusCode,
    pub body: Value,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeVmm {
    pub fn crash(&self) {
        self.exit.send_replace(Some(VmmExit::with_signal(Signal::SIGKILL as i32)));
    }
}

impl FakeLauncher {
    pub fn vmm(&self, sandbox_id: &str) -> Option<Arc<FakeVmm>> {
        self.launched.lock().unwrap().get(sandbox_id).cloned()
    }
}

impl Node {
    pub async fn new() -> Self {
        Self::with_slot_count(SLOT_COUNT).await
    }

    /// A node whose allocator only hands out indices below `slot_count`.
    pub async fn with_slot_count(slot_count: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let envs = dir.path().join("envs");
        write_template(&envs, "tpl_abc").await;
        write_template(&envs, "tpl_private").await;
        std::fs::write(dir.path().join("hosts"), "127.0.0.1 localhost\n").unwrap();

        let kv = Arc::new(MemoryKv::new());
        let net = Arc::new(SimulatedNetwork::new());
        let launcher = Arc::new(FakeLauncher::default());
        let assembler = InstanceAssembler::builder()
            .allocator(SlotAllocator::with_slot_count(kv.clone(), NODE, slot_count))
            .network(NetworkBuilder::new(
                net.clone(),
                "ens4",
                dir.path().join("hosts"),
            ))
            .cloner(Arc::new(CopyCloner))
            .launcher(launcher.clone())
            .envs_root(envs)
            .runtime_dir(dir.path().join("run"))
            .build();

        let store = TaskStore::open(dir.path().join("state/tasks.db"))
            .await
            .unwrap();
        let driver = Arc::new(TaskDriver::new(Arc::new(assembler), store));

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(SandboxCache::with_clock(
            Arc::new(DriverEvictor::new(driver.clone())),
            clock.clone(),
            DEFAULT_SANDBOX_TTL,
        ));
        let builds = Arc::new(BuildCache::with_clock(
            clock.clone(),
            Duration::from_secs(300),
        ));
        let analytics = Arc::new(RecordingAnalytics::default());
        let reconciler = Reconciler::new(cache.clone(), driver.clone(), analytics.clone());

        let state = ServerState::builder()
            .catalog(Arc::new(Catalog::from_toml_str(CATALOG).unwrap()))
            .cache(cache.clone())
            .builds(builds.clone())
            .driver(driver.clone())
            .client_id(NODE)
            .build_api_secret(Some(BUILD_SECRET.to_string()))
            .build();

        Self {
            dir,
            kv,
            net,
            launcher,
            clock,
            driver,
            cache,
            builds,
            analytics,
            reconciler,
            router: create_router(state),
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        api_key: Option<&str>,
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        Response { status, body }
    }

    /// Creates a sandbox from `tpl_abc`.
    pub async fn create(&self, api_key: &str) -> Response {
        self.request(
            Method::POST,
            "/sandboxes",
            Some(api_key),
            Some(serde_json::json!({ "env_id": "tpl_abc" })),
        )
        .await
    }

    pub fn hosts(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("hosts")).unwrap_or_default()
    }

    pub fn has_instance_dir(&self, sandbox_id: &str) -> bool {
        self.dir
            .path()
            .join("envs/tpl_abc")
            .join(ENV_INSTANCES_SUBDIR)
            .join(sandbox_id)
            .exists()
    }
}

impl Response {
    pub fn str(&self, field: &str) -> String {
        self.body[field].as_str().unwrap_or_default().to_string()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

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
        let (exit, _) = watch::channel(None);
        let vmm = Arc::new(FakeVmm {
            pid: FAKE_PID_BASE + self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit,
        });
        self.launched
            .lock()
            .unwrap()
            .insert(spec.files.get_sandbox_id().clone(), vmm.clone());
        Ok(vmm as Arc<dyn Vmm>)
    }
}

#[async_trait]
impl AnalyticsSink for RecordingAnalytics {
    async fn publish(&self, event: &RunningSandboxesEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
