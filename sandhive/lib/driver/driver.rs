use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use tokio::sync::{watch, RwLock};

use crate::{
    config::DEFAULT_VMM_STOP_TIMEOUT,
    instance::{Instance, InstanceAssembler, InstanceRequest},
    slot::Slot,
    utils,
    vmm::{self, Vmm, VmmExit},
    SandhiveError, SandhiveResult,
};

use super::{TaskConfig, TaskRecord, TaskState, TaskStatus, TaskStore};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs sandboxes as tasks on this node.
pub struct TaskDriver {
    assembler: Arc<InstanceAssembler>,
    store: TaskStore,
    tasks: RwLock<HashMap<String, Arc<TaskHandle>>>,
}

struct TaskHandle {
    config: TaskConfig,
    instance: Instance,
    started_at: DateTime<Utc>,
    exited_at: Arc<OnceLock<DateTime<Utc>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TaskDriver {
    /// Creates a driver that assembles sandboxes with `assembler` and records them in `store`.
    pub fn new(assembler: Arc<InstanceAssembler>, store: TaskStore) -> Self {
        Self {
            assembler,
            store,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// The assembler tasks are built with.
    pub fn assembler(&self) -> &Arc<InstanceAssembler> {
        &self.assembler
    }

    /// Starts a sandbox.
    ///
    /// Returns once the VMM runs with its snapshot restored. A background task watches the VMM
    /// and marks the task exited when it ends.
    pub async fn start_task(&self, config: TaskConfig) -> SandhiveResult<TaskStatus> {
        let sandbox_id = config.sandbox_id.clone();
        utils::validate_sandbox_id(&sandbox_id)?;
        if self.tasks.read().await.contains_key(&sandbox_id) {
            return Err(SandhiveError::custom(anyhow::anyhow!(
                "task {sandbox_id} already exists"
            )));
        }

        let request = InstanceRequest {
            sandbox_id: sandbox_id.clone(),
            template_id: config.template_id.clone(),
            team_id: config.team_id.clone(),
            trace_id: config.trace_id.clone(),
        };
        let instance = self.assembler.assemble(&request).await?;
        let started_at = Utc::now();

        let record = TaskRecord {
            config: config.clone(),
            pid: instance.get_vmm().pid(),
            slot_idx: *instance.get_slot().get_idx(),
            started_at,
        };
        if let Err(e) = self.store.insert(&record).await {
            tracing::error!(sandbox_id = %sandbox_id, "failed to persist task record: {e}");
            self.teardown(&instance).await;
            return Err(e);
        }

        let handle = Arc::new(TaskHandle {
            config,
            instance,
            started_at,
            exited_at: Arc::new(OnceLock::new()),
        });
        self.watch_exit(&handle);

        let status = handle.status();
        self.tasks.write().await.insert(sandbox_id, handle);
        Ok(status)
    }

    /// Returns a channel that turns `Some` when the task's VMM exits.
    pub async fn wait_task(&self, id: &str) -> SandhiveResult<watch::Receiver<Option<VmmExit>>> {
        Ok(self.handle(id).await?.instance.get_vmm().subscribe())
    }

    /// Sends `signal` to the task's VMM, killing it if it is still running after `timeout`.
    ///
    /// The task stays known to the driver until it is destroyed.
    pub async fn stop_task(
        &self,
        id: &str,
        timeout: Duration,
        signal: Signal,
    ) -> SandhiveResult<VmmExit> {
        let handle = self.handle(id).await?;
        handle.instance.get_vmm().stop(timeout, signal).await
    }

    /// Destroys a task, releasing its slot, network and files.
    ///
    /// A running task is only destroyed with `force`, which stops its VMM first. Teardown steps
    /// log and continue, so a destroyed task is always forgotten.
    pub async fn destroy_task(&self, id: &str, force: bool) -> SandhiveResult<()> {
        let handle = {
            let mut tasks = self.tasks.write().await;
            let handle = tasks
                .get(id)
                .ok_or_else(|| SandhiveError::TaskNotFound(id.to_string()))?;
            if handle.is_running() && !force {
                return Err(SandhiveError::TaskRunning(id.to_string()));
            }
            tasks.remove(id).ok_or_else(|| SandhiveError::TaskNotFound(id.to_string()))?
        };

        self.teardown(&handle.instance).await;
        if let Err(e) = self.store.delete(id).await {
            tracing::warn!(sandbox_id = id, "failed to delete task record: {e}");
        }

        tracing::info!(sandbox_id = id, "task destroyed");
        Ok(())
    }

    /// Returns the current status of a task.
    pub async fn inspect_task(&self, id: &str) -> SandhiveResult<TaskStatus> {
        Ok(self.handle(id).await?.status())
    }

    /// Re-attaching to a task after a driver restart is not supported.
    ///
    /// A VMM cannot outlive its driver without leaking its namespace and slot, so recorded tasks
    /// are reclaimed by [`TaskDriver::reclaim_orphans`] instead.
    pub async fn recover_task(&self, id: &str) -> SandhiveResult<()> {
        Err(SandhiveError::RecoveryUnsupported(id.to_string()))
    }

    /// Returns the status of every task whose VMM is running.
    pub async fn running_tasks(&self) -> Vec<TaskStatus> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|handle| handle.is_running())
            .map(|handle| handle.status())
            .collect()
    }

    /// Returns the status of every known task.
    pub async fn list_tasks(&self) -> Vec<TaskStatus> {
        self.tasks
            .read()
            .await
            .values()
            .map(|handle| handle.status())
            .collect()
    }

    /// Tears down every recorded task this driver does not own.
    ///
    /// Meant to run once at startup: any recorded task is left over from a previous process. Its
    /// VMM process group is killed if the recorded pid still runs that VMM, then its files, network and slot are released and the record
    /// is deleted. Returns the ids of the reclaimed tasks.
    pub async fn reclaim_orphans(&self) -> SandhiveResult<Vec<String>> {
        let records = self.store.list().await?;
        let owned: Vec<String> = self.tasks.read().await.keys().cloned().collect();

        let mut reclaimed = Vec::new();
        for record in records {
            let sandbox_id = record.config.sandbox_id.clone();
            if owned.contains(&sandbox_id) {
                continue;
            }

            tracing::warn!(
                sandbox_id = %sandbox_id,
                slot_idx = record.slot_idx,
                pid = record.pid,
                "reclaiming orphaned task"
            );

            if vmm::is_vmm_process(record.pid, &sandbox_id) {
                if let Err(e) = hiveutils::signal_process_group(record.pid, Signal::SIGKILL) {
                    tracing::warn!(sandbox_id = %sandbox_id, "failed to kill orphaned vmm: {e}");
                }
            } else if hiveutils::process_exists(record.pid) {
                // The pid was reused after a reboot or wrap-around.
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    pid = record.pid,
                    "recorded pid is no longer a vmm, leaving it alone"
                );
            }

            match Slot::new(
                self.assembler.allocator().node_short_id(),
                record.slot_idx,
                &sandbox_id,
            ) {
                Ok(slot) => {
                    self.assembler
                        .reclaim(&slot, &record.config.template_id)
                        .await
                }
                Err(e) => tracing::warn!(sandbox_id = %sandbox_id, "invalid recorded slot: {e}"),
            }

            if let Err(e) = self.store.delete(&sandbox_id).await {
                tracing::warn!(sandbox_id = %sandbox_id, "failed to delete task record: {e}");
            }
            reclaimed.push(sandbox_id);
        }

        Ok(reclaimed)
    }

    /// Force-destroys every task. Used on shutdown.
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.destroy_task(&id, true).await {
                tracing::warn!(sandbox_id = %id, "failed to destroy task on shutdown: {e}");
            }
        }
    }

    async fn handle(&self, id: &str) -> SandhiveResult<Arc<TaskHandle>> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SandhiveError::TaskNotFound(id.to_string()))
    }

    /// Stops the VMM of an instance and releases what it holds.
    async fn teardown(&self, instance: &Instance) {
        if let Err(e) = instance
            .get_vmm()
            .stop(DEFAULT_VMM_STOP_TIMEOUT, Signal::SIGTERM)
            .await
        {
            tracing::warn!(sandbox_id = instance.sandbox_id(), "failed to stop vmm: {e}");
        }
        self.assembler.cleanup(instance).await;
    }

    fn watch_exit(&self, handle: &Arc<TaskHandle>) {
        let vmm = handle.instance.get_vmm().clone();
        let exited_at = handle.exited_at.clone();
        let sandbox_id = handle.config.sandbox_id.clone();
        tokio::spawn(async move {
            let exit = vmm.wait().await;
            let _ = exited_at.set(Utc::now());
            tracing::info!(sandbox_id = %sandbox_id, "task exited with {exit}");
        });
    }
}

impl TaskHandle {
    fn is_running(&self) -> bool {
        self.instance.get_vmm().exit().is_none()
    }

    fn status(&self) -> TaskStatus {
        let mut status = TaskStatus {
            id: self.config.sandbox_id.clone(),
            template_id: self.config.template_id.clone(),
            team_id: self.config.team_id.clone(),
            state: TaskState::Running,
            pid: self.instance.get_vmm().pid(),
            slot_idx: *self.instance.get_slot().get_idx(),
            started_at: self.started_at,
            exited_at: None,
            exit_code: None,
            exit_signal: None,
        };
        status.set_exit(
            self.instance.get_vmm().exit(),
            self.exited_at.get().copied(),
        );
        status
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
