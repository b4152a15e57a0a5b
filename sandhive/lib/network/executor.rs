use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;

use crate::{slot::Slot, SandhiveError, SandhiveResult};

use super::{NetStep, NetworkPlan};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How an executor reacts to a failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Stop at the first failure. Used when building.
    StopOnError,

    /// Record the failure and carry on. Used when tearing down.
    ContinueOnError,
}

/// A step that failed and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// The failing step.
    pub step: NetStep,

    /// The error it reported.
    pub reason: String,
}

/// The outcome of running a list of steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Steps that succeeded, in execution order.
    pub completed: Vec<NetStep>,

    /// Steps that failed, in execution order.
    pub failures: Vec<StepFailure>,
}

/// Applies network steps to the node.
#[async_trait]
pub trait NetworkExecutor: Send + Sync {
    /// Runs `steps` in order.
    async fn execute(&self, steps: Vec<NetStep>, mode: ExecutionMode) -> ExecutionReport;
}

/// Builds and removes sandbox networks.
#[derive(Clone)]
pub struct NetworkBuilder {
    executor: Arc<dyn NetworkExecutor>,
    gateway_iface: String,
    hosts_file: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecutionReport {
    /// Whether every step succeeded.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl NetworkBuilder {
    /// Creates a builder that forwards sandbox traffic through `gateway_iface`.
    pub fn new(
        executor: Arc<dyn NetworkExecutor>,
        gateway_iface: impl Into<String>,
        hosts_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            gateway_iface: gateway_iface.into(),
            hosts_file: hosts_file.into(),
        }
    }

    /// The host interface sandbox traffic leaves through.
    pub fn gateway_iface(&self) -> &str {
        &self.gateway_iface
    }

    /// The hosts file sandbox names are published to.
    pub fn hosts_file(&self) -> &Path {
        &self.hosts_file
    }

    /// The plan for a slot.
    pub fn plan(&self, slot: &Slot) -> NetworkPlan {
        NetworkPlan::for_slot(slot, &self.gateway_iface, &self.hosts_file)
    }

    /// Builds the network of `slot`.
    ///
    /// On failure every completed step is reverted before the error is returned.
    pub async fn create(&self, slot: &Slot) -> SandhiveResult<()> {
        let plan = self.plan(slot);
        let report = self
            .executor
            .execute(plan.steps().to_vec(), ExecutionMode::StopOnError)
            .await;

        let Some(failure) = report.failures.into_iter().next() else {
            tracing::info!(
                sandbox_id = %slot.get_sandbox_id(),
                slot_idx = slot.get_idx(),
                "network ready"
            );
            return Ok(());
        };

        tracing::warn!(
            sandbox_id = %slot.get_sandbox_id(),
            slot_idx = slot.get_idx(),
            "network step `{}` failed, reverting {} completed steps: {}",
            failure.step,
            report.completed.len(),
            failure.reason
        );

        let undo = NetworkPlan::undo_of(&report.completed);
        self.run_teardown(slot, undo).await;

        Err(SandhiveError::NamespaceSetupFailed {
            step: failure.step.to_string(),
            reason: failure.reason,
        })
    }

    /// Tears down the network of `slot`.
    ///
    /// Every step runs even if earlier ones fail, so removing a half-built or already removed
    /// network succeeds.
    pub async fn remove(&self, slot: &Slot) -> SandhiveResult<()> {
        let teardown = self.plan(slot).teardown();
        self.run_teardown(slot, teardown).await;
        Ok(())
    }

    async fn run_teardown(&self, slot: &Slot, steps: Vec<NetStep>) {
        let report = self
            .executor
            .execute(steps, ExecutionMode::ContinueOnError)
            .await;

        for failure in report.failures {
            tracing::warn!(
                sandbox_id = %slot.get_sandbox_id(),
                slot_idx = slot.get_idx(),
                "teardown step `{}` failed: {}",
                failure.step,
                failure.reason
            );
        }
    }
}
