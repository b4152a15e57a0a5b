use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DEFAULT_ADOPTION_GRACE, DEFAULT_MAX_LIFETIME, DEFAULT_RECONCILE_INTERVAL},
    driver::{TaskDriver, TaskStatus},
};

use super::{add_delta, to_delta, EvictionReason, Sandbox, SandboxCache};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Receives the set of running sandboxes after every reconciliation.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Publishes the running set of a node.
    async fn publish(&self, event: &RunningSandboxesEvent);
}

/// Emits running-set events as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAnalytics;

/// The running set of a node at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningSandboxesEvent {
    /// The node the sandboxes run on.
    pub client_id: String,

    /// Ids of every running sandbox.
    pub sandbox_ids: Vec<String>,
}

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Cached sandboxes without a running task.
    pub evicted: Vec<String>,

    /// Running tasks missing from the cache.
    pub adopted: Vec<String>,
}

/// Resyncs the sandbox cache with the tasks the driver runs.
///
/// The cache owns TTL policy and the driver owns liveness. Reconciliation evicts cached sandboxes
/// whose VMM is gone and re-adds running ones the cache has lost. Tasks younger than the adoption
/// grace are left to the request that started them.
pub struct Reconciler {
    cache: Arc<SandboxCache>,
    driver: Arc<TaskDriver>,
    analytics: Arc<dyn AnalyticsSink>,
    client_id: String,
    interval: Duration,
    adoption_grace: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reconciler {
    /// Creates a reconciler running every [`DEFAULT_RECONCILE_INTERVAL`].
    pub fn new(
        cache: Arc<SandboxCache>,
        driver: Arc<TaskDriver>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        let client_id = driver.assembler().allocator().node_short_id().to_string();
        Self {
            cache,
            driver,
            analytics,
            client_id,
            interval: DEFAULT_RECONCILE_INTERVAL,
            adoption_grace: DEFAULT_ADOPTION_GRACE,
        }
    }

    /// Overrides the reconciliation interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Overrides how old a running task must be before it is adopted.
    pub fn with_adoption_grace(mut self, grace: Duration) -> Self {
        self.adoption_grace = grace;
        self
    }

    /// Runs one reconciliation pass.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        // The cache is read first. Tasks are started before they are cached, so anything cached
        // after this read is already in the running set below.
        let cached = self.cache.ids().await;
        let running = self.driver.running_tasks().await;
        self.reconcile(cached, running).await
    }

    /// Reconciles against the given snapshots. `cached` must be taken before `running`.
    async fn reconcile(&self, cached: Vec<String>, running: Vec<TaskStatus>) -> ReconcileReport {
        let running_ids: HashSet<&str> = running.iter().map(|t| t.id.as_str()).collect();

        let mut report = ReconcileReport::default();
        for id in &cached {
            if running_ids.contains(id.as_str()) {
                continue;
            }
            if self.cache.evict(id, EvictionReason::Reconciled).await.is_some() {
                tracing::warn!(sandbox_id = %id, "evicted sandbox without a running vmm");
                report.evicted.push(id.clone());
            }
        }

        let cached: HashSet<String> = cached.into_iter().collect();
        let adopt_before = add_delta(Utc::now(), -to_delta(self.adoption_grace));
        for task in running.iter().filter(|t| !cached.contains(&t.id)) {
            if task.started_at > adopt_before {
                tracing::debug!(sandbox_id = %task.id, "not adopting recently started sandbox");
                continue;
            }

            match self.cache.add(self.adopt(task)).await {
                Ok(true) => {
                    tracing::info!(sandbox_id = %task.id, "adopted running sandbox into cache");
                    report.adopted.push(task.id.clone());
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(sandbox_id = %task.id, "failed to adopt sandbox: {e}"),
            }
        }

        let mut sandbox_ids: Vec<String> = running.into_iter().map(|t| t.id).collect();
        sandbox_ids.sort();
        self.analytics
            .publish(&RunningSandboxesEvent {
                client_id: self.client_id.clone(),
                sandbox_ids,
            })
            .await;

        report
    }

    /// Reconciles every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.reconcile_once().await;
                    tracing::debug!(
                        evicted = report.evicted.len(),
                        adopted = report.adopted.len(),
                        "reconciled sandbox cache"
                    );
                }
            }
        }

        tracing::debug!("reconciliation loop stopped");
    }

    fn adopt(&self, task: &TaskStatus) -> Sandbox {
        Sandbox::builder()
            .sandbox_id(task.id.clone())
            .template_id(task.template_id.clone())
            .team_id(task.team_id.clone())
            .client_id(self.client_id.clone())
            .start_time(task.started_at)
            .max_lifetime(DEFAULT_MAX_LIFETIME)
            .pid(task.pid)
            .build()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl AnalyticsSink for TracingAnalytics {
    async fn publish(&self, event: &RunningSandboxesEvent) {
        tracing::info!(
            client_id = %event.client_id,
            running = event.sandbox_ids.len(),
            sandbox_ids = ?event.sandbox_ids,
            "running sandboxes"
        );
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
