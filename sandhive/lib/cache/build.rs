use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{config::DEFAULT_BUILD_INFO_TTL, SandhiveError, SandhiveResult};

use super::{add_delta, to_delta, Clock, SystemClock};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The status of a template build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Queued.
    Waiting,

    /// In progress.
    Building,

    /// Ended with an error.
    Failed,

    /// Ended successfully.
    Success,
}

/// What is known about one template build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    /// The build id.
    pub build_id: String,

    /// The template being built.
    pub template_id: String,

    /// The team owning the template.
    pub team_id: String,

    /// The current status.
    pub status: BuildStatus,

    /// Log lines in arrival order.
    pub logs: Vec<String>,

    /// When the build reached a terminal status.
    #[serde(skip)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Build status and logs pushed by the external build service.
///
/// Entries are kept for [`DEFAULT_BUILD_INFO_TTL`] after their build finished.
pub struct BuildCache {
    builds: RwLock<HashMap<String, BuildInfo>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BuildStatus {
    /// Whether the build has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Failed | BuildStatus::Success)
    }
}

impl BuildCache {
    /// Creates a cache on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), DEFAULT_BUILD_INFO_TTL)
    }

    /// Creates a cache on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            builds: RwLock::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    /// Registers a build as waiting. An already known build is left alone.
    pub async fn create(&self, build_id: &str, template_id: &str, team_id: &str) {
        self.builds
            .write()
            .await
            .entry(build_id.to_string())
            .or_insert_with(|| BuildInfo {
                build_id: build_id.to_string(),
                template_id: template_id.to_string(),
                team_id: team_id.to_string(),
                status: BuildStatus::Waiting,
                logs: Vec::new(),
                finished_at: None,
            });
    }

    /// Appends log lines to a build, registering it as building if unknown.
    pub async fn append_logs(
        &self,
        build_id: &str,
        template_id: &str,
        team_id: &str,
        logs: impl IntoIterator<Item = String>,
    ) {
        let mut builds = self.builds.write().await;
        let info = builds
            .entry(build_id.to_string())
            .or_insert_with(|| BuildInfo {
                build_id: build_id.to_string(),
                template_id: template_id.to_string(),
                team_id: team_id.to_string(),
                status: BuildStatus::Building,
                logs: Vec::new(),
                finished_at: None,
            });
        if info.status == BuildStatus::Waiting {
            info.status = BuildStatus::Building;
        }
        info.logs.extend(logs);
    }

    /// Sets the status of a known build.
    pub async fn set_status(&self, build_id: &str, status: BuildStatus) -> SandhiveResult<()> {
        let now = self.clock.now();
        let mut builds = self.builds.write().await;
        let info = builds
            .get_mut(build_id)
            .ok_or_else(|| SandhiveError::BuildNotFound(build_id.to_string()))?;

        info.status = status;
        info.finished_at = status.is_terminal().then_some(now);
        tracing::info!(build_id, status = ?status, "build status updated");
        Ok(())
    }

    /// Returns a build that has not expired.
    pub async fn get(&self, build_id: &str) -> SandhiveResult<BuildInfo> {
        let now = self.clock.now();
        self.builds
            .read()
            .await
            .get(build_id)
            .filter(|info| !self.is_expired(info, now))
            .cloned()
            .ok_or_else(|| SandhiveError::BuildNotFound(build_id.to_string()))
    }

    /// Drops every expired build. Returns how many were dropped.
    pub async fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut builds = self.builds.write().await;
        let before = builds.len();
        builds.retain(|_, info| !self.is_expired(info, now));
        before - builds.len()
    }

    /// Drops expired builds every `interval` until `cancel` fires.
    pub async fn run_expiry_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = self.evict_expired().await;
                    if dropped > 0 {
                        tracing::debug!(dropped, "dropped expired builds");
                    }
                }
            }
        }
    }

    fn is_expired(&self, info: &BuildInfo, now: DateTime<Utc>) -> bool {
        info.finished_at
            .is_some_and(|finished| add_delta(finished, to_delta(self.ttl)) <= now)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for BuildCache {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
