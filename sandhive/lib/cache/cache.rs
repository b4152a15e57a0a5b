use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::DEFAULT_SANDBOX_TTL, driver::TaskDriver, SandhiveError, SandhiveResult,
};

use super::{add_delta, to_delta, to_duration, Clock, Sandbox, SystemClock};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Why a sandbox left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Its TTL elapsed.
    Expired,

    /// It outlived its maximum lifetime.
    LifetimeExceeded,

    /// It was killed explicitly, or its TTL was set to zero.
    Killed,

    /// Reconciliation found no running VMM for it.
    Reconciled,
}

/// The outcome of a TTL change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUpdate {
    /// The entry now expires after the given duration.
    Extended(Duration),

    /// The entry already expired later than asked; nothing changed.
    Unchanged(Duration),

    /// The entry was evicted.
    Evicted,
}

/// Reacts to sandboxes leaving the cache.
#[async_trait]
pub trait EvictionHandler: Send + Sync {
    /// Called once per evicted sandbox. Must not fail; errors are the handler's to log.
    async fn on_evict(&self, sandbox: &Sandbox, reason: EvictionReason);
}

/// Destroys the task of every evicted sandbox.
pub struct DriverEvictor {
    driver: Arc<TaskDriver>,
}

/// The set of sandboxes believed to be running, with their TTLs.
///
/// A sandbox is in the cache iff a VMM is believed to run for it. Every way out of the cache
/// goes through the [`EvictionHandler`].
pub struct SandboxCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    evictor: Arc<dyn EvictionHandler>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    sandbox: Sandbox,
    start_time: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DriverEvictor {
    /// Creates a handler destroying tasks of `driver`.
    pub fn new(driver: Arc<TaskDriver>) -> Self {
        Self { driver }
    }
}

impl SandboxCache {
    /// Creates a cache on the system clock with the default TTL.
    pub fn new(evictor: Arc<dyn EvictionHandler>) -> Self {
        Self::with_clock(evictor, Arc::new(SystemClock), DEFAULT_SANDBOX_TTL)
    }

    /// Creates a cache on a custom clock.
    pub fn with_clock(
        evictor: Arc<dyn EvictionHandler>,
        clock: Arc<dyn Clock>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            default_ttl,
            evictor,
        }
    }

    /// Adds a sandbox with the default TTL. Returns whether it was inserted.
    ///
    /// Adding an id that is already cached leaves the cached entry alone and returns `false`. An
    /// unset start time becomes now.
    pub async fn add(&self, sandbox: Sandbox) -> SandhiveResult<bool> {
        sandbox.validate()?;
        let mut entries = self.entries.write().await;
        Ok(self.insert(&mut entries, sandbox))
    }

    /// Adds a sandbox unless its team already has `limit` live sandboxes. Returns whether it was
    /// inserted, like [`SandboxCache::add`].
    ///
    /// The count and the insert happen under one lock, so concurrent adds never overshoot.
    pub async fn add_with_limit(&self, sandbox: Sandbox, limit: usize) -> SandhiveResult<bool> {
        sandbox.validate()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        if entries.contains_key(sandbox.get_sandbox_id()) {
            return Ok(self.insert(&mut entries, sandbox));
        }

        let team_id = sandbox.get_team_id();
        let count = entries
            .values()
            .filter(|e| e.is_live(now) && e.sandbox.get_team_id() == team_id)
            .count();
        if count >= limit {
            return Err(SandhiveError::ConcurrencyCap {
                team_id: team_id.clone(),
                limit,
            });
        }

        Ok(self.insert(&mut entries, sandbox))
    }

    /// Extends the TTL of a sandbox to `min(duration, remaining lifetime)`.
    ///
    /// A TTL that already runs longer is kept. A zero `duration` evicts the sandbox. A sandbox
    /// past its maximum lifetime is evicted and [`SandhiveError::LifetimeExceeded`] returned.
    pub async fn keep_alive_for(&self, id: &str, duration: Duration) -> SandhiveResult<TtlUpdate> {
        self.update_ttl(id, duration, false).await
    }

    /// Replaces the TTL of a sandbox, clamped to its remaining lifetime. Zero evicts it.
    pub async fn set_timeout(&self, id: &str, duration: Duration) -> SandhiveResult<TtlUpdate> {
        self.update_ttl(id, duration, true).await
    }

    /// Removes a sandbox and waits for its eviction handler.
    pub async fn kill(&self, id: &str) -> SandhiveResult<Sandbox> {
        let entry = self
            .entries
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SandhiveError::SandboxNotFound(id.to_string()))?;

        let sandbox = entry.sandbox;
        self.dispatch(vec![sandbox.clone()], EvictionReason::Killed)
            .await;
        Ok(sandbox)
    }

    /// Removes a sandbox that reconciliation found dead. Unknown ids are ignored.
    pub async fn evict(&self, id: &str, reason: EvictionReason) -> Option<Sandbox> {
        let entry = self.entries.write().await.remove(id)?;
        self.dispatch(vec![entry.sandbox.clone()], reason).await;
        Some(entry.sandbox)
    }

    /// Returns a live sandbox.
    pub async fn get(&self, id: &str) -> Option<Sandbox> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .get(id)
            .filter(|e| e.is_live(now))
            .map(|e| e.sandbox.clone())
    }

    /// Returns the time left before a sandbox expires.
    pub async fn ttl(&self, id: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| to_duration(e.expires_at - now))
    }

    /// Returns every live sandbox, or only those of `team_id`.
    pub async fn get_instances(&self, team_id: Option<&str>) -> Vec<Sandbox> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .filter(|e| team_id.map_or(true, |team| e.sandbox.get_team_id() == team))
            .map(|e| e.sandbox.clone())
            .collect()
    }

    /// Returns the ids of every cached sandbox.
    pub async fn ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Number of cached sandboxes.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Number of live sandboxes of a team. Expired entries awaiting the sweep are not counted.
    pub async fn count_for_team(&self, team_id: &str) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now) && e.sandbox.get_team_id() == team_id)
            .count()
    }

    /// Evicts every sandbox whose TTL has elapsed and waits for the handlers.
    ///
    /// Returns the evicted ids.
    pub async fn evict_expired(&self) -> Vec<String> {
        let expired = self.take_expired().await;
        let ids = expired
            .iter()
            .map(|s| s.get_sandbox_id().clone())
            .collect();
        self.dispatch(expired, EvictionReason::Expired).await;
        ids
    }

    /// Sweeps expired entries every `interval` until `cancel` fires.
    ///
    /// Handlers run on their own tasks, so a slow teardown never delays the next sweep.
    pub async fn run_expiry_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.take_expired().await;
                    if !expired.is_empty() {
                        drop(self.spawn_handlers(expired, EvictionReason::Expired));
                    }
                }
            }
        }

        tracing::debug!("sandbox expiry loop stopped");
    }

    fn insert(&self, entries: &mut HashMap<String, CacheEntry>, mut sandbox: Sandbox) -> bool {
        if entries.contains_key(sandbox.get_sandbox_id()) {
            tracing::debug!(
                sandbox_id = %sandbox.get_sandbox_id(),
                "sandbox already cached, keeping the cached entry"
            );
            return false;
        }

        let now = self.clock.now();
        let start_time = sandbox.get_start_time().unwrap_or(now);
        sandbox.set_start_time(start_time);

        let lifetime_end = add_delta(start_time, to_delta(*sandbox.get_max_lifetime()));
        let expires_at = add_delta(now, to_delta(self.default_ttl)).min(lifetime_end);

        tracing::info!(
            sandbox_id = %sandbox.get_sandbox_id(),
            team_id = %sandbox.get_team_id(),
            "sandbox cached"
        );
        entries.insert(
            sandbox.get_sandbox_id().clone(),
            CacheEntry {
                sandbox,
                start_time,
                expires_at,
            },
        );
        true
    }

    async fn update_ttl(
        &self,
        id: &str,
        duration: Duration,
        replace: bool,
    ) -> SandhiveResult<TtlUpdate> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| SandhiveError::SandboxNotFound(id.to_string()))?;

        let max_lifetime = to_delta(*entry.sandbox.get_max_lifetime());
        let lifetime_end = add_delta(entry.start_time, max_lifetime);
        let remaining = lifetime_end - now;
        if remaining <= chrono::TimeDelta::zero() {
            let evicted = entries.remove(id).map(|e| e.sandbox);
            drop(entries);
            self.dispatch(
                evicted.into_iter().collect(),
                EvictionReason::LifetimeExceeded,
            )
            .await;
            return Err(SandhiveError::LifetimeExceeded(id.to_string()));
        }

        if duration.is_zero() {
            let evicted = entries.remove(id).map(|e| e.sandbox);
            drop(entries);
            self.dispatch(evicted.into_iter().collect(), EvictionReason::Killed)
                .await;
            return Ok(TtlUpdate::Evicted);
        }

        let ttl = to_delta(duration).min(remaining);
        let expires_at = add_delta(now, ttl);
        if !replace && entry.expires_at >= expires_at {
            return Ok(TtlUpdate::Unchanged(to_duration(entry.expires_at - now)));
        }

        entry.expires_at = expires_at;
        Ok(TtlUpdate::Extended(to_duration(ttl)))
    }

    async fn take_expired(&self) -> Vec<Sandbox> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| !e.is_live(now))
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| entries.remove(id))
            .map(|e| e.sandbox)
            .collect()
    }

    fn spawn_handlers(
        &self,
        sandboxes: Vec<Sandbox>,
        reason: EvictionReason,
    ) -> Vec<JoinHandle<()>> {
        sandboxes
            .into_iter()
            .map(|sandbox| {
                let evictor = self.evictor.clone();
                tokio::spawn(async move {
                    tracing::info!(
                        sandbox_id = %sandbox.get_sandbox_id(),
                        team_id = %sandbox.get_team_id(),
                        "evicting sandbox: {reason}"
                    );
                    evictor.on_evict(&sandbox, reason).await;
                })
            })
            .collect()
    }

    async fn dispatch(&self, sandboxes: Vec<Sandbox>, reason: EvictionReason) {
        for handle in self.spawn_handlers(sandboxes, reason) {
            if let Err(e) = handle.await {
                tracing::error!("eviction handler panicked: {e}");
            }
        }
    }
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl EvictionHandler for DriverEvictor {
    async fn on_evict(&self, sandbox: &Sandbox, _reason: EvictionReason) {
        match self.driver.destroy_task(sandbox.get_sandbox_id(), true).await {
            Ok(()) => {}
            Err(SandhiveError::TaskNotFound(_)) => {
                tracing::debug!(sandbox_id = %sandbox.get_sandbox_id(), "no task to destroy");
            }
            Err(e) => {
                tracing::warn!(
                    sandbox_id = %sandbox.get_sandbox_id(),
                    "failed to destroy task of evicted sandbox: {e}"
                );
            }
        }
    }
}

impl Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            EvictionReason::Expired => "ttl expired",
            EvictionReason::LifetimeExceeded => "maximum lifetime reached",
            EvictionReason::Killed => "killed",
            EvictionReason::Reconciled => "no running vmm",
        };
        write!(f, "{}", reason)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;
    use crate::cache::ManualClock;

    #[derive(Default)]
    struct Recorder {
        evicted: Mutex<Vec<(String, EvictionReason)>>,
    }

    #[async_trait]
    impl EvictionHandler for Recorder {
        async fn on_evict(&self, sandbox: &Sandbox, reason: EvictionReason) {
            self.evicted
                .lock()
                .unwrap()
                .push((sandbox.get_sandbox_id().clone(), reason));
        }
    }

    fn setup() -> (SandboxCache, Arc<ManualClock>, Arc<Recorder>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let recorder = Arc::new(Recorder::default());
        let cache = SandboxCache::with_clock(recorder.clone(), clock.clone(), DEFAULT_SANDBOX_TTL);
        (cache, clock, recorder)
    }

    fn sandbox(id: &str, team: &str) -> Sandbox {
        Sandbox::builder()
            .sandbox_id(id)
            .template_id("tpl")
            .team_id(team)
            .client_id("node0000")
            .build()
    }

    #[tokio::test]
    async fn test_add_rejects_incomplete_sandboxes() {
        let (cache, _, _) = setup();
        let incomplete = Sandbox::builder()
            .sandbox_id("sbx")
            .template_id("")
            .team_id("T")
            .client_id("node0000")
            .build();

        assert!(matches!(
            cache.add(incomplete).await,
            Err(SandhiveError::InvalidSandbox(_))
        ));
        assert_eq!(cache.count().await, 0);
    }

    #[tokio::test]
    async fn test_add_kill_add_keeps_second_start_time() -> anyhow::Result<()> {
        let (cache, clock, recorder) = setup();
        assert!(cache.add(sandbox("sbx", "T")).await?);
        assert!(!cache.add(sandbox("sbx", "T")).await?);
        assert!(!cache.add_with_limit(sandbox("sbx", "T"), 1).await?);
        assert_eq!(cache.count().await, 1);

        cache.kill("sbx").await?;
        assert_eq!(
            recorder.evicted.lock().unwrap().as_slice(),
            [("sbx".to_string(), EvictionReason::Killed)]
        );

        clock.advance(Duration::from_secs(3));
        cache.add(sandbox("sbx", "T")).await?;
        let cached = cache.get("sbx").await.expect("cached");
        assert_eq!(cached.get_start_time(), &Some(clock.now()));
        assert_eq!(cache.count().await, 1);

        assert!(matches!(
            cache.kill("missing").await,
            Err(SandhiveError::SandboxNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_limit_admits_exactly_n() -> anyhow::Result<()> {
        let (cache, _, _) = setup();
        cache.add_with_limit(sandbox("a", "T"), 2).await?;
        cache.add_with_limit(sandbox("b", "T"), 2).await?;
        cache.add_with_limit(sandbox("x", "U"), 2).await?;

        match cache.add_with_limit(sandbox("c", "T"), 2).await {
            Err(SandhiveError::ConcurrencyCap { limit, .. }) => assert_eq!(limit, 2),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(cache.count_for_team("T").await, 2);
        assert_eq!(cache.get_instances(Some("U")).await.len(), 1);
        assert_eq!(cache.get_instances(None).await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_entries_do_not_hold_team_slots() -> anyhow::Result<()> {
        let (cache, clock, recorder) = setup();
        cache.add_with_limit(sandbox("a", "T"), 2).await?;
        cache.add_with_limit(sandbox("b", "T"), 2).await?;

        clock.advance(DEFAULT_SANDBOX_TTL);
        assert_eq!(cache.count_for_team("T").await, 0);
        assert!(cache.get_instances(Some("T")).await.is_empty());
        assert!(cache.add_with_limit(sandbox("c", "T"), 2).await?);
        assert_eq!(cache.count_for_team("T").await, 1);

        assert_eq!(cache.evict_expired().await.len(), 2);
        assert_eq!(recorder.evicted.lock().unwrap().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_huge_durations_saturate() -> anyhow::Result<()> {
        let (cache, clock, _) = setup();
        let forever = Sandbox::builder()
            .sandbox_id("sbx")
            .template_id("tpl")
            .team_id("T")
            .client_id("node0000")
            .max_lifetime(Duration::from_secs(u64::MAX / 4))
            .build();
        cache.add(forever).await?;

        assert!(matches!(
            cache.keep_alive_for("sbx", Duration::MAX).await?,
            TtlUpdate::Extended(_)
        ));
        assert!(matches!(
            cache.set_timeout("sbx", Duration::MAX).await?,
            TtlUpdate::Extended(_)
        ));

        clock.advance(Duration::MAX);
        assert!(cache.get("sbx").await.is_none());
        assert_eq!(cache.evict_expired().await, vec!["sbx".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_adds_respect_limit() -> anyhow::Result<()> {
        let (cache, _, _) = setup();
        let cache = Arc::new(cache);

        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.add_with_limit(sandbox(&format!("s{i}"), "T"), 3).await })
            })
            .collect();

        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await?.is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(cache.count_for_team("T").await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_keep_alive_clamps_to_lifetime() -> anyhow::Result<()> {
        let (cache, clock, recorder) = setup();
        cache.add(sandbox("sbx", "T")).await?;

        assert_eq!(
            cache.set_timeout("sbx", Duration::from_secs(48 * 3600)).await?,
            TtlUpdate::Extended(Duration::from_secs(24 * 3600))
        );

        clock.advance(Duration::from_secs(24 * 3600 - 5));
        assert_eq!(
            cache.keep_alive_for("sbx", Duration::from_secs(60)).await?,
            TtlUpdate::Extended(Duration::from_secs(5))
        );
        assert_eq!(cache.ttl("sbx").await, Some(Duration::from_secs(5)));

        clock.advance(Duration::from_secs(5));
        assert!(matches!(
            cache.keep_alive_for("sbx", Duration::from_secs(60)).await,
            Err(SandhiveError::LifetimeExceeded(_))
        ));
        assert!(cache.get("sbx").await.is_none());
        assert!(matches!(
            cache.keep_alive_for("sbx", Duration::from_secs(60)).await,
            Err(SandhiveError::SandboxNotFound(_))
        ));
        assert_eq!(
            recorder.evicted.lock().unwrap()[0].1,
            EvictionReason::LifetimeExceeded
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_keep_alive_never_shortens() -> anyhow::Result<()> {
        let (cache, _, _) = setup();
        cache.add(sandbox("sbx", "T")).await?;
        cache.set_timeout("sbx", Duration::from_secs(300)).await?;

        assert_eq!(
            cache.keep_alive_for("sbx", Duration::from_secs(30)).await?,
            TtlUpdate::Unchanged(Duration::from_secs(300))
        );
        assert_eq!(
            cache.set_timeout("sbx", Duration::from_secs(30)).await?,
            TtlUpdate::Extended(Duration::from_secs(30))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_duration_evicts() -> anyhow::Result<()> {
        let (cache, _, recorder) = setup();
        cache.add(sandbox("a", "T")).await?;
        cache.add(sandbox("b", "T")).await?;

        assert_eq!(
            cache.keep_alive_for("a", Duration::ZERO).await?,
            TtlUpdate::Evicted
        );
        assert_eq!(cache.set_timeout("b", Duration::ZERO).await?, TtlUpdate::Evicted);
        assert_eq!(cache.count().await, 0);
        assert_eq!(recorder.evicted.lock().unwrap().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_evict_expired() -> anyhow::Result<()> {
        let (cache, clock, recorder) = setup();
        cache.add(sandbox("short", "T")).await?;
        cache.add(sandbox("long", "T")).await?;
        cache.set_timeout("long", Duration::from_secs(60)).await?;

        clock.advance(DEFAULT_SANDBOX_TTL);
        assert_eq!(cache.evict_expired().await, vec!["short".to_string()]);
        assert!(cache.get("long").await.is_some());
        assert_eq!(
            recorder.evicted.lock().unwrap()[0],
            ("short".to_string(), EvictionReason::Expired)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_expiry_loop_stops_on_cancel() -> anyhow::Result<()> {
        let (cache, clock, recorder) = setup();
        let cache = Arc::new(cache);
        cache.add(sandbox("sbx", "T")).await?;
        clock.advance(DEFAULT_SANDBOX_TTL);

        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(
            cache
                .clone()
                .run_expiry_loop(Duration::from_millis(10), cancel.clone()),
        );

        for _ in 0..100 {
            if !recorder.evicted.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.count().await, 0);
        assert_eq!(recorder.evicted.lock().unwrap().len(), 1);

        cancel.cancel();
        sweeper.await?;
        Ok(())
    }
}
