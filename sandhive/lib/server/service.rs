//! The operations behind the HTTP handlers.
//!
//! Handlers only extract and render; everything that touches the catalog, the cache or the driver
//! lives here.

use std::{collections::HashMap, time::Duration};

use tokio::sync::oneshot;

use crate::{
    cache::{Sandbox, TtlUpdate},
    config::{Team, MIN_KEEP_ALIVE},
    driver::TaskConfig,
    utils, SandhiveError, SandhiveResult,
};

use super::{
    data::{BuildLogsRequest, BuildStatusResponse, CreatedSandbox, RunningSandbox},
    state::ServerState,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates a sandbox for `team` from a template id or alias.
///
/// The work runs on its own task. If the caller goes away before it finishes, the new sandbox is
/// killed instead of being left to its TTL.
pub async fn create_sandbox(
    state: &ServerState,
    team: &Team,
    template_id: &str,
    metadata: HashMap<String, String>,
) -> SandhiveResult<CreatedSandbox> {
    let (tx, rx) = oneshot::channel();
    let task_state = state.clone();
    let team = team.clone();
    let template_id = template_id.to_string();

    tokio::spawn(async move {
        let result = start_sandbox(&task_state, &team, &template_id, metadata).await;
        if let Err(Ok(created)) = tx.send(result) {
            tracing::warn!(
                sandbox_id = %created.sandbox_id,
                "create request went away, killing sandbox"
            );
            if let Err(e) = task_state.get_cache().kill(&created.sandbox_id).await {
                tracing::warn!(sandbox_id = %created.sandbox_id, "failed to kill sandbox: {e}");
            }
        }
    });

    rx.await
        .map_err(|e| SandhiveError::custom(anyhow::anyhow!("create task ended early: {e}")))?
}

/// Lists the sandboxes of a team.
pub async fn list_sandboxes(state: &ServerState, team: &Team) -> Vec<RunningSandbox> {
    let mut sandboxes: Vec<RunningSandbox> = state
        .get_cache()
        .get_instances(Some(team.get_id()))
        .await
        .iter()
        .map(RunningSandbox::from)
        .collect();
    sandboxes.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    sandboxes
}

/// Returns a sandbox owned by `team`.
pub async fn get_sandbox(
    state: &ServerState,
    team: &Team,
    sandbox_id: &str,
) -> SandhiveResult<RunningSandbox> {
    let sandbox = owned_sandbox(state, team, sandbox_id).await?;
    Ok(RunningSandbox::from(&sandbox))
}

/// Kills a sandbox owned by `team`.
pub async fn kill_sandbox(state: &ServerState, team: &Team, sandbox_id: &str) -> SandhiveResult<()> {
    owned_sandbox(state, team, sandbox_id).await?;
    state.get_cache().kill(sandbox_id).await?;
    tracing::info!(sandbox_id, team_id = %team.get_id(), "sandbox killed");
    Ok(())
}

/// Extends the TTL of a sandbox. Missing durations and ones below the minimum become the minimum.
pub async fn refresh_sandbox(
    state: &ServerState,
    team: &Team,
    sandbox_id: &str,
    duration: Option<u64>,
) -> SandhiveResult<TtlUpdate> {
    owned_sandbox(state, team, sandbox_id).await?;
    let duration = duration
        .map(Duration::from_secs)
        .unwrap_or(MIN_KEEP_ALIVE)
        .max(MIN_KEEP_ALIVE);
    state.get_cache().keep_alive_for(sandbox_id, duration).await
}

/// Replaces the TTL of a sandbox. Zero or less kills it.
pub async fn set_sandbox_timeout(
    state: &ServerState,
    team: &Team,
    sandbox_id: &str,
    timeout: i64,
) -> SandhiveResult<TtlUpdate> {
    owned_sandbox(state, team, sandbox_id).await?;
    let timeout = Duration::from_secs(u64::try_from(timeout).unwrap_or(0));
    state.get_cache().set_timeout(sandbox_id, timeout).await
}

/// Appends logs to a build and updates its status, authorised by the build channel secret.
pub async fn push_build_logs(
    state: &ServerState,
    template_id: &str,
    build_id: &str,
    request: BuildLogsRequest,
) -> SandhiveResult<()> {
    match state.get_build_api_secret() {
        Some(secret) if *secret == request.api_secret => {}
        _ => {
            return Err(SandhiveError::Unauthorized(
                "invalid build api secret".to_string(),
            ))
        }
    }

    let team_id = state
        .get_catalog()
        .template(template_id)
        .map(|t| t.get_team_id().clone())
        .ok_or_else(|| SandhiveError::InvalidTemplate(template_id.to_string()))?;

    let builds = state.get_builds();
    builds
        .append_logs(build_id, template_id, &team_id, request.logs)
        .await;
    if let Some(status) = request.status {
        builds.set_status(build_id, status).await?;
    }

    Ok(())
}

/// Returns the status of a build of a template visible to `team`.
pub async fn build_status(
    state: &ServerState,
    team: &Team,
    template_id: &str,
    build_id: &str,
    logs_offset: usize,
) -> SandhiveResult<BuildStatusResponse> {
    state.get_catalog().resolve_template(team, template_id)?;
    let info = state.get_builds().get(build_id).await?;
    if info.template_id != template_id {
        return Err(SandhiveError::BuildNotFound(build_id.to_string()));
    }

    Ok(BuildStatusResponse::from_info(info, logs_offset))
}

async fn start_sandbox(
    state: &ServerState,
    team: &Team,
    requested: &str,
    metadata: HashMap<String, String>,
) -> SandhiveResult<CreatedSandbox> {
    let catalog = state.get_catalog();
    let tier = catalog.tier_for(team)?;
    let template = catalog.resolve_template(team, requested)?;
    let limit = *tier.get_concurrent_instances();

    let cache = state.get_cache();
    if cache.count_for_team(team.get_id()).await >= limit {
        return Err(SandhiveError::ConcurrencyCap {
            team_id: team.get_id().clone(),
            limit,
        });
    }

    let alias = if requested != template.get_id() {
        Some(requested.to_string())
    } else {
        template.first_alias().map(str::to_string)
    };

    let sandbox_id = utils::generate_sandbox_id();
    let status = state
        .get_driver()
        .start_task(TaskConfig {
            sandbox_id: sandbox_id.clone(),
            template_id: template.get_id().clone(),
            team_id: team.get_id().clone(),
            trace_id: utils::generate_trace_id(),
            metadata: metadata.clone(),
        })
        .await?;

    let sandbox = Sandbox::builder()
        .sandbox_id(sandbox_id.clone())
        .template_id(template.get_id().clone())
        .alias(alias.clone())
        .team_id(team.get_id().clone())
        .client_id(state.get_client_id().clone())
        .metadata(metadata)
        .max_lifetime(tier.max_lifetime())
        .pid(status.pid)
        .build();

    // Another request of the team may have been admitted since the count above.
    if let Err(e) = cache.add_with_limit(sandbox, limit).await {
        if let Err(destroy) = state.get_driver().destroy_task(&sandbox_id, true).await {
            tracing::warn!(sandbox_id = %sandbox_id, "failed to destroy rejected sandbox: {destroy}");
        }
        return Err(e);
    }

    tracing::info!(
        sandbox_id = %sandbox_id,
        template_id = %template.get_id(),
        team_id = %team.get_id(),
        slot_idx = status.slot_idx,
        "sandbox created"
    );

    Ok(CreatedSandbox {
        sandbox_id,
        client_id: state.get_client_id().clone(),
        template_id: template.get_id().clone(),
        alias,
    })
}

async fn owned_sandbox(state: &ServerState, team: &Team, sandbox_id: &str) -> SandhiveResult<Sandbox> {
    let sandbox = state
        .get_cache()
        .get(sandbox_id)
        .await
        .ok_or_else(|| SandhiveError::SandboxNotFound(sandbox_id.to_string()))?;

    if sandbox.get_team_id() != team.get_id() {
        return Err(SandhiveError::ForeignSandbox(sandbox_id.to_string()));
    }

    Ok(sandbox)
}
