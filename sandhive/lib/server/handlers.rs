//! HTTP request handlers for the REST API.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};

use super::{
    data::{
        BuildLogsRequest, BuildStatusQuery, BuildStatusResponse, CreatedSandbox, ErrorResponse,
        ErrorType, HealthResponse, NewSandboxRequest, RefreshRequest, RunningSandbox,
        TimeoutRequest,
    },
    service,
    state::{AuthenticatedTeam, ServerState},
};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

type ApiResult<T> = Result<T, ErrorResponse>;

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for the GET /health endpoint
pub async fn health_handler(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        sandboxes: state.get_cache().count().await,
    })
}

/// Handler for the POST /sandboxes endpoint
pub async fn create_sandbox_handler(
    State(state): State<ServerState>,
    Extension(AuthenticatedTeam(team)): Extension<AuthenticatedTeam>,
    Json(req): Json<NewSandboxRequest>,
) -> ApiResult<(StatusCode, Json<CreatedSandbox>)> {
    tracing::debug!(team_id = %team.get_id(), template_id = %req.template_id, "create sandbox");
    let created = service::create_sandbox(&state, &team, &req.template_id, req.metadata).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Handler for the GET /sandboxes endpoint
pub async fn list_sandboxes_handler(
    State(state): State<ServerState>,
    Extension(AuthenticatedTeam(team)): Extension<AuthenticatedTeam>,
) -> Json<Vec<RunningSandbox>> {
    Json(service::list_sandboxes(&state, &team).await)
}

/// Handler for the GET /sandboxes/{id} endpoint
pub async fn get_sandbox_handler(
    State(state): State<ServerState>,
    Extension(AuthenticatedTeam(team)): Extension<AuthenticatedTeam>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<RunningSandbox>> {
    Ok(Json(
        service::get_sandbox(&state, &team, &sandbox_id).await?,
    ))
}

/// Handler for the DELETE /sandboxes/{id} endpoint
pub async fn kill_sandbox_handler(
    State(state): State<ServerState>,
    Extension(AuthenticatedTeam(team)): Extension<AuthenticatedTeam>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<StatusCode> {
    service::kill_sandbox(&state, &team, &sandbox_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for the POST /sandboxes/{id}/refreshes endpoint
///
/// The body is optional.
pub async fn refresh_sandbox_handler(
    State(state): State<ServerState>,
    Extension(AuthenticatedTeam(team)): Extension<AuthenticatedTeam>,
    Path(sandbox_id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        RefreshRequest::default()
    } else {
        serde_json::from_slice::<RefreshRequest>(&body).map_err(invalid_body)?
    };

    service::refresh_sandbox(&state, &team, &sandbox_id, req.duration).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for the POST /sandboxes/{id}/timeout endpoint
pub async fn set_timeout_handler(
    State(state): State<ServerState>,
    Extension(AuthenticatedTeam(team)): Extension<AuthenticatedTeam>,
    Path(sandbox_id): Path<String>,
    Json(req): Json<TimeoutRequest>,
) -> ApiResult<StatusCode> {
    service::set_sandbox_timeout(&state, &team, &sandbox_id, req.timeout).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for the POST /templates/{env_id}/builds/{build_id}/logs endpoint
///
/// Authorised by the build channel secret in the body, not by an API key.
pub async fn build_logs_handler(
    State(state): State<ServerState>,
    Path((template_id, build_id)): Path<(String, String)>,
    Json(req): Json<BuildLogsRequest>,
) -> ApiResult<StatusCode> {
    service::push_build_logs(&state, &template_id, &build_id, req).await?;
    Ok(StatusCode::CREATED)
}

/// Handler for the GET /templates/{env_id}/builds/{build_id}/status endpoint
pub async fn build_status_handler(
    State(state): State<ServerState>,
    Extension(AuthenticatedTeam(team)): Extension<AuthenticatedTeam>,
    Path((template_id, build_id)): Path<(String, String)>,
    Query(query): Query<BuildStatusQuery>,
) -> ApiResult<Json<BuildStatusResponse>> {
    let status =
        service::build_status(&state, &team, &template_id, &build_id, query.logs_offset).await?;
    Ok(Json(status))
}

/// Fallback for unknown routes
pub async fn not_found_handler() -> impl IntoResponse {
    ErrorResponse::new(404, "Route not found".to_string(), ErrorType::NotFound)
}

//-------------------------------------------------------------------------------------------------
// Functions: Helpers
//-------------------------------------------------------------------------------------------------

fn invalid_body(e: serde_json::Error) -> ErrorResponse {
    ErrorResponse::new(
        400,
        "Invalid request body".to_string(),
        ErrorType::ValidationError,
    )
    .with_details(e.to_string())
}
