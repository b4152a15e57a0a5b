use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;

use crate::{SandhiveError, SandhiveResult};

use super::{
    data::ErrorResponse,
    handlers,
    state::{AuthenticatedTeam, ServerState},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Header carrying a team's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The HTTP control plane of a node.
pub struct SandhiveServer {
    state: ServerState,
    addr: SocketAddr,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandhiveServer {
    /// Create a new server instance
    pub fn new(state: ServerState, addr: SocketAddr) -> Self {
        Self { state, addr }
    }

    /// Serves until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> SandhiveResult<()> {
        let app = create_router(self.state);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("server listening on {}", self.addr);

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates the router with every endpoint.
///
/// Sandbox and build-status routes require a team API key. The health check and the build-logs
/// channel do not.
pub fn create_router(state: ServerState) -> Router {
    let authenticated = Router::new()
        .route(
            "/sandboxes",
            post(handlers::create_sandbox_handler).get(handlers::list_sandboxes_handler),
        )
        .route(
            "/sandboxes/{sandbox_id}",
            get(handlers::get_sandbox_handler).delete(handlers::kill_sandbox_handler),
        )
        .route(
            "/sandboxes/{sandbox_id}/refreshes",
            post(handlers::refresh_sandbox_handler),
        )
        .route(
            "/sandboxes/{sandbox_id}/timeout",
            post(handlers::set_timeout_handler),
        )
        .route(
            "/templates/{template_id}/builds/{build_id}/status",
            get(handlers::build_status_handler),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route(
            "/templates/{template_id}/builds/{build_id}/logs",
            post(handlers::build_logs_handler),
        )
        .merge(authenticated)
        .fallback(handlers::not_found_handler)
        .with_state(state)
}

/// Resolves the `X-API-Key` header to a team and stores it in the request extensions.
async fn auth_middleware(
    State(state): State<ServerState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let team = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|key| state.get_catalog().team_by_api_key(key))
        .cloned();

    match team {
        Some(team) => {
            req.extensions_mut().insert(AuthenticatedTeam(team));
            next.run(req).await
        }
        None => ErrorResponse::from(SandhiveError::Unauthorized(
            "missing or invalid api key".to_string(),
        ))
        .into_response(),
    }
}
