use std::collections::HashMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    cache::{BuildInfo, BuildStatus, Sandbox},
    SandhiveError,
};

//--------------------------------------------------------------------------------------------------
// Types: Requests
//--------------------------------------------------------------------------------------------------

/// Request body for creating a sandbox
#[derive(Debug, Clone, Deserialize)]
pub struct NewSandboxRequest {
    /// Template id or alias
    #[serde(alias = "env_id", alias = "templateID")]
    pub template_id: String,

    /// Metadata attached to the sandbox
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Request body for extending a sandbox's TTL. The body may be empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshRequest {
    /// Requested TTL in seconds
    pub duration: Option<u64>,
}

/// Request body for replacing a sandbox's TTL
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutRequest {
    /// TTL in seconds. Zero or less kills the sandbox.
    pub timeout: i64,
}

/// Request body pushed by the build service
#[derive(Debug, Clone, Deserialize)]
pub struct BuildLogsRequest {
    /// Shared secret of the build channel
    pub api_secret: String,

    /// Log lines to append
    #[serde(default)]
    pub logs: Vec<String>,

    /// New build status, if it changed
    pub status: Option<BuildStatus>,
}

/// Query of the build status endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildStatusQuery {
    /// Index of the first log line to return
    #[serde(default)]
    pub logs_offset: usize,
}

//--------------------------------------------------------------------------------------------------
// Types: Responses
//--------------------------------------------------------------------------------------------------

/// A created sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSandbox {
    /// The new sandbox id
    pub sandbox_id: String,

    /// The node running the sandbox
    pub client_id: String,

    /// The resolved template id
    pub template_id: String,

    /// The template alias, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// A running sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningSandbox {
    /// The sandbox id
    pub sandbox_id: String,

    /// The node running the sandbox
    pub client_id: String,

    /// The template id
    pub template_id: String,

    /// The template alias, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// When the sandbox started
    pub started_at: Option<DateTime<Utc>>,

    /// Metadata attached at creation
    pub metadata: HashMap<String, String>,
}

/// Status and logs of a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatusResponse {
    /// The build id
    pub build_id: String,

    /// The template being built
    pub template_id: String,

    /// The current status
    pub status: BuildStatus,

    /// Log lines from the requested offset
    pub logs: Vec<String>,
}

/// Response of the health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: String,

    /// Number of sandboxes in the cache
    pub sandboxes: usize,
}

//--------------------------------------------------------------------------------------------------
// Types: Error Response
//--------------------------------------------------------------------------------------------------

/// Standard error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub code: u16,

    /// Error message
    pub message: String,

    /// Error type for categorizing errors
    pub error_type: ErrorType,

    /// Optional additional details about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Types of errors that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Invalid request parameters or body
    ValidationError,

    /// Missing or wrong credentials
    AuthenticationError,

    /// The caller may not perform the operation
    Forbidden,

    /// Resource not found
    NotFound,

    /// No capacity left on the node
    Unavailable,

    /// Sandbox operation errors
    SandboxError,

    /// Internal server errors
    InternalError,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: u16, message: String, error_type: ErrorType) -> Self {
        Self {
            code,
            message,
            error_type,
            details: None,
        }
    }

    /// Add details to the error response, ignoring details for 500-level errors
    pub fn with_details(mut self, details: String) -> Self {
        if self.code < 500 {
            self.details = Some(details);
        }
        self
    }

    /// Builds the response an error surfaces as.
    pub fn from_error(error: &SandhiveError) -> Self {
        let status = error.status_code();
        let (message, error_type) = match status {
            StatusCode::BAD_REQUEST => ("Invalid request", ErrorType::ValidationError),
            StatusCode::UNAUTHORIZED => ("Unauthorized", ErrorType::AuthenticationError),
            StatusCode::FORBIDDEN => ("Forbidden", ErrorType::Forbidden),
            StatusCode::NOT_FOUND => ("Not found", ErrorType::NotFound),
            StatusCode::SERVICE_UNAVAILABLE => ("No capacity left", ErrorType::Unavailable),
            _ => match error {
                SandhiveError::Assembly { .. } => {
                    ("Failed to create sandbox", ErrorType::SandboxError)
                }
                _ => ("Internal server error", ErrorType::InternalError),
            },
        };

        // 4xx callers get the full reason; the cap message carries the tier limit.
        let message = if status.is_client_error() {
            error.root().to_string()
        } else {
            message.to_string()
        };

        Self::new(status.as_u16(), message, error_type).with_details(error.to_string())
    }
}

impl From<&Sandbox> for RunningSandbox {
    fn from(sandbox: &Sandbox) -> Self {
        Self {
            sandbox_id: sandbox.get_sandbox_id().clone(),
            client_id: sandbox.get_client_id().clone(),
            template_id: sandbox.get_template_id().clone(),
            alias: sandbox.get_alias().clone(),
            started_at: *sandbox.get_start_time(),
            metadata: sandbox.get_metadata().clone(),
        }
    }
}

impl BuildStatusResponse {
    /// Builds the response from the cached build, skipping the first `logs_offset` lines.
    pub fn from_info(info: BuildInfo, logs_offset: usize) -> Self {
        Self {
            build_id: info.build_id,
            template_id: info.template_id,
            status: info.status,
            logs: info.logs.into_iter().skip(logs_offset).collect(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<SandhiveError> for ErrorResponse {
    fn from(error: SandhiveError) -> Self {
        let response = Self::from_error(&error);
        if response.code >= 500 {
            tracing::error!("request failed: {error}");
        }
        response
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
