use std::{
    error::Error,
    fmt::{self, Display},
};

use axum::http::StatusCode;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a sandhive-related operation.
pub type SandhiveResult<T> = Result<T, SandhiveError>;

/// An error that occurred while managing sandboxes.
#[derive(pretty_error_debug::Debug, Error)]
pub enum SandhiveError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error raised by a shared utility.
    #[error(transparent)]
    Utils(#[from] hiveutils::HiveutilsError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred while (de)serializing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error returned by the task database.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error returned while migrating the task database.
    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// A required configuration value is missing or malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every slot index on the node is taken.
    #[error("no free network slot on node {node_short_id}")]
    SlotExhausted {
        /// The short node id whose key space is full.
        node_short_id: String,
    },

    /// A compare-and-set on a slot key was lost to another writer.
    #[error("lost the race for slot key {key}")]
    SlotRaceLost {
        /// The contested key.
        key: String,
    },

    /// A key-value store request failed.
    #[error("kv store error: {0}")]
    KvStore(String),

    /// Building the sandbox network failed; partial state was torn down.
    #[error("network setup failed at `{step}`: {reason}")]
    NamespaceSetupFailed {
        /// The step that failed.
        step: String,

        /// Why it failed.
        reason: String,
    },

    /// A template artifact is missing.
    #[error("template files missing: {0}")]
    FilesMissing(String),

    /// The filesystem refused to clone the rootfs copy-on-write.
    #[error("reflink of {path} failed: {reason}")]
    ReflinkFailed {
        /// The destination of the clone.
        path: String,

        /// Why it failed.
        reason: String,
    },

    /// The Firecracker API socket path does not fit `sun_path`.
    #[error("socket path {path} is {len} bytes, the limit is {max}")]
    SocketPathTooLong {
        /// The offending path.
        path: String,

        /// Its length in bytes.
        len: usize,

        /// The maximum allowed length.
        max: usize,
    },

    /// The VMM process could not be started.
    #[error("failed to spawn vmm: {0}")]
    VmmSpawnFailed(String),

    /// A request to the Firecracker API failed.
    #[error("firecracker api error: {0}")]
    VmmApi(String),

    /// Restoring the snapshot failed.
    #[error("snapshot load failed: {0}")]
    SnapshotLoadFailed(String),

    /// A step of sandbox assembly failed; everything before it was rolled back.
    #[error("sandbox assembly failed at {step}: {source}")]
    Assembly {
        /// The step that failed.
        step: AssemblyStep,

        /// The originating error.
        source: Box<SandhiveError>,
    },

    /// The team already runs as many sandboxes as its tier allows.
    #[error("team {team_id} has reached the maximum number of concurrent sandboxes ({limit})")]
    ConcurrencyCap {
        /// The team at its cap.
        team_id: String,

        /// The tier limit.
        limit: usize,
    },

    /// The sandbox has outlived its maximum lifetime and was evicted.
    #[error("sandbox {0} reached its maximum lifetime")]
    LifetimeExceeded(String),

    /// No sandbox with this id is known.
    #[error("sandbox {0} not found")]
    SandboxNotFound(String),

    /// The sandbox belongs to another team.
    #[error("sandbox {0} belongs to another team")]
    ForeignSandbox(String),

    /// A sandbox record is missing a required field.
    #[error("invalid sandbox: {0}")]
    InvalidSandbox(String),

    /// The template id or alias does not resolve.
    #[error("invalid template id: {0}")]
    InvalidTemplate(String),

    /// The template exists but the team may not use it.
    #[error("template {0} is not accessible to this team")]
    TemplateForbidden(String),

    /// The request carried no valid credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No task with this id is tracked by the driver.
    #[error("task {0} not found")]
    TaskNotFound(String),

    /// A non-forced destroy was requested for a task that is still running.
    #[error("task {0} is still running")]
    TaskRunning(String),

    /// Sandboxes are tied to their VMM process and cannot be re-attached.
    #[error("task {0} cannot be recovered after a driver restart")]
    RecoveryUnsupported(String),

    /// No build with this id is tracked.
    #[error("build {0} not found")]
    BuildNotFound(String),
}

/// The phases of sandbox assembly, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStep {
    /// Reserving the network slot in the KV store.
    ReserveSlot,

    /// Building the network namespace.
    BuildNetwork,

    /// Staging the instance files.
    StageFiles,

    /// Spawning the VMM and restoring the snapshot.
    StartVmm,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandhiveError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> SandhiveError {
        SandhiveError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps an error with the assembly step it came from.
    pub fn at_step(self, step: AssemblyStep) -> SandhiveError {
        SandhiveError::Assembly {
            step,
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, looking through assembly wrappers.
    pub fn root(&self) -> &SandhiveError {
        match self {
            SandhiveError::Assembly { source, .. } => source.root(),
            other => other,
        }
    }

    /// The HTTP status this error surfaces as.
    pub fn status_code(&self) -> StatusCode {
        match self.root() {
            SandhiveError::SlotExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SandhiveError::ConcurrencyCap { .. } | SandhiveError::TemplateForbidden(_) => {
                StatusCode::FORBIDDEN
            }
            SandhiveError::ForeignSandbox(_) | SandhiveError::Unauthorized(_) => {
                StatusCode::UNAUTHORIZED
            }
            SandhiveError::SandboxNotFound(_)
            | SandhiveError::LifetimeExceeded(_)
            | SandhiveError::TaskNotFound(_)
            | SandhiveError::BuildNotFound(_) => StatusCode::NOT_FOUND,
            SandhiveError::InvalidTemplate(_) | SandhiveError::InvalidSandbox(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `SandhiveResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> SandhiveResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AssemblyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssemblyStep::ReserveSlot => "reserve_slot",
            AssemblyStep::BuildNetwork => "build_network",
            AssemblyStep::StageFiles => "stage_files",
            AssemblyStep::StartVmm => "start_vmm",
        };
        write!(f, "{}", name)
    }
}

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_looks_through_assembly_steps() {
        let err = SandhiveError::SlotExhausted {
            node_short_id: "abcdefgh".into(),
        }
        .at_step(AssemblyStep::ReserveSlot);
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = SandhiveError::NamespaceSetupFailed {
            step: "append nat POSTROUTING".into(),
            reason: "boom".into(),
        }
        .at_step(AssemblyStep::BuildNetwork);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("build_network"));
    }

    #[test]
    fn test_concurrency_cap_message_carries_limit() {
        let err = SandhiveError::ConcurrencyCap {
            team_id: "T".into(),
            limit: 2,
        };
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert!(err.to_string().contains("(2)"));
    }
}
