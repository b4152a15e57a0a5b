//! A minimal client for the Firecracker API served on a UNIX socket.

use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;

use crate::{SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Routes every connection to one UNIX socket, whatever the URI says.
#[derive(Debug, Clone)]
struct UnixConnector {
    socket_path: PathBuf,
}

/// Talks to one Firecracker process.
#[derive(Debug, Clone)]
pub struct FirecrackerClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket_path: PathBuf,
}

/// Body of `PUT /snapshot/load`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotLoad {
    /// The VM state file.
    pub snapshot_path: PathBuf,

    /// Where guest memory comes from.
    pub mem_backend: MemBackend,

    /// Whether to track dirty pages for later diff snapshots.
    pub enable_diff_snapshots: bool,

    /// Whether to resume the VM right after loading.
    pub resume_vm: bool,
}

/// Guest memory source of a snapshot load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemBackend {
    /// The kind of backend.
    pub backend_type: MemBackendType,

    /// The memory file.
    pub backend_path: PathBuf,
}

/// Kinds of memory backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemBackendType {
    /// A memory file mapped into the guest.
    File,
}

/// The metadata a guest reads from MMDS. Field names are part of the guest agent contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmdsMetadata {
    /// The sandbox id.
    #[serde(rename = "instanceID")]
    pub instance_id: String,

    /// The template id.
    #[serde(rename = "envID")]
    pub env_id: String,

    /// The owning team.
    #[serde(rename = "teamID")]
    pub team_id: String,

    /// The logs proxy address.
    pub address: String,

    /// The trace the sandbox was created under.
    #[serde(rename = "traceID")]
    pub trace_id: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirecrackerClient {
    /// Creates a client for the API socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let socket_path = socket_path.into();
        let connector = UnixConnector {
            socket_path: socket_path.clone(),
        };

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            socket_path,
        }
    }

    /// The API socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Restores a snapshot.
    pub async fn load_snapshot(&self, body: &SnapshotLoad) -> SandhiveResult<()> {
        self.put("/snapshot/load", body).await
    }

    /// Replaces the MMDS contents.
    pub async fn put_mmds(&self, metadata: &MmdsMetadata) -> SandhiveResult<()> {
        self.put("/mmds", metadata).await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> SandhiveResult<()> {
        let uri: Uri = format!("http://localhost{path}")
            .parse()
            .map_err(SandhiveError::custom)?;
        let body = serde_json::to_vec(body)?;

        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Host", "localhost")
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(SandhiveError::custom)?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| SandhiveError::VmmApi(format!("PUT {path}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
            .unwrap_or_default();
        Err(SandhiveError::VmmApi(format!(
            "PUT {path}: {status}: {}",
            body.trim()
        )))
    }
}

impl MmdsMetadata {
    /// Builds the metadata of a sandbox.
    pub fn new(
        sandbox_id: impl Into<String>,
        template_id: impl Into<String>,
        team_id: impl Into<String>,
        logs_proxy_address: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: sandbox_id.into(),
            env_id: template_id.into(),
            team_id: team_id.into(),
            address: logs_proxy_address.into(),
            trace_id: trace_id.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl tower::Service<Uri> for UnixConnector {
    type Response = hyper_util::rt::TokioIo<UnixStream>;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let path = self.socket_path.clone();
        Box::pin(async move {
            let stream = UnixStream::connect(&path).await?;
            Ok(hyper_util::rt::TokioIo::new(stream))
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{extract::State, http::StatusCode, routing::put, Json, Router};
    use serde_json::Value;

    use super::*;

    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    async fn serve_fake_api(socket: &Path) -> anyhow::Result<Seen> {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/snapshot/load",
                put(|State(seen): State<Seen>, Json(body): Json<Value>| async move {
                    seen.lock().unwrap().push(("snapshot".into(), body));
                    StatusCode::NO_CONTENT
                }),
            )
            .route(
                "/mmds",
                put(|Json(_): Json<Value>| async {
                    (
                        StatusCode::BAD_REQUEST,
                        r#"{"fault_message":"mmds not configured"}"#,
                    )
                }),
            )
            .with_state(seen.clone());

        let listener = tokio::net::UnixListener::bind(socket)?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(seen)
    }

    #[tokio::test]
    async fn test_snapshot_load_body() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("fc.sock");
        let seen = serve_fake_api(&socket).await?;

        let client = FirecrackerClient::new(&socket);
        client
            .load_snapshot(&SnapshotLoad {
                snapshot_path: "/envs/tpl/snapfile".into(),
                mem_backend: MemBackend {
                    backend_type: MemBackendType::File,
                    backend_path: "/envs/tpl/memfile".into(),
                },
                enable_diff_snapshots: true,
                resume_vm: true,
            })
            .await?;

        let seen = seen.lock().unwrap();
        let body = &seen[0].1;
        assert_eq!(body["snapshot_path"], "/envs/tpl/snapfile");
        assert_eq!(body["mem_backend"]["backend_type"], "File");
        assert_eq!(body["mem_backend"]["backend_path"], "/envs/tpl/memfile");
        assert_eq!(body["enable_diff_snapshots"], true);
        assert_eq!(body["resume_vm"], true);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_status_surfaces_fault_message() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("fc.sock");
        serve_fake_api(&socket).await?;

        let err = FirecrackerClient::new(&socket)
            .put_mmds(&MmdsMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(&err, SandhiveError::VmmApi(msg) if msg.contains("mmds not configured")));
        Ok(())
    }

    #[test]
    fn test_mmds_field_names() -> anyhow::Result<()> {
        let metadata = MmdsMetadata::new("sbx", "tpl", "team", "10.0.0.1:30006", "trace");
        let value = serde_json::to_value(&metadata)?;
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["address", "envID", "instanceID", "teamID", "traceID"]);
        Ok(())
    }
}
