use async_trait::async_trait;
use hiveutils::{HiveutilsResult, ProcessMonitor};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{ChildStderr, ChildStdout},
    task::JoinHandle,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Re-emits a VMM's output as tracing events tagged with its sandbox.
pub struct VmmLogMonitor {
    sandbox_id: String,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmmLogMonitor {
    /// Creates a monitor for a sandbox's VMM.
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            tasks: Vec::new(),
        }
    }

    fn drain<R>(&self, pid: u32, reader: R, stream: Stream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sandbox_id = self.sandbox_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match stream {
                        Stream::Stdout => tracing::info!(sandbox_id = %sandbox_id, pid, "vmm: {line}"),
                        Stream::Stderr => tracing::warn!(sandbox_id = %sandbox_id, pid, "vmm: {line}"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(sandbox_id = %sandbox_id, pid, "vmm output closed: {e}");
                        break;
                    }
                }
            }
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ProcessMonitor for VmmLogMonitor {
    async fn start(
        &mut self,
        pid: u32,
        stdout: ChildStdout,
        stderr: ChildStderr,
    ) -> HiveutilsResult<()> {
        let out = self.drain(pid, stdout, Stream::Stdout);
        let err = self.drain(pid, stderr, Stream::Stderr);
        self.tasks.extend([out, err]);
        Ok(())
    }

    async fn stop(&mut self) -> HiveutilsResult<()> {
        // Let the readers hit EOF on their own; only stragglers are cut off.
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(std::time::Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
                tracing::debug!(sandbox_id = %self.sandbox_id, "vmm output reader aborted");
            }
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
