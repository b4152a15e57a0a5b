use async_trait::async_trait;
use tokio::process::{ChildStderr, ChildStdout};

use crate::HiveutilsResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A trait for monitoring the output of a supervised process
#[async_trait]
pub trait ProcessMonitor {
    /// Start monitoring a process, taking ownership of its output pipes
    async fn start(
        &mut self,
        pid: u32,
        stdout: ChildStdout,
        stderr: ChildStderr,
    ) -> HiveutilsResult<()>;

    /// Stop monitoring
    async fn stop(&mut self) -> HiveutilsResult<()>;
}
