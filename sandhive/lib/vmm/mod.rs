//! Firecracker process supervision.
//!
//! A VMM is launched inside its sandbox's network namespace with the rootfs clone bind-mounted
//! over the build directory, then restored from the template snapshot over its API socket.

mod api;
mod firecracker;
mod monitor;

use std::{
    fmt::{self, Display},
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{files::InstanceFiles, slot::Slot, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use api::*;
pub use firecracker::*;
pub use monitor::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything needed to start the VMM of one sandbox.
#[derive(Debug, Clone)]
pub struct VmmSpec {
    /// The slot whose namespace the VMM runs in.
    pub slot: Slot,

    /// The staged files of the sandbox.
    pub files: InstanceFiles,

    /// The metadata pushed to MMDS once the snapshot is restored.
    pub metadata: MmdsMetadata,
}

/// How a VMM process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmmExit {
    /// The exit code, if the process exited on its own.
    pub code: Option<i32>,

    /// The signal that terminated the process, if any.
    pub signal: Option<i32>,
}

/// A running VMM.
#[async_trait]
pub trait Vmm: Send + Sync {
    /// The pid of the supervising process. It leads the VMM's process group.
    fn pid(&self) -> u32;

    /// A channel that turns `Some` once the process has exited.
    fn subscribe(&self) -> watch::Receiver<Option<VmmExit>>;

    /// The exit of the process, if it has already happened.
    fn exit(&self) -> Option<VmmExit> {
        let exit = self.subscribe();
        let current = *exit.borrow();
        current
    }

    /// Waits for the process to exit.
    async fn wait(&self) -> VmmExit {
        wait_for_exit(&mut self.subscribe()).await
    }

    /// Sends `signal` to the VMM and waits up to `timeout` for it to exit, then kills it.
    ///
    /// Stopping an exited VMM returns its exit right away.
    async fn stop(&self, timeout: Duration, signal: Signal) -> SandhiveResult<VmmExit>;
}

/// Starts VMMs.
#[async_trait]
pub trait VmmLauncher: Send + Sync {
    /// Spawns a VMM and restores its snapshot.
    ///
    /// On error no VMM process is left running.
    async fn launch(&self, spec: VmmSpec) -> SandhiveResult<Arc<dyn Vmm>>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmmExit {
    /// An exit with the given code.
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// An exit caused by a signal.
    pub fn with_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Whether the process exited with status 0.
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Waits until `exit` carries a value.
///
/// A closed channel is read as an unknown exit.
pub async fn wait_for_exit(exit: &mut watch::Receiver<Option<VmmExit>>) -> VmmExit {
    exit.wait_for(Option::is_some)
        .await
        .map(|value| *value)
        .ok()
        .flatten()
        .unwrap_or_default()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<ExitStatus> for VmmExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl Display for VmmExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
