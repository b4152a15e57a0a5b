use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vmm::VmmExit;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The configuration a task is started with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// The sandbox id, also the task id.
    pub sandbox_id: String,

    /// The template to restore.
    pub template_id: String,

    /// The owning team.
    pub team_id: String,

    /// The trace the sandbox is created under.
    #[serde(default)]
    pub trace_id: String,

    /// Caller-supplied metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// The VMM is running.
    Running,

    /// The VMM has exited; the task awaits destruction.
    Exited,
}

/// A snapshot of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// The task id.
    pub id: String,

    /// The template the sandbox runs.
    pub template_id: String,

    /// The owning team.
    pub team_id: String,

    /// The current state.
    pub state: TaskState,

    /// The pid of the VMM's supervising process.
    pub pid: u32,

    /// The network slot.
    pub slot_idx: u32,

    /// When the task started.
    pub started_at: DateTime<Utc>,

    /// When the VMM exited.
    pub exited_at: Option<DateTime<Utc>>,

    /// The VMM's exit code.
    pub exit_code: Option<i32>,

    /// The signal that ended the VMM.
    pub exit_signal: Option<i32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TaskStatus {
    /// Whether the VMM is still running.
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    pub(crate) fn set_exit(&mut self, exit: Option<VmmExit>, exited_at: Option<DateTime<Utc>>) {
        if let Some(exit) = exit {
            self.state = TaskState::Exited;
            self.exit_code = exit.code;
            self.exit_signal = exit.signal;
            self.exited_at = exited_at.or_else(|| Some(Utc::now()));
        }
    }
}
