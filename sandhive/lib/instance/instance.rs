use std::sync::Arc;

use getset::Getters;

use crate::{files::InstanceFiles, slot::Slot, vmm::Vmm};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a sandbox needs to start, beyond what the node already knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    /// The new sandbox id.
    pub sandbox_id: String,

    /// The template to restore.
    pub template_id: String,

    /// The owning team.
    pub team_id: String,

    /// The trace the request belongs to, handed to the guest.
    pub trace_id: String,
}

/// A fully assembled sandbox.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct Instance {
    /// The template the sandbox was restored from.
    template_id: String,

    /// The reserved slot.
    slot: Slot,

    /// The staged files.
    files: InstanceFiles,

    /// The running VMM.
    vmm: Arc<dyn Vmm>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Instance {
    pub(crate) fn new(
        template_id: impl Into<String>,
        slot: Slot,
        files: InstanceFiles,
        vmm: Arc<dyn Vmm>,
    ) -> Self {
        Self {
            template_id: template_id.into(),
            slot,
            files,
            vmm,
        }
    }

    /// The sandbox id.
    pub fn sandbox_id(&self) -> &str {
        self.slot.get_sandbox_id()
    }
}
