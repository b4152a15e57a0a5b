use std::{path::PathBuf, sync::Arc};

use typed_builder::TypedBuilder;

use crate::{
    files::{remove_instance_files, InstanceFiles, RootfsCloner},
    network::NetworkBuilder,
    slot::{Slot, SlotAllocator},
    vmm::{MmdsMetadata, VmmLauncher, VmmSpec},
    AssemblyStep, SandhiveResult,
};

use super::{Instance, InstanceRequest};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Composes slot, network, files and VMM into an [`Instance`].
///
/// Acquisition is strictly ordered: reserve slot, build network, stage files, start VMM. A
/// failing step releases everything acquired before it, newest first, and the error names the
/// step. Every release is idempotent and logs instead of failing.
#[derive(TypedBuilder)]
pub struct InstanceAssembler {
    allocator: SlotAllocator,

    network: NetworkBuilder,

    cloner: Arc<dyn RootfsCloner>,

    launcher: Arc<dyn VmmLauncher>,

    #[builder(setter(into))]
    envs_root: PathBuf,

    #[builder(setter(into))]
    runtime_dir: PathBuf,

    /// Handed to guests through MMDS.
    #[builder(default, setter(into))]
    logs_proxy_address: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InstanceAssembler {
    /// The slot allocator.
    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    /// The network builder.
    pub fn network(&self) -> &NetworkBuilder {
        &self.network
    }

    /// Builds a sandbox.
    pub async fn assemble(&self, request: &InstanceRequest) -> SandhiveResult<Instance> {
        let sandbox_id = request.sandbox_id.as_str();

        let slot = self
            .allocator
            .reserve(sandbox_id)
            .await
            .map_err(|e| e.at_step(AssemblyStep::ReserveSlot))?;

        if let Err(e) = self.network.create(&slot).await {
            self.release_slot(&slot).await;
            return Err(e.at_step(AssemblyStep::BuildNetwork));
        }

        let files = match InstanceFiles::create(
            self.cloner.as_ref(),
            &self.envs_root,
            &self.runtime_dir,
            &request.template_id,
            sandbox_id,
        )
        .await
        {
            Ok(files) => files,
            Err(e) => {
                self.remove_network(&slot).await;
                self.release_slot(&slot).await;
                return Err(e.at_step(AssemblyStep::StageFiles));
            }
        };

        let spec = VmmSpec {
            slot: slot.clone(),
            files: files.clone(),
            metadata: MmdsMetadata::new(
                sandbox_id,
                &request.template_id,
                &request.team_id,
                &self.logs_proxy_address,
                &request.trace_id,
            ),
        };

        let vmm = match self.launcher.launch(spec).await {
            Ok(vmm) => vmm,
            Err(e) => {
                files.cleanup().await;
                self.remove_network(&slot).await;
                self.release_slot(&slot).await;
                return Err(e.at_step(AssemblyStep::StartVmm));
            }
        };

        tracing::info!(
            sandbox_id,
            template_id = %request.template_id,
            team_id = %request.team_id,
            slot_idx = slot.get_idx(),
            pid = vmm.pid(),
            "sandbox assembled"
        );
        Ok(Instance::new(&request.template_id, slot, files, vmm))
    }

    /// Releases the files, network and slot of an instance. The VMM must already be stopped.
    pub async fn cleanup(&self, instance: &Instance) {
        instance.get_files().cleanup().await;
        self.remove_network(instance.get_slot()).await;
        self.release_slot(instance.get_slot()).await;
    }

    /// Releases everything a sandbox may hold, knowing only its ids and slot.
    ///
    /// Used for sandboxes whose [`Instance`] did not survive a restart.
    pub async fn reclaim(&self, slot: &Slot, template_id: &str) {
        remove_instance_files(
            &self.envs_root,
            &self.runtime_dir,
            template_id,
            slot.get_sandbox_id(),
        )
        .await;
        self.remove_network(slot).await;
        self.release_slot(slot).await;
    }

    async fn remove_network(&self, slot: &Slot) {
        if let Err(e) = self.network.remove(slot).await {
            tracing::warn!(
                sandbox_id = %slot.get_sandbox_id(),
                slot_idx = slot.get_idx(),
                "failed to remove network: {e}"
            );
        }
    }

    async fn release_slot(&self, slot: &Slot) {
        if let Err(e) = self.allocator.release(slot).await {
            tracing::warn!(
                sandbox_id = %slot.get_sandbox_id(),
                slot_idx = slot.get_idx(),
                "failed to release slot: {e}"
            );
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use nix::sys::signal::Signal;

    use super::*;
    use crate::{slot::KvStore, testing::Harness, SandhiveError};

    fn request(sandbox_id: &str, template_id: &str) -> InstanceRequest {
        InstanceRequest {
            sandbox_id: sandbox_id.to_string(),
            template_id: template_id.to_string(),
            team_id: "T".to_string(),
            trace_id: "trace".to_string(),
        }
    }

    #[tokio::test]
    async fn test_assemble_then_cleanup_releases_everything() -> anyhow::Result<()> {
        let h = Harness::new().await;

        let instance = h.assembler.assemble(&request("sbx-1", "tpl")).await?;
        let slot = instance.get_slot().clone();
        assert!(h.kv.get(&slot.kv_key()).await?.is_some());
        assert!(h.net.has_namespace(&slot.namespace_name()));
        assert!(h.has_instance_dir("tpl", "sbx-1"));
        assert!(h.hosts().contains("sbx-1"));

        instance
            .get_vmm()
            .stop(std::time::Duration::from_secs(1), Signal::SIGTERM)
            .await?;
        h.assembler.cleanup(&instance).await;

        assert!(h.kv.get(&slot.kv_key()).await?.is_none());
        assert!(!h.net.has_namespace(&slot.namespace_name()));
        assert!(!h.has_instance_dir("tpl", "sbx-1"));
        assert!(!h.hosts().contains("sbx-1"));
        assert!(h.net.is_pristine());

        // Cleanup is idempotent.
        h.assembler.cleanup(&instance).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_network_failure_releases_slot() -> anyhow::Result<()> {
        let h = Harness::new().await;
        h.net.fail_when("MASQUERADE");

        let err = h
            .assembler
            .assemble(&request("sbx-1", "tpl"))
            .await
            .err()
            .expect("assembly fails");
        assert!(matches!(
            err,
            SandhiveError::Assembly {
                step: AssemblyStep::BuildNetwork,
                ..
            }
        ));
        assert!(matches!(
            err.root(),
            SandhiveError::NamespaceSetupFailed { .. }
        ));
        assert!(h.kv.is_empty().await);
        assert!(h.net.is_pristine());
        assert!(!h.has_instance_dir("tpl", "sbx-1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_template_unwinds_network() -> anyhow::Result<()> {
        let h = Harness::new().await;

        let err = h
            .assembler
            .assemble(&request("sbx-1", "nope"))
            .await
            .err()
            .expect("assembly fails");
        assert!(matches!(
            err,
            SandhiveError::Assembly {
                step: AssemblyStep::StageFiles,
                ..
            }
        ));
        assert!(h.kv.is_empty().await);
        assert!(h.net.is_pristine());
        assert!(!h.hosts().contains("sbx-1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_vmm_failure_unwinds_files() -> anyhow::Result<()> {
        let h = Harness::new().await;
        h.launcher.fail_launches(true);

        let err = h
            .assembler
            .assemble(&request("sbx-1", "tpl"))
            .await
            .err()
            .expect("assembly fails");
        assert!(matches!(
            err,
            SandhiveError::Assembly {
                step: AssemblyStep::StartVmm,
                ..
            }
        ));
        assert!(matches!(err.root(), SandhiveError::SnapshotLoadFailed(_)));
        assert!(!h.has_instance_dir("tpl", "sbx-1"));
        assert!(h.kv.is_empty().await);
        assert!(h.net.is_pristine());
        Ok(())
    }

    #[tokio::test]
    async fn test_reclaim_by_ids() -> anyhow::Result<()> {
        let h = Harness::new().await;
        let instance = h.assembler.assemble(&request("sbx-1", "tpl")).await?;
        let slot = Slot::new(
            h.assembler.allocator().node_short_id(),
            *instance.get_slot().get_idx(),
            "sbx-1",
        )?;

        h.assembler.reclaim(&slot, "tpl").await;
        assert!(h.kv.is_empty().await);
        assert!(h.net.is_pristine());
        assert!(!h.has_instance_dir("tpl", "sbx-1"));
        Ok(())
    }
}
